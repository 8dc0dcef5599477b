//! Durable scan catalog for disktree.
//!
//! The catalog is the single shared mutable store: it records one row per
//! completed scan (with denormalized root aggregates, so listing and
//! planning never open a blob) and one ephemeral row per in-flight scan.
//! Readers run against SQLite's WAL snapshot; writes are serialized by the
//! single writer lock.
//!
//! # Usage
//!
//! ```rust,ignore
//! use disktree_catalog::{Catalog, Result};
//!
//! let catalog = Catalog::open("~/.disktree/disktree.sqlite3").await?;
//! let latest = catalog.latest_per_root().await?;
//! let anc = catalog.ancestor_scan_for(&uri).await?;
//! ```

mod error;
mod progress;
mod scans;
mod schema;

pub use error::{CatalogError, Result};
pub use scans::NewScan;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;
use tracing::info;

/// Handle to the catalog database.
///
/// All SQL lives in this crate; other crates go through the typed methods.
#[derive(Clone)]
pub struct Catalog {
    pool: SqlitePool,
}

impl Catalog {
    /// Open or create a catalog at the given path.
    ///
    /// Creates the schema if it does not exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let catalog = Self { pool };
        catalog.ensure_schema().await?;

        info!(path = %path.display(), "Catalog opened");

        Ok(catalog)
    }

    /// Open an existing catalog (fails if the file is missing).
    pub async fn open_existing(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(CatalogError::not_found(format!(
                "Catalog not found: {}",
                path.display()
            )));
        }

        let url = format!("sqlite:{}?mode=rw", path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        Ok(Self { pool })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the catalog connection.
    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Current time as epoch seconds.
    pub fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }
}
