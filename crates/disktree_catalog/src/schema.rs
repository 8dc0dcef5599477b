//! Catalog schema creation.
//!
//! All CREATE TABLE statements live here - single source of truth.

use crate::error::Result;
use crate::Catalog;
use tracing::info;

impl Catalog {
    /// Ensure all tables and indices exist.
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        // WAL gives lock-free snapshot reads alongside the single writer
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(self.pool())
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(self.pool())
            .await?;
        sqlx::query("PRAGMA foreign_keys=ON")
            .execute(self.pool())
            .await?;

        // Completed scans; root_* columns denormalize the snapshot root
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS scan (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                root_uri TEXT NOT NULL,
                completed_at INTEGER NOT NULL,
                blob_id TEXT NOT NULL UNIQUE,
                root_size INTEGER NOT NULL,
                root_n_children INTEGER NOT NULL,
                root_n_desc INTEGER NOT NULL,
                error_count INTEGER NOT NULL DEFAULT 0,
                error_paths TEXT NOT NULL DEFAULT '[]',
                needs_repair INTEGER NOT NULL DEFAULT 0
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_scan_root ON scan(root_uri)")
            .execute(self.pool())
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_scan_root_time ON scan(root_uri, completed_at DESC)",
        )
        .execute(self.pool())
        .await?;

        // In-flight scans; rows are removed when the scan terminates
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS scan_progress (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                root_uri TEXT NOT NULL UNIQUE,
                worker_pid INTEGER NOT NULL,
                started_at INTEGER NOT NULL,
                items_found INTEGER NOT NULL DEFAULT 0,
                items_per_sec REAL,
                error_count INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'running'
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_progress_status ON scan_progress(status)")
            .execute(self.pool())
            .await?;

        info!("Catalog schema verified");
        Ok(())
    }
}
