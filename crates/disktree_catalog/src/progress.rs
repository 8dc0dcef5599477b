//! Ephemeral scan_progress rows for in-flight scans.

use crate::error::{CatalogError, Result};
use crate::Catalog;
use disktree_protocol::{ProgressStatus, ScanProgressRow, Uri};
use sqlx::Row;

impl Catalog {
    /// Register an in-flight scan. One row per root_uri; a retry after a
    /// crash replaces the stale row.
    pub async fn progress_start(&self, root_uri: &Uri, worker_pid: i64) -> Result<i64> {
        let now = Self::now();

        sqlx::query(
            r#"
            INSERT INTO scan_progress (root_uri, worker_pid, started_at, status)
            VALUES (?, ?, ?, 'running')
            ON CONFLICT(root_uri) DO UPDATE SET
                worker_pid = excluded.worker_pid,
                started_at = excluded.started_at,
                items_found = 0,
                items_per_sec = NULL,
                error_count = 0,
                status = 'running'
            "#,
        )
        .bind(root_uri.as_str())
        .bind(worker_pid)
        .bind(now)
        .execute(self.pool())
        .await?;

        let row = sqlx::query("SELECT id FROM scan_progress WHERE root_uri = ?")
            .bind(root_uri.as_str())
            .fetch_one(self.pool())
            .await?;
        Ok(row.get("id"))
    }

    /// Update counters for an in-flight scan.
    pub async fn progress_update(
        &self,
        id: i64,
        items_found: u64,
        error_count: u64,
        items_per_sec: Option<f64>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE scan_progress SET items_found = ?, error_count = ?, items_per_sec = ? \
             WHERE id = ?",
        )
        .bind(items_found as i64)
        .bind(error_count as i64)
        .bind(items_per_sec)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Move a progress row to a terminal status (kept briefly for observers).
    pub async fn progress_finish(&self, id: i64, status: ProgressStatus) -> Result<()> {
        sqlx::query("UPDATE scan_progress SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Remove a progress row.
    pub async fn progress_delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM scan_progress WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// All rows still marked running.
    pub async fn progress_running(&self) -> Result<Vec<ScanProgressRow>> {
        let rows = sqlx::query(
            "SELECT * FROM scan_progress WHERE status = 'running' ORDER BY started_at ASC",
        )
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(row_to_progress).collect()
    }

    /// Drop rows left behind by workers that no longer exist. Called at
    /// scheduler startup.
    pub async fn progress_purge_stale(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM scan_progress")
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_progress(row: &sqlx::sqlite::SqliteRow) -> Result<ScanProgressRow> {
    let root_uri: String = row.get("root_uri");
    let root_uri = Uri::parse(&root_uri)
        .map_err(|e| CatalogError::invalid_row(format!("bad root_uri: {e}")))?;

    let status_str: String = row.get("status");
    let status = ProgressStatus::parse(&status_str)
        .ok_or_else(|| CatalogError::invalid_row(format!("unknown status: {status_str}")))?;

    Ok(ScanProgressRow {
        id: row.get("id"),
        root_uri,
        worker_pid: row.get("worker_pid"),
        started_at: row.get("started_at"),
        items_found: row.get::<i64, _>("items_found") as u64,
        items_per_sec: row.get("items_per_sec"),
        error_count: row.get::<i64, _>("error_count") as u64,
        status,
    })
}
