//! Scan row operations: insert, lookup, ancestor/descendant queries, GC.

use crate::error::{CatalogError, Result};
use crate::Catalog;
use disktree_protocol::{ScanRecord, Uri};
use sqlx::Row;

const SCAN_COLUMNS: &str = "id, root_uri, completed_at, blob_id, root_size, root_n_children, \
                            root_n_desc, error_count, error_paths, needs_repair";

/// A scan row about to be committed, before the catalog assigns its id.
#[derive(Debug, Clone)]
pub struct NewScan {
    pub root_uri: Uri,
    pub completed_at: i64,
    pub blob_id: String,
    pub root_size: u64,
    pub root_n_children: u32,
    pub root_n_desc: u64,
    pub error_count: u64,
    pub error_paths: Vec<String>,
}

/// Bounded retries with jitter for writes that hit the SQLite writer lock.
const CONFLICT_RETRIES: u32 = 3;

fn conflict_backoff(attempt: u32) -> std::time::Duration {
    let jitter = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 % 25)
        .unwrap_or(0);
    std::time::Duration::from_millis(20u64 * attempt as u64 + jitter)
}

impl Catalog {
    /// Commit a completed scan. The blob must already be durable.
    pub async fn insert_scan(&self, scan: &NewScan) -> Result<i64> {
        let mut attempt = 0u32;
        loop {
            match self.insert_scan_once(scan).await {
                Err(err) if err.is_conflict() && attempt < CONFLICT_RETRIES => {
                    attempt += 1;
                    let backoff = conflict_backoff(attempt);
                    tracing::warn!(attempt, ?backoff, "Catalog write conflict, retrying");
                    tokio::time::sleep(backoff).await;
                }
                other => return other,
            }
        }
    }

    async fn insert_scan_once(&self, scan: &NewScan) -> Result<i64> {
        let error_paths = serde_json::to_string(&scan.error_paths)?;

        let result = sqlx::query(
            r#"
            INSERT INTO scan (root_uri, completed_at, blob_id, root_size,
                              root_n_children, root_n_desc, error_count, error_paths)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(scan.root_uri.as_str())
        .bind(scan.completed_at)
        .bind(&scan.blob_id)
        .bind(scan.root_size as i64)
        .bind(scan.root_n_children as i64)
        .bind(scan.root_n_desc as i64)
        .bind(scan.error_count as i64)
        .bind(&error_paths)
        .execute(self.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Fetch a scan by id.
    pub async fn get_scan(&self, id: i64) -> Result<Option<ScanRecord>> {
        let row = sqlx::query(&format!("SELECT {SCAN_COLUMNS} FROM scan WHERE id = ?"))
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        match row {
            Some(row) => Ok(Some(row_to_scan(&row)?)),
            None => Ok(None),
        }
    }

    /// One row per root_uri, newest first.
    pub async fn latest_per_root(&self) -> Result<Vec<ScanRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SCAN_COLUMNS}
            FROM scan s
            WHERE s.completed_at = (
                SELECT MAX(completed_at) FROM scan WHERE root_uri = s.root_uri
            )
            GROUP BY s.root_uri
            ORDER BY s.completed_at DESC
            "#
        ))
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(row_to_scan).collect()
    }

    /// Every scan whose root is the given URI or an ancestor, newest first.
    pub async fn history_for(&self, uri: &Uri) -> Result<Vec<ScanRecord>> {
        let ancestors = uri.ancestors();
        let placeholders = vec!["?"; ancestors.len()].join(", ");

        let sql = format!(
            "SELECT {SCAN_COLUMNS} FROM scan WHERE root_uri IN ({placeholders}) \
             ORDER BY completed_at DESC"
        );
        let mut query = sqlx::query(&sql);
        for anc in &ancestors {
            query = query.bind(anc.as_str());
        }

        let rows = query.fetch_all(self.pool()).await?;
        rows.iter().map(row_to_scan).collect()
    }

    /// The most recent usable scan whose root covers the URI.
    ///
    /// Rows flagged `needs_repair` are skipped: the planner must not serve
    /// aggregates that a deferred repair has invalidated.
    pub async fn ancestor_scan_for(&self, uri: &Uri) -> Result<Option<ScanRecord>> {
        let ancestors = uri.ancestors();
        let placeholders = vec!["?"; ancestors.len()].join(", ");

        let sql = format!(
            "SELECT {SCAN_COLUMNS} FROM scan \
             WHERE root_uri IN ({placeholders}) AND needs_repair = 0 \
             ORDER BY completed_at DESC LIMIT 1"
        );
        let mut query = sqlx::query(&sql);
        for anc in &ancestors {
            query = query.bind(anc.as_str());
        }

        let row = query.fetch_optional(self.pool()).await?;
        match row {
            Some(row) => Ok(Some(row_to_scan(&row)?)),
            None => Ok(None),
        }
    }

    /// Scans rooted strictly below `uri` completed after `since`, newest
    /// first. These are the patch candidates for a view of `uri`.
    pub async fn fresher_children_of(&self, uri: &Uri, since: i64) -> Result<Vec<ScanRecord>> {
        let pattern = format!("{}/%", escape_like(uri.as_str()));

        let rows = sqlx::query(&format!(
            r#"
            SELECT {SCAN_COLUMNS} FROM scan
            WHERE root_uri LIKE ? ESCAPE '\'
              AND completed_at > ?
              AND needs_repair = 0
            ORDER BY completed_at DESC
            "#
        ))
        .bind(&pattern)
        .bind(since)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(row_to_scan).collect()
    }

    /// All scans (including repair-flagged ones) whose snapshot contains
    /// `uri`, i.e. whose root is the URI itself or an ancestor.
    pub async fn scans_covering(&self, uri: &Uri) -> Result<Vec<ScanRecord>> {
        let ancestors = uri.ancestors();
        let placeholders = vec!["?"; ancestors.len()].join(", ");

        let sql = format!(
            "SELECT {SCAN_COLUMNS} FROM scan WHERE root_uri IN ({placeholders}) \
             ORDER BY completed_at DESC"
        );
        let mut query = sqlx::query(&sql);
        for anc in &ancestors {
            query = query.bind(anc.as_str());
        }

        let rows = query.fetch_all(self.pool()).await?;
        rows.iter().map(row_to_scan).collect()
    }

    /// Scans rooted at or strictly below `uri`.
    pub async fn scans_under(&self, uri: &Uri) -> Result<Vec<ScanRecord>> {
        let pattern = format!("{}/%", escape_like(uri.as_str()));

        let rows = sqlx::query(&format!(
            r#"
            SELECT {SCAN_COLUMNS} FROM scan
            WHERE root_uri = ? OR root_uri LIKE ? ESCAPE '\'
            ORDER BY completed_at DESC
            "#
        ))
        .bind(uri.as_str())
        .bind(&pattern)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(row_to_scan).collect()
    }

    /// Delete a scan row. The caller owns blob deletion.
    pub async fn delete_scan(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM scan WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Flag or clear the deferred-repair marker.
    pub async fn mark_needs_repair(&self, id: i64, needs_repair: bool) -> Result<()> {
        sqlx::query("UPDATE scan SET needs_repair = ? WHERE id = ?")
            .bind(needs_repair as i64)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Swap in a repaired blob and refresh the denormalized root aggregates.
    pub async fn update_scan_after_repair(
        &self,
        id: i64,
        blob_id: &str,
        root_size: u64,
        root_n_children: u32,
        root_n_desc: u64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scan SET blob_id = ?, root_size = ?, root_n_children = ?,
                            root_n_desc = ?, needs_repair = 0
            WHERE id = ?
            "#,
        )
        .bind(blob_id)
        .bind(root_size as i64)
        .bind(root_n_children as i64)
        .bind(root_n_desc as i64)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Rows eligible for eviction: everything except the newest snapshot
    /// per root and anything completed after `cutoff`.
    pub async fn gc_candidates(&self, cutoff: i64) -> Result<Vec<ScanRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SCAN_COLUMNS} FROM scan s
            WHERE s.completed_at < ?
              AND s.completed_at < (
                  SELECT MAX(completed_at) FROM scan WHERE root_uri = s.root_uri
              )
            ORDER BY s.completed_at ASC
            "#
        ))
        .bind(cutoff)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(row_to_scan).collect()
    }

    /// Every blob id the catalog still references.
    pub async fn referenced_blob_ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT blob_id FROM scan")
            .fetch_all(self.pool())
            .await?;
        Ok(rows.iter().map(|row| row.get("blob_id")).collect())
    }
}

fn row_to_scan(row: &sqlx::sqlite::SqliteRow) -> Result<ScanRecord> {
    let root_uri: String = row.get("root_uri");
    let root_uri = Uri::parse(&root_uri)
        .map_err(|e| CatalogError::invalid_row(format!("bad root_uri: {e}")))?;

    let error_paths_json: String = row.get("error_paths");
    let error_paths: Vec<String> = serde_json::from_str(&error_paths_json)?;

    Ok(ScanRecord {
        id: row.get("id"),
        root_uri,
        completed_at: row.get("completed_at"),
        blob_id: row.get("blob_id"),
        root_size: row.get::<i64, _>("root_size") as u64,
        root_n_children: row.get::<i64, _>("root_n_children") as u32,
        root_n_desc: row.get::<i64, _>("root_n_desc") as u64,
        error_count: row.get::<i64, _>("error_count") as u64,
        error_paths,
        needs_repair: row.get::<i64, _>("needs_repair") != 0,
    })
}

/// Escape `%`, `_` and the escape character itself for a LIKE pattern.
fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn uri(s: &str) -> Uri {
        Uri::parse(s).unwrap()
    }

    fn scan_at(root: &str, time: i64, blob: &str) -> NewScan {
        NewScan {
            root_uri: uri(root),
            completed_at: time,
            blob_id: blob.to_string(),
            root_size: 100,
            root_n_children: 2,
            root_n_desc: 10,
            error_count: 0,
            error_paths: Vec::new(),
        }
    }

    async fn open_catalog(tmp: &TempDir) -> Catalog {
        Catalog::open(tmp.path().join("catalog.db")).await.unwrap()
    }

    #[tokio::test]
    async fn ancestor_lookup_prefers_most_recent_covering_scan() {
        let tmp = TempDir::new().unwrap();
        let catalog = open_catalog(&tmp).await;

        catalog.insert_scan(&scan_at("/home", 100, "b1")).await.unwrap();
        catalog.insert_scan(&scan_at("/home/u", 50, "b2")).await.unwrap();

        let anc = catalog
            .ancestor_scan_for(&uri("/home/u/docs"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(anc.root_uri, uri("/home"));
        assert_eq!(anc.completed_at, 100);

        // A sibling is never an ancestor
        assert!(catalog
            .ancestor_scan_for(&uri("/var/log"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn ancestor_lookup_skips_repair_flagged_rows() {
        let tmp = TempDir::new().unwrap();
        let catalog = open_catalog(&tmp).await;

        let newer = catalog.insert_scan(&scan_at("/a", 200, "b1")).await.unwrap();
        catalog.insert_scan(&scan_at("/a", 100, "b2")).await.unwrap();
        catalog.mark_needs_repair(newer, true).await.unwrap();

        let anc = catalog.ancestor_scan_for(&uri("/a/x")).await.unwrap().unwrap();
        assert_eq!(anc.completed_at, 100);
    }

    #[tokio::test]
    async fn fresher_children_are_strict_descendants_newer_than_since() {
        let tmp = TempDir::new().unwrap();
        let catalog = open_catalog(&tmp).await;

        catalog.insert_scan(&scan_at("/a", 100, "b1")).await.unwrap();
        catalog.insert_scan(&scan_at("/a/b", 200, "b2")).await.unwrap();
        catalog.insert_scan(&scan_at("/a/c", 50, "b3")).await.unwrap();
        catalog.insert_scan(&scan_at("/ab", 300, "b4")).await.unwrap();

        let fresher = catalog.fresher_children_of(&uri("/a"), 100).await.unwrap();
        assert_eq!(fresher.len(), 1);
        assert_eq!(fresher[0].root_uri, uri("/a/b"));
    }

    #[tokio::test]
    async fn latest_per_root_collapses_history() {
        let tmp = TempDir::new().unwrap();
        let catalog = open_catalog(&tmp).await;

        catalog.insert_scan(&scan_at("/a", 100, "b1")).await.unwrap();
        catalog.insert_scan(&scan_at("/a", 300, "b2")).await.unwrap();
        catalog.insert_scan(&scan_at("/b", 200, "b3")).await.unwrap();

        let latest = catalog.latest_per_root().await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].root_uri, uri("/a"));
        assert_eq!(latest[0].completed_at, 300);
        assert_eq!(latest[1].root_uri, uri("/b"));
    }

    #[tokio::test]
    async fn history_includes_ancestors_only() {
        let tmp = TempDir::new().unwrap();
        let catalog = open_catalog(&tmp).await;

        catalog.insert_scan(&scan_at("/", 10, "b1")).await.unwrap();
        catalog.insert_scan(&scan_at("/a", 20, "b2")).await.unwrap();
        catalog.insert_scan(&scan_at("/a/b", 30, "b3")).await.unwrap();
        catalog.insert_scan(&scan_at("/a/b/c", 40, "b4")).await.unwrap();

        let history = catalog.history_for(&uri("/a/b")).await.unwrap();
        let roots: Vec<&str> = history.iter().map(|s| s.root_uri.as_str()).collect();
        assert_eq!(roots, vec!["/a/b", "/a", "/"]);
    }

    #[tokio::test]
    async fn gc_keeps_newest_per_root() {
        let tmp = TempDir::new().unwrap();
        let catalog = open_catalog(&tmp).await;

        catalog.insert_scan(&scan_at("/a", 100, "b1")).await.unwrap();
        catalog.insert_scan(&scan_at("/a", 200, "b2")).await.unwrap();
        catalog.insert_scan(&scan_at("/b", 50, "b3")).await.unwrap();

        // Cutoff after everything: only the superseded /a@100 is evictable
        let candidates = catalog.gc_candidates(1_000).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].blob_id, "b1");

        // Recent rows survive even when superseded
        let candidates = catalog.gc_candidates(150).await.unwrap();
        assert_eq!(candidates.len(), 1);

        let candidates = catalog.gc_candidates(100).await.unwrap();
        assert!(candidates.is_empty());
    }
}
