//! # Sync Attempt Log
//!
//! Append-only history of outbound sync attempts, kept for the dashboard
//! and for operator diagnostics.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::DbResult;

/// One recorded sync attempt.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SyncLogEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    /// "success", "failed" or "poisoned".
    pub status: String,
    pub detail: Option<String>,
    pub results_synced: i64,
}

/// Repository for the sync attempt log.
#[derive(Debug, Clone)]
pub struct SyncLogRepository {
    pool: SqlitePool,
}

impl SyncLogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SyncLogRepository { pool }
    }

    /// Appends an attempt record.
    pub async fn record(&self, status: &str, detail: &str, results_synced: i64) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_log (timestamp, status, detail, results_synced)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(Utc::now())
        .bind(status)
        .bind(detail)
        .bind(results_synced)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent attempts, newest first.
    pub async fn recent(&self, limit: u32) -> DbResult<Vec<SyncLogEntry>> {
        Ok(sqlx::query_as::<_, SyncLogEntry>(
            "SELECT * FROM sync_log ORDER BY id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use crate::pool::{Database, DbConfig};

    #[tokio::test]
    async fn record_and_read_back() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.sync_log().record("success", "HTTP 200", 3).await.unwrap();
        db.sync_log().record("failed", "HTTP 503", 0).await.unwrap();

        let entries = db.sync_log().recent(10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, "failed");
        assert_eq!(entries[1].results_synced, 3);
    }
}
