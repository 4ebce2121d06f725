//! # Result Repository
//!
//! Result rows carry the outbound sync bookkeeping (status, attempt
//! counter, next attempt time). The mutators here are only called by the
//! sync engine; the ingest path writes results exclusively through
//! `Database::store_message`.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use lablink_core::{SyncStatus, TestResult};

use crate::error::{DbError, DbResult};

/// A pending result joined with its owning patient, as selected for an
/// outbound batch.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PendingResult {
    pub patient_id: i64,
    #[sqlx(flatten)]
    pub result: TestResult,
}

/// Repository for result rows.
#[derive(Debug, Clone)]
pub struct ResultRepository {
    pool: SqlitePool,
}

impl ResultRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ResultRepository { pool }
    }

    /// Fetches a result by row id.
    pub async fn get(&self, id: i64) -> DbResult<TestResult> {
        sqlx::query_as::<_, TestResult>("SELECT * FROM results WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::not_found("Result", id.to_string()))
    }

    /// All results for an order, in wire (insertion) order.
    pub async fn for_order(&self, order_id: i64) -> DbResult<Vec<TestResult>> {
        Ok(sqlx::query_as::<_, TestResult>(
            "SELECT * FROM results WHERE order_id = ?1 ORDER BY id",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Selects the next batch of local rows that are due for delivery.
    ///
    /// Rows are ordered by (patient, observed_at, id) so per-patient
    /// result order is preserved on the wire. Poisoned rows never match;
    /// rows with a future `next_attempt_at` are skipped until due.
    pub async fn pending_batch(
        &self,
        limit: u32,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<PendingResult>> {
        Ok(sqlx::query_as::<_, PendingResult>(
            r#"
            SELECT o.patient_id AS patient_id, r.*
            FROM results r
            JOIN orders o ON o.id = r.order_id
            WHERE r.sync_status = 'local'
              AND (r.next_attempt_at IS NULL OR r.next_attempt_at <= ?1)
            ORDER BY o.patient_id, r.observed_at, r.id
            LIMIT ?2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Marks rows as delivered. Records the 2xx receipt time and clears
    /// the retry bookkeeping.
    pub async fn mark_synced(&self, ids: &[i64], synced_at: DateTime<Utc>) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query(
                r#"
                UPDATE results SET
                    sync_status = 'synced',
                    synced_at = ?2,
                    next_attempt_at = NULL,
                    last_error = NULL
                WHERE id = ?1
                "#,
            )
            .bind(id)
            .bind(synced_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(count = ids.len(), "Marked results synced");
        Ok(())
    }

    /// Records a failed attempt per row: bumps the attempt counter and
    /// schedules the next try.
    pub async fn mark_failed(
        &self,
        schedule: &[(i64, DateTime<Utc>)],
        error: &str,
    ) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        for (id, next_attempt_at) in schedule {
            sqlx::query(
                r#"
                UPDATE results SET
                    attempts = attempts + 1,
                    last_error = ?2,
                    next_attempt_at = ?3
                WHERE id = ?1
                "#,
            )
            .bind(id)
            .bind(error)
            .bind(next_attempt_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Permanently excludes rows from sync after a non-retryable
    /// rejection.
    pub async fn mark_poisoned(&self, ids: &[i64], error: &str) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query(
                r#"
                UPDATE results SET
                    sync_status = 'poisoned',
                    attempts = attempts + 1,
                    last_error = ?2,
                    next_attempt_at = NULL
                WHERE id = ?1
                "#,
            )
            .bind(id)
            .bind(error)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Counts rows still waiting for delivery.
    pub async fn count_pending(&self) -> DbResult<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM results WHERE sync_status = 'local'")
                .fetch_one(&self.pool)
                .await?,
        )
    }

    /// Counts rows in the given sync state.
    pub async fn count_by_status(&self, status: SyncStatus) -> DbResult<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM results WHERE sync_status = ?1")
                .bind(status)
                .fetch_one(&self.pool)
                .await?,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use lablink_core::{
        AnalyzerType, CanonicalMessage, NewOrder, NewPatient, NewResult, OrderGroup,
    };

    async fn seeded_db() -> (Database, Vec<i64>) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let msg = CanonicalMessage {
            analyzer: AnalyzerType::MindrayBs430,
            patient: NewPatient {
                external_id: "322288".into(),
                ..Default::default()
            },
            orders: vec![OrderGroup {
                order: NewOrder {
                    sample_id: "322288".into(),
                    ..Default::default()
                },
                results: vec![
                    NewResult {
                        test_code: "GLU".into(),
                        value: "5.3".into(),
                        units: Some("mmol/L".into()),
                        observed_at: Some("20240115093000".into()),
                        ..Default::default()
                    },
                    NewResult {
                        test_code: "CREA".into(),
                        value: "88".into(),
                        units: Some("umol/L".into()),
                        observed_at: Some("20240115093000".into()),
                        ..Default::default()
                    },
                ],
            }],
        };
        let stored = db.store_message(&msg).await.unwrap();
        (db, stored.result_ids)
    }

    #[tokio::test]
    async fn pending_batch_selects_local_rows() {
        let (db, ids) = seeded_db().await;
        let batch = db.results().pending_batch(10, Utc::now()).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].result.id, ids[0]);
    }

    #[tokio::test]
    async fn synced_rows_leave_the_queue() {
        let (db, ids) = seeded_db().await;
        let now = Utc::now();
        db.results().mark_synced(&ids, now).await.unwrap();

        assert!(db
            .results()
            .pending_batch(10, Utc::now())
            .await
            .unwrap()
            .is_empty());

        let row = db.results().get(ids[0]).await.unwrap();
        assert_eq!(row.sync_status, SyncStatus::Synced);
        assert!(row.synced_at.is_some());
        assert!(row.synced_at.unwrap() >= row.created_at);
    }

    #[tokio::test]
    async fn failed_rows_wait_for_their_next_attempt() {
        let (db, ids) = seeded_db().await;
        let future = Utc::now() + chrono::Duration::seconds(60);
        let schedule: Vec<_> = ids.iter().map(|id| (*id, future)).collect();
        db.results().mark_failed(&schedule, "HTTP 503").await.unwrap();

        // Not due yet.
        assert!(db
            .results()
            .pending_batch(10, Utc::now())
            .await
            .unwrap()
            .is_empty());

        // Due once the clock passes next_attempt_at.
        let later = future + chrono::Duration::seconds(1);
        assert_eq!(db.results().pending_batch(10, later).await.unwrap().len(), 2);

        let row = db.results().get(ids[0]).await.unwrap();
        assert_eq!(row.attempts, 1);
        assert_eq!(row.last_error.as_deref(), Some("HTTP 503"));
    }

    #[tokio::test]
    async fn poisoned_rows_never_return() {
        let (db, ids) = seeded_db().await;
        db.results()
            .mark_poisoned(&ids[..1], "HTTP 400")
            .await
            .unwrap();

        let batch = db.results().pending_batch(10, Utc::now()).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(
            db.results()
                .count_by_status(SyncStatus::Poisoned)
                .await
                .unwrap(),
            1
        );
    }
}
