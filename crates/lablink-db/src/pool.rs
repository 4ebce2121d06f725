//! # Database Pool Management
//!
//! Connection pool creation and configuration for SQLite.
//!
//! WAL journal mode is enabled so readers never block the single
//! serialized writer. All ingest writes go through
//! [`Database::store_message`], which commits a whole decoded message in
//! one transaction; the connection layer acknowledges the analyzer only
//! after that transaction returns.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::{debug, info};

use lablink_core::CanonicalMessage;

use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::repository::order::OrderRepository;
use crate::repository::patient::PatientRepository;
use crate::repository::result::ResultRepository;
use crate::repository::sync_log::SyncLogRepository;
use crate::repository::StoredMessage;

// =============================================================================
// Configuration
// =============================================================================

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Path to the SQLite database file.
    pub database_path: PathBuf,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Minimum number of connections to keep alive.
    pub min_connections: u32,

    /// Connection acquire timeout.
    pub connect_timeout: Duration,

    /// Idle timeout before closing a pooled connection.
    pub idle_timeout: Duration,

    /// Whether to run migrations on connect.
    pub run_migrations: bool,
}

impl DbConfig {
    /// Creates a configuration for the given database file. The file is
    /// created on first connect if it does not exist.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            database_path: path.into(),
            max_connections: 5,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            run_migrations: true,
        }
    }

    /// Sets the maximum number of connections.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Creates an in-memory database configuration (for tests).
    pub fn in_memory() -> Self {
        DbConfig {
            database_path: PathBuf::from(":memory:"),
            // In-memory databases live per connection; a second
            // connection would see an empty schema.
            max_connections: 1,
            min_connections: 1,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            run_migrations: true,
        }
    }
}

// =============================================================================
// Database
// =============================================================================

/// Main database handle providing repository access.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Creates the pool, configures SQLite (WAL, NORMAL synchronous,
    /// foreign keys) and runs migrations when enabled.
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        info!(
            path = %config.database_path.display(),
            "Initializing database connection"
        );

        let connect_options = if config.database_path == PathBuf::from(":memory:") {
            SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| DbError::ConnectionFailed(e.to_string()))?
        } else {
            SqliteConnectOptions::from_str(&format!(
                "sqlite://{}?mode=rwc",
                config.database_path.display()
            ))
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?
        }
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .connect_with(connect_options)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        info!(max_connections = config.max_connections, "Database pool created");

        let db = Database { pool };

        if config.run_migrations {
            migrations::run_migrations(&db.pool).await?;
        }

        Ok(db)
    }

    /// Returns a reference to the pool for queries not covered by the
    /// repositories.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Returns the patient repository.
    pub fn patients(&self) -> PatientRepository {
        PatientRepository::new(self.pool.clone())
    }

    /// Returns the order repository.
    pub fn orders(&self) -> OrderRepository {
        OrderRepository::new(self.pool.clone())
    }

    /// Returns the result repository.
    pub fn results(&self) -> ResultRepository {
        ResultRepository::new(self.pool.clone())
    }

    /// Returns the sync attempt log repository.
    pub fn sync_log(&self) -> SyncLogRepository {
        SyncLogRepository::new(self.pool.clone())
    }

    /// Closes the pool. All repository operations fail afterwards.
    pub async fn close(&self) {
        info!("Closing database connection pool");
        self.pool.close().await;
    }

    /// Checks that the database answers queries.
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    // =========================================================================
    // Message Commit
    // =========================================================================

    /// Commits one decoded message atomically: upserts the patient, every
    /// order group and every result, in wire order.
    ///
    /// Upsert keys:
    /// - patient: (analyzer, external_id) falling back to
    ///   (analyzer, internal_id)
    /// - order: (patient_id, sample_id)
    /// - result: (order_id, test_code, observed_at)
    ///
    /// Re-committing the same message is idempotent apart from refreshed
    /// demographic fields; sync columns are never touched here.
    pub async fn store_message(&self, msg: &CanonicalMessage) -> DbResult<StoredMessage> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        // ---- Patient upsert -------------------------------------------------
        let mut patient_id: Option<i64> = None;

        if !msg.patient.external_id.is_empty() {
            patient_id = sqlx::query_scalar(
                "SELECT id FROM patients WHERE analyzer = ?1 AND external_id = ?2",
            )
            .bind(msg.analyzer)
            .bind(&msg.patient.external_id)
            .fetch_optional(&mut *tx)
            .await?;
        }

        if patient_id.is_none() && !msg.patient.internal_id.is_empty() {
            patient_id = sqlx::query_scalar(
                "SELECT id FROM patients WHERE analyzer = ?1 AND internal_id = ?2",
            )
            .bind(msg.analyzer)
            .bind(&msg.patient.internal_id)
            .fetch_optional(&mut *tx)
            .await?;
        }

        let patient_id = match patient_id {
            Some(id) => {
                // Refresh demographics; identifiers are only filled in,
                // never overwritten.
                sqlx::query(
                    r#"
                    UPDATE patients SET
                        external_id = CASE WHEN external_id = '' THEN ?2 ELSE external_id END,
                        internal_id = CASE WHEN internal_id = '' THEN ?3 ELSE internal_id END,
                        name       = COALESCE(?4, name),
                        dob        = COALESCE(?5, dob),
                        sex        = COALESCE(?6, sex),
                        physician  = COALESCE(?7, physician),
                        updated_at = ?8
                    WHERE id = ?1
                    "#,
                )
                .bind(id)
                .bind(&msg.patient.external_id)
                .bind(&msg.patient.internal_id)
                .bind(&msg.patient.name)
                .bind(&msg.patient.dob)
                .bind(&msg.patient.sex)
                .bind(&msg.patient.physician)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                id
            }
            None => {
                let id: i64 = sqlx::query_scalar(
                    r#"
                    INSERT INTO patients
                        (analyzer, external_id, internal_id, name, dob, sex,
                         physician, sync_status, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'local', ?8, ?8)
                    RETURNING id
                    "#,
                )
                .bind(msg.analyzer)
                .bind(&msg.patient.external_id)
                .bind(&msg.patient.internal_id)
                .bind(&msg.patient.name)
                .bind(&msg.patient.dob)
                .bind(&msg.patient.sex)
                .bind(&msg.patient.physician)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?;
                debug!(patient_id = id, "Inserted patient");
                id
            }
        };

        // ---- Orders and results --------------------------------------------
        let mut order_ids = Vec::with_capacity(msg.orders.len());
        let mut result_ids = Vec::new();

        for group in &msg.orders {
            let order_id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO orders
                    (patient_id, sample_id, universal_service_id, ordered_at,
                     comments, analyzer, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT (patient_id, sample_id) DO UPDATE SET
                    universal_service_id = COALESCE(excluded.universal_service_id,
                                                    universal_service_id),
                    ordered_at = COALESCE(excluded.ordered_at, ordered_at),
                    comments = COALESCE(excluded.comments, comments)
                RETURNING id
                "#,
            )
            .bind(patient_id)
            .bind(&group.order.sample_id)
            .bind(&group.order.universal_service_id)
            .bind(&group.order.ordered_at)
            .bind(comments_text(&group.order.comments))
            .bind(msg.analyzer)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
            order_ids.push(order_id);

            for result in &group.results {
                let observed = result.observed_at.clone().unwrap_or_default();
                let id: i64 = sqlx::query_scalar(
                    r#"
                    INSERT INTO results
                        (order_id, test_code, value, units, reference_range,
                         flags, observed_at, comments, sync_status, created_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'local', ?9)
                    ON CONFLICT (order_id, test_code, observed_at) DO UPDATE SET
                        value = excluded.value,
                        units = excluded.units,
                        reference_range = excluded.reference_range,
                        flags = excluded.flags,
                        comments = excluded.comments
                    RETURNING id
                    "#,
                )
                .bind(order_id)
                .bind(&result.test_code)
                .bind(&result.value)
                .bind(&result.units)
                .bind(&result.reference_range)
                .bind(&result.flags)
                .bind(observed)
                .bind(comments_text(&result.comments))
                .bind(now)
                .fetch_one(&mut *tx)
                .await?;
                result_ids.push(id);
            }
        }

        tx.commit().await?;

        debug!(
            patient_id,
            orders = order_ids.len(),
            results = result_ids.len(),
            "Message committed"
        );

        Ok(StoredMessage {
            patient_id,
            order_ids,
            result_ids,
        })
    }
}

/// Wire comment lines are stored newline-joined; no comments stay NULL.
fn comments_text(comments: &[String]) -> Option<String> {
    if comments.is_empty() {
        None
    } else {
        Some(comments.join("\n"))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use lablink_core::{AnalyzerType, NewOrder, NewPatient, NewResult, OrderGroup};

    fn sample_message() -> CanonicalMessage {
        CanonicalMessage {
            analyzer: AnalyzerType::SysmexXnL,
            patient: NewPatient {
                external_id: "322288".into(),
                internal_id: String::new(),
                name: Some("WORLANYO TIMOTHY".into()),
                dob: Some("1984-02-03".into()),
                sex: Some("M".into()),
                physician: None,
            },
            orders: vec![OrderGroup {
                order: NewOrder {
                    sample_id: "SID01".into(),
                    comments: vec!["Fasting sample".into()],
                    ..Default::default()
                },
                results: vec![NewResult {
                    test_code: "GLU".into(),
                    value: "5.3".into(),
                    units: Some("mmol/L".into()),
                    reference_range: Some("3.9-6.1".into()),
                    flags: Some("N".into()),
                    observed_at: Some("20240115093000".into()),
                    comments: vec!["Slight hemolysis".into(), "Rerun advised".into()],
                }],
            }],
        }
    }

    #[tokio::test]
    async fn in_memory_database_is_healthy() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        assert!(db.health_check().await);
    }

    #[tokio::test]
    async fn store_message_commits_all_rows() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let stored = db.store_message(&sample_message()).await.unwrap();

        assert_eq!(stored.result_ids.len(), 1);

        let patient = db.patients().get(stored.patient_id).await.unwrap();
        assert_eq!(patient.external_id, "322288");

        let order = db.orders().get(stored.order_ids[0]).await.unwrap();
        assert_eq!(order.comments.as_deref(), Some("Fasting sample"));

        let result = db.results().get(stored.result_ids[0]).await.unwrap();
        assert_eq!(result.test_code, "GLU");
        assert_eq!(result.value, "5.3");
        assert_eq!(
            result.comments.as_deref(),
            Some("Slight hemolysis\nRerun advised")
        );
        assert_eq!(result.sync_status, lablink_core::SyncStatus::Local);
    }

    #[tokio::test]
    async fn store_message_is_idempotent() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let first = db.store_message(&sample_message()).await.unwrap();
        let second = db.store_message(&sample_message()).await.unwrap();

        assert_eq!(first.patient_id, second.patient_id);
        assert_eq!(first.order_ids, second.order_ids);
        assert_eq!(first.result_ids, second.result_ids);

        assert_eq!(db.results().count_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn internal_id_fallback_matches_same_patient() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();

        let mut by_internal = sample_message();
        by_internal.patient.external_id = String::new();
        by_internal.patient.internal_id = "LAB-77".into();
        let first = db.store_message(&by_internal).await.unwrap();

        // Later message carries the external id too; same internal id.
        let mut both = sample_message();
        both.patient.internal_id = "LAB-77".into();
        let second = db.store_message(&both).await.unwrap();

        // Matched by external? No: first row had no external id, so the
        // match runs through the internal id and back-fills the external.
        assert_eq!(first.patient_id, second.patient_id);
        let patient = db.patients().get(first.patient_id).await.unwrap();
        assert_eq!(patient.external_id, "322288");
        assert_eq!(patient.internal_id, "LAB-77");
    }
}
