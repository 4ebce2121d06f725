//! # Patient Repository

use sqlx::SqlitePool;

use lablink_core::{AnalyzerType, Patient};

use crate::error::{DbError, DbResult};

/// Repository for patient rows.
#[derive(Debug, Clone)]
pub struct PatientRepository {
    pool: SqlitePool,
}

impl PatientRepository {
    pub fn new(pool: SqlitePool) -> Self {
        PatientRepository { pool }
    }

    /// Fetches a patient by row id.
    pub async fn get(&self, id: i64) -> DbResult<Patient> {
        sqlx::query_as::<_, Patient>("SELECT * FROM patients WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::not_found("Patient", id.to_string()))
    }

    /// Finds a patient by analyzer and either identifier, preferring the
    /// external id.
    pub async fn find_by_identity(
        &self,
        analyzer: AnalyzerType,
        external_id: &str,
        internal_id: &str,
    ) -> DbResult<Option<Patient>> {
        if !external_id.is_empty() {
            let found = sqlx::query_as::<_, Patient>(
                "SELECT * FROM patients WHERE analyzer = ?1 AND external_id = ?2",
            )
            .bind(analyzer)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
            if found.is_some() {
                return Ok(found);
            }
        }

        if !internal_id.is_empty() {
            return Ok(sqlx::query_as::<_, Patient>(
                "SELECT * FROM patients WHERE analyzer = ?1 AND internal_id = ?2",
            )
            .bind(analyzer)
            .bind(internal_id)
            .fetch_optional(&self.pool)
            .await?);
        }

        Ok(None)
    }

    /// Counts stored patients.
    pub async fn count(&self) -> DbResult<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM patients")
            .fetch_one(&self.pool)
            .await?)
    }
}
