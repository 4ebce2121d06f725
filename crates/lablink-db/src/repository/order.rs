//! # Order Repository

use sqlx::SqlitePool;

use lablink_core::LabOrder;

use crate::error::{DbError, DbResult};

/// Repository for order (specimen) rows.
#[derive(Debug, Clone)]
pub struct OrderRepository {
    pool: SqlitePool,
}

impl OrderRepository {
    pub fn new(pool: SqlitePool) -> Self {
        OrderRepository { pool }
    }

    /// Fetches an order by row id.
    pub async fn get(&self, id: i64) -> DbResult<LabOrder> {
        sqlx::query_as::<_, LabOrder>("SELECT * FROM orders WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::not_found("Order", id.to_string()))
    }

    /// All orders for a patient, oldest first.
    pub async fn for_patient(&self, patient_id: i64) -> DbResult<Vec<LabOrder>> {
        Ok(sqlx::query_as::<_, LabOrder>(
            "SELECT * FROM orders WHERE patient_id = ?1 ORDER BY id",
        )
        .bind(patient_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Counts stored orders.
    pub async fn count(&self) -> DbResult<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM orders")
            .fetch_one(&self.pool)
            .await?)
    }
}
