//! # Repositories
//!
//! One repository per table, each holding a cloned pool. Reads are served
//! from any pooled connection; sync-state mutations live on
//! [`result::ResultRepository`] and are only called by the sync engine.

pub mod order;
pub mod patient;
pub mod result;
pub mod sync_log;

/// Row identities produced by one committed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub patient_id: i64,
    /// Ids of the order rows, in wire order.
    pub order_ids: Vec<i64>,
    /// Ids of the result rows, in wire order.
    pub result_ids: Vec<i64>,
}
