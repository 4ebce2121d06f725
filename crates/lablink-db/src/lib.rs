//! # lablink-db: Persistence Layer for LabLink
//!
//! SQLite storage for decoded analyzer messages and their sync state.
//!
//! ## Design
//! - One [`Database`] handle wrapping a connection pool (WAL mode)
//! - Repository structs per table, each holding a cloned pool
//! - [`Database::store_message`] commits a whole decoded message
//!   (patient, order, results) in a single transaction; the connection
//!   layer only acknowledges the peer after this returns
//! - The sync engine is the only writer of the per-row sync columns

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};
pub use repository::patient::PatientRepository;
pub use repository::result::{PendingResult, ResultRepository};
pub use repository::sync_log::SyncLogRepository;
pub use repository::order::OrderRepository;
pub use repository::StoredMessage;
