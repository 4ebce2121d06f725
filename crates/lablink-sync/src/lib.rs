//! # lablink-sync: Outbound Sync Engine
//!
//! Drains locally stored results to the configured external server with
//! at-least-once delivery.
//!
//! ## Engine Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Flow                             │
//! │                                                                     │
//! │  trigger (realtime notify / interval / cron)                        │
//! │       │                                                             │
//! │       ▼                                                             │
//! │  SELECT local rows due for attempt                                  │
//! │  ORDER BY patient, observed_at, id   LIMIT batch × workers          │
//! │       │                                                             │
//! │       ▼                                                             │
//! │  chunk into batches ──► worker pool (≤4) ──► POST {instance_id,     │
//! │       │                                        batch:[{patient,     │
//! │       │                                         order, results}]}   │
//! │       ▼                                                             │
//! │  2xx        → rows synced (receipt timestamp recorded)              │
//! │  408/429/5xx→ attempts+1, next try at base·2^min(n,6) ±20%          │
//! │  other 4xx  → row poisoned, excluded from future batches            │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Sync failures never reach the connection path; analyzers keep
//! delivering while the endpoint is down.

pub mod auth;
pub mod engine;
pub mod error;
pub mod retry;
pub mod schedule;
pub mod uplink;

pub use auth::AuthProvider;
pub use engine::{SyncEngine, SyncEngineHandle};
pub use error::{SyncError, SyncResult};
pub use uplink::{BatchBundle, BatchPayload, DeliveryOutcome, Uplink};
