//! # lablink-core: Domain Model for LabLink
//!
//! Shared vocabulary for the LabLink receiver. This crate holds the
//! canonical record types, the configuration schema and the observer event
//! contract. It performs no I/O of its own.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        LabLink Architecture                         │
//! │                                                                     │
//! │  Analyzers ──TCP──► lablink-ingest ──► lablink-db ──► lablink-sync  │
//! │                          │                  │               │       │
//! │                          └───────┬──────────┴───────┬───────┘       │
//! │                                  ▼                  ▼               │
//! │                     ★ lablink-core (THIS CRATE) ★                   │
//! │                                                                     │
//! │     types • config • events • validation — NO SOCKETS, NO SQL       │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Canonical entities (Patient, LabOrder, TestResult) and
//!   the analyzer/protocol/sync-status enums
//! - [`config`] - TOML application configuration
//! - [`events`] - Append-only observer channel consumed by UIs and logs
//! - [`error`] - Configuration and validation error types
//! - [`validation`] - Field-level validators used by `AppConfig::validate`

pub mod config;
pub mod error;
pub mod events;
pub mod types;
pub mod validation;

pub use config::{AppConfig, AuthConfig, ExternalServerConfig, SyncFrequency};
pub use error::{ConfigError, ValidationError};
pub use events::{AppEvent, EventBus, ListenerState, MessageSummary, SyncOutcome};
pub use types::*;

/// Default capacity of the observer event channel. When the buffer is full
/// the oldest events are dropped; consumers must never block the core.
pub const EVENT_BUFFER: usize = 1024;

/// Idle seconds after which a silent analyzer connection is closed.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
