//! # lablink-ingest: Analyzer Ingestion Pipeline
//!
//! Everything between the TCP socket and the durable store.
//!
//! ## Data Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                       Ingestion Pipeline                            │
//! │                                                                     │
//! │  bytes ──► Framing codec ──► frames ──► Record decoder ──► records  │
//! │            (astm / mllp)                (decoder)                   │
//! │                                             │                       │
//! │                                             ▼  WireMessage          │
//! │                                        Field mapper                 │
//! │                                             │  CanonicalMessage     │
//! │                                             ▼                       │
//! │                                     Database::store_message         │
//! │                                             │                       │
//! │                                ACK to peer ◄┘ (only after commit)   │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The [`supervisor::ListenerSupervisor`] owns one accept-loop task per
//! configured port; each accepted socket becomes a
//! [`connection`] task owning its codec and decoder. Observers watch the
//! shared [`lablink_core::EventBus`]; the pipeline never calls into UI
//! code.

pub mod astm;
pub mod connection;
pub mod decoder;
pub mod error;
pub mod mapper;
pub mod mllp;
pub mod record;
pub mod supervisor;

pub use connection::{CloseReason, ConnectionContext};
pub use error::{IngestError, IngestResult};
pub use mapper::FieldMap;
pub use record::{Delimiters, Record, RecordType, WireMessage};
pub use supervisor::{IngestContext, Listener, ListenerSupervisor};
