//! # Ingest Error Types
//!
//! One taxonomy for the whole pipeline. The handling policy lives in the
//! connection layer:
//! - framing/decode errors on a single frame answer NAK (ASTM) or AE
//!   (HL7) and keep the session alive
//! - a missing patient identity rejects the message (NAK / AR)
//! - persistence errors refuse the acknowledgement, retry briefly, then
//!   drop the connection so the analyzer retransmits
//! - fatal conditions close the socket cleanly, never the process

use thiserror::Error;

/// Result alias for ingest operations.
pub type IngestResult<T> = Result<T, IngestError>;

/// Errors raised anywhere on the byte-to-row path.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Bad checksum, bad sequence number or garbled frame; the codec
    /// resynchronizes.
    #[error("Framing error: {0}")]
    Framing(String),

    /// Unexpected control sequence for the current session state.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A record or segment could not be parsed.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Required identifier missing; the whole message is rejected.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// The store refused the write.
    #[error("Persistence error: {0}")]
    Persistence(#[from] lablink_db::DbError),

    /// The connection cannot continue (peer reset, idle timeout, NAK
    /// storm).
    #[error("Fatal connection error: {0}")]
    FatalConnection(String),

    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A non-fatal mapping problem: the offending record was dropped and the
/// rest of the message was kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingWarning {
    pub detail: String,
}

impl MappingWarning {
    pub fn new(detail: impl Into<String>) -> Self {
        MappingWarning {
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for MappingWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.detail)
    }
}
