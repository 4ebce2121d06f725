//! # Sync Error Types

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Failures on the outbound path.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Endpoint URL is malformed.
    #[error("Invalid sync URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Transport-level failure (connect, timeout, TLS).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Credential could not be built or refreshed.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Endpoint answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Local store failure while updating sync state.
    #[error("Database error: {0}")]
    Database(#[from] lablink_db::DbError),

    /// Payload could not be serialized.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Transport(err.to_string())
    }
}

impl SyncError {
    /// True when a later retry of the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport(_) | SyncError::Database(_) => true,
            SyncError::Status { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            SyncError::AuthFailed(_) => true,
            SyncError::InvalidUrl(_) | SyncError::Serialization(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_retryability() {
        assert!(SyncError::Status {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(SyncError::Status {
            status: 429,
            body: String::new()
        }
        .is_retryable());
        assert!(!SyncError::Status {
            status: 400,
            body: String::new()
        }
        .is_retryable());
    }
}
