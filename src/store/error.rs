use thiserror::Error;

/// Errors surfaced by the resource store.
///
/// `TransientIo` never corrupts in-memory state and may be retried (or is
/// superseded by the next coalesced write). `Validation` failures are dropped,
/// not retried. `GraphIntegrity` is reported when an operation would create a
/// self-referential or dangling edge; the operation proceeds without the
/// offending edge.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("durable tier i/o failed: {message}")]
    TransientIo { message: String },
    #[error("validation failed: {message}")]
    Validation { message: String },
    #[error("graph integrity violated: {message}")]
    GraphIntegrity { message: String },
}

impl StoreError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientIo {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn graph(message: impl Into<String>) -> Self {
        Self::GraphIntegrity {
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::transient(err.to_string())
    }
}
