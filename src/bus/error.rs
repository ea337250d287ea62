use thiserror::Error;

/// Bus-side failures. `Auth` and `Validation` are connection-level rejections
/// that never crash the server; `Transport` covers socket and encoding
/// failures, retried by the subscriber's reconnect loop.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("unauthorized publisher: {message}")]
    Auth { message: String },
    #[error("invalid bus frame: {message}")]
    Validation { message: String },
    #[error("bus transport failed: {message}")]
    Transport { message: String },
}

impl BusError {
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }
}
