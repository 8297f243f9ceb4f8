use thiserror::Error;

use crate::frame::ErrorCode;

/// Errors produced by the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("light node not connected")]
    UpstreamUnavailable,

    #[error("light node is restarting")]
    NodeRestarting,

    #[error("unroutable upstream message")]
    Unroutable,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("node admin error: {0}")]
    Admin(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RelayError {
    /// The wire error code a client sees for this error, if it is client-visible.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            RelayError::Unauthorized(_) => Some(ErrorCode::Unauthorized),
            RelayError::InvalidMessage(_) | RelayError::Json(_) => Some(ErrorCode::InvalidMessage),
            RelayError::UpstreamUnavailable => Some(ErrorCode::LightNodeNotConnected),
            RelayError::NodeRestarting => Some(ErrorCode::NodeIsRestarting),
            _ => None,
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
