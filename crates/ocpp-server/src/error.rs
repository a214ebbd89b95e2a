//! Server, dispatcher and handler error types.

use std::io;

use ocpp_core::{CallError, DecodeError, ErrorCode, Violation};
use ocpp_reactor::ReactorError;

/// Rejections from the outbound call path.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown connection '{0}'")]
    UnknownConnection(String),
    #[error("call rejected: {0}")]
    Invalid(#[from] DecodeError),
    #[error("dispatcher is not running")]
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O: {0}")]
    Io(#[from] io::Error),
    #[error("reactor: {0}")]
    Reactor(#[from] ReactorError),
    #[error("websocket: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("handshake rejected: {0}")]
    Handshake(String),
    #[error("write timed out")]
    WriteTimeout,
    #[error("connection closed")]
    Closed,
    #[error("server is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, ServerError>;

/// Failure reported by an application handler. Travels to the peer as a
/// `CallError` with the same code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {description}")]
pub struct HandlerError {
    pub code: ErrorCode,
    pub description: String,
}

impl HandlerError {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, description)
    }

    pub fn not_implemented(action: &str) -> Self {
        Self::new(
            ErrorCode::NotImplemented,
            format!("no handler for action '{}'", action),
        )
    }

    pub fn to_call_error(&self, unique_id: &str) -> CallError {
        CallError::new(unique_id, self.code, self.description.clone())
    }
}

impl From<Violation> for HandlerError {
    fn from(v: Violation) -> Self {
        Self::new(v.code, v.to_string())
    }
}

impl From<DecodeError> for HandlerError {
    fn from(e: DecodeError) -> Self {
        Self::new(e.code, e.description)
    }
}
