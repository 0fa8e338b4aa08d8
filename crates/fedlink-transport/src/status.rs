use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured status code reported by the transport for a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

/// Transport error carrying a status code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rpc failed with {code:?}: {message}")]
pub struct RpcError {
    pub code: StatusCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// UNAVAILABLE and DEADLINE_EXCEEDED: the call may succeed if repeated.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.code,
            StatusCode::Unavailable | StatusCode::DeadlineExceeded
        )
    }
}
