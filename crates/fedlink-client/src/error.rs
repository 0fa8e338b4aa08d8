use std::time::Duration;

use fedlink_codec::error::CodecError;
use fedlink_core::{ObjectId, RunId};
use fedlink_transport::{RpcError, StatusCode};
use thiserror::Error;

/// Errors surfaced by the node and grid channels.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The coordinator refused the call because the run is no longer running.
    #[error("run is not running")]
    RunNotRunning,
    /// The coordinator no longer recognizes this node; the heartbeat has stopped.
    #[error("node is not recognized by the coordinator")]
    UnrecognizedSession,
    #[error("no node is registered on this channel")]
    NodeMissing,
    #[error("no run has been selected on this channel")]
    RunNotSet,
    #[error("run {0:?} not found")]
    RunNotFound(RunId),
    #[error("channel is closed")]
    ChannelClosed,
    /// A batch exceeded the transport's per-call size limit.
    #[error("payload exceeds the per-call size limit: {0}")]
    PayloadTooLarge(RpcError),
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),
    /// The coordinator has never seen the object id.
    #[error("object {0} is not registered with the coordinator")]
    ObjectNotRegistered(ObjectId),
    #[error("object {object_id} still failing after {attempts} attempts: {last_error}")]
    ObjectTransferExhausted {
        object_id: ObjectId,
        attempts: u32,
        last_error: String,
    },
    /// One or more objects of a push or pull could not be transferred.
    #[error("{} object transfer(s) failed", .failures.len())]
    ObjectTransfer { failures: Vec<ClientError> },
    #[error("object pull did not finish within {0:?}")]
    PullTimedOut(Duration),
    #[error("heartbeat task failed: {0}")]
    HeartbeatTask(String),
    #[error("codec error: {0}")]
    Codec(CodecError),
    #[error("rpc error: {0}")]
    Rpc(RpcError),
}

impl ClientError {
    /// Whether retrying the failed call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Rpc(err) if err.is_transient())
    }

    /// Individual failures of an aggregated transfer error.
    pub fn transfer_failures(&self) -> &[ClientError] {
        match self {
            ClientError::ObjectTransfer { failures } => failures,
            _ => &[],
        }
    }
}

impl From<RpcError> for ClientError {
    fn from(err: RpcError) -> Self {
        match err.code {
            StatusCode::PermissionDenied => ClientError::RunNotRunning,
            StatusCode::ResourceExhausted => ClientError::PayloadTooLarge(err),
            _ => ClientError::Rpc(err),
        }
    }
}

impl From<CodecError> for ClientError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::InvalidMessage(reason) => ClientError::InvalidMessage(reason),
            other => ClientError::Codec(other),
        }
    }
}
