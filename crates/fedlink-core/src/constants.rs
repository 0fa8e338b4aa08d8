use std::time::Duration;

use crate::types::NodeId;

/// Heartbeat interval announced at registration and on every beat.
pub const HEARTBEAT_DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
/// Per-call timeout for a single heartbeat.
pub const HEARTBEAT_CALL_TIMEOUT: Duration = Duration::from_secs(5);
/// Fraction of the interval waited after a successful beat.
pub const HEARTBEAT_BASE_MULTIPLIER: f64 = 0.8;
/// Symmetric random range applied to the next-beat delay.
pub const HEARTBEAT_RANDOM_RANGE: (f64, f64) = (-0.1, 0.1);
/// Hard ceiling for the delay between two beats (effectively unbounded).
pub const HEARTBEAT_MAX_INTERVAL: Duration = Duration::MAX;

/// Node id the coordinator uses for itself on the application side.
pub const SUPERLINK_NODE_ID: NodeId = NodeId(1);

/// Maximum delay between two consecutive unary-call retries.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(20);

/// Default maximum number of concurrent object pushes.
pub const MAX_CONCURRENT_PUSHES: usize = 8;
/// Default maximum number of concurrent object pulls.
pub const MAX_CONCURRENT_PULLS: usize = 8;
/// Default wall-clock ceiling for pulling all objects of one message.
pub const PULL_MAX_TIME: Duration = Duration::from_secs(7200);
/// Default maximum number of tries to pull one object.
pub const PULL_MAX_TRIES_PER_OBJECT: u32 = 500;
/// Initial backoff for object transfers.
pub const PULL_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Backoff cap for object transfers.
pub const PULL_BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Time-to-live applied to new messages unless overridden.
pub const MESSAGE_DEFAULT_TTL: Duration = Duration::from_secs(43_200);

/// Delay between two reply polls in send-and-receive.
pub const SEND_AND_RECEIVE_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Record payloads above this size are split into chunk objects.
pub const MAX_ARRAY_CHUNK_SIZE: usize = 20 * 1024 * 1024;

/// Message type names.
pub mod message_type {
    pub const TRAIN: &str = "train";
    pub const EVALUATE: &str = "evaluate";
    pub const QUERY: &str = "query";
    pub const SYSTEM: &str = "system";
}

/// Error codes carried by a message error payload.
pub mod error_code {
    pub const UNKNOWN: i64 = 0;
    pub const LOAD_CLIENT_APP_EXCEPTION: i64 = 1;
    pub const CLIENT_APP_RAISED_EXCEPTION: i64 = 2;
    pub const MESSAGE_UNAVAILABLE: i64 = 3;
    pub const REPLY_MESSAGE_UNAVAILABLE: i64 = 4;
    pub const NODE_UNAVAILABLE: i64 = 5;
}

/// Run status values.
pub mod run_status {
    pub const PENDING: &str = "pending";
    pub const STARTING: &str = "starting";
    pub const RUNNING: &str = "running";
    pub const FINISHED: &str = "finished";
}
