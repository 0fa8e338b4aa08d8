//! fedlink participant and application channels.
//!
//! [`NodeChannel`] registers a node, keeps it alive with heartbeats and
//! exchanges messages with the coordinator. [`GridChannel`] pushes messages
//! for a run and collects the replies. Both move message payloads as
//! content-addressed objects through [`ObjectStoreClient`] and wrap unary
//! calls in a [`RetryInvoker`].

pub mod config;
pub mod error;
pub mod grid;
pub mod heartbeat;
pub mod node;
pub mod object_store;
pub mod retry;

pub use config::ClientConfig;
pub use error::ClientError;
pub use grid::GridChannel;
pub use heartbeat::{Beat, HeartbeatConfig, HeartbeatMetrics, HeartbeatSender};
pub use node::NodeChannel;
pub use object_store::{ObjectStoreClient, TransferPolicy};
pub use retry::{RetryInvoker, RetryPolicy};
