//! fedlink wire codec primitives.
//!
//! Defines the message model, the content-addressed object schema with its
//! CBOR encode/decode helpers, and DAG deflation/inflation of message payloads.

pub mod error;
pub mod inflatable;
pub mod message;
pub mod object;
pub mod tree;

pub use inflatable::{inflate_message, InflatedMessage, ObjectSnapshot};
pub use message::{Message, MessageEnvelope, MessageError, Metadata, Payload, RecordDict};
pub use tree::{iterate_object_tree, ObjectTree};
