use fedlink_core::ObjectId;
use thiserror::Error;

/// Errors returned by message/object codec operations.
#[derive(Debug, Error)]
pub enum CodecError {
    /// CBOR serialization failure.
    #[error("encode error: {0}")]
    Encode(String),
    /// CBOR deserialization failure.
    #[error("decode error: {0}")]
    Decode(String),
    /// Object-level schema validation failure.
    #[error("invalid object: {0}")]
    InvalidObject(&'static str),
    /// Bytes received for an object do not hash to its id.
    #[error("object {expected} failed integrity check (got {actual})")]
    IntegrityMismatch { expected: ObjectId, actual: ObjectId },
    /// An object referenced by the DAG is not among the supplied contents.
    #[error("object {0} missing from contents")]
    MissingObject(ObjectId),
    /// Message envelope violates an outbound invariant.
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),
}
