use bytes::Bytes;
use fedlink_core::ObjectId;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Object schema version for `ObjectV1`.
pub const OBJECT_V1_VERSION: u16 = 1;

/// Node type within a deflated message DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    /// Root: message header, child is the record dict (if any).
    Message,
    /// Ordered record names, one child array per name.
    RecordDict,
    /// One record payload, children are its chunks in order.
    Array,
    /// Leaf holding raw payload bytes.
    Chunk,
}

/// One content-addressed object. Its id is the hash of its CBOR encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectV1 {
    /// Wire version.
    pub version: u16,
    pub kind: ObjectKind,
    /// Ids of directly referenced objects, in order.
    pub children: Vec<ObjectId>,
    /// Kind-specific body.
    pub body: Bytes,
}

impl ObjectV1 {
    pub fn new(kind: ObjectKind, children: Vec<ObjectId>, body: impl Into<Bytes>) -> Self {
        Self {
            version: OBJECT_V1_VERSION,
            kind,
            children,
            body: body.into(),
        }
    }

    /// Validates object schema and field consistency.
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.version != OBJECT_V1_VERSION {
            return Err(CodecError::InvalidObject("unsupported object version"));
        }
        match self.kind {
            ObjectKind::Chunk if !self.children.is_empty() => {
                Err(CodecError::InvalidObject("chunk must not have children"))
            }
            ObjectKind::Message if self.children.len() > 1 => Err(CodecError::InvalidObject(
                "message has at most one content child",
            )),
            _ => Ok(()),
        }
    }
}

/// Encodes `ObjectV1` as CBOR after validation.
pub fn encode_object_cbor(object: &ObjectV1) -> Result<Vec<u8>, CodecError> {
    object.validate()?;
    encode_cbor(object)
}

/// Decodes and validates a full CBOR object.
pub fn decode_object_cbor(bytes: &[u8]) -> Result<ObjectV1, CodecError> {
    let object: ObjectV1 = decode_cbor(bytes)?;
    object.validate()?;
    Ok(object)
}

pub(crate) fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(bytes)
}

pub(crate) fn decode_cbor<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, CodecError> {
    ciborium::de::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}
