//! Deflation of a message into content-addressed objects and the reverse.
//!
//! A message becomes a DAG: `Message -> RecordDict -> Array -> Chunk`.
//! Every object id is the hash of the object's encoded bytes, so equal
//! payload chunks collapse into one stored object.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use fedlink_core::constants::MAX_ARRAY_CHUNK_SIZE;
use fedlink_core::hash::object_id_of;
use fedlink_core::ObjectId;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::message::{Message, MessageError, Metadata, Payload, RecordDict};
use crate::object::{decode_cbor, decode_object_cbor, encode_cbor, encode_object_cbor, ObjectKind, ObjectV1};
use crate::tree::ObjectTree;

#[derive(Debug, Serialize, Deserialize)]
struct MessageHeaderV1 {
    metadata: Metadata,
    error: Option<MessageError>,
}

/// Ids and encoded bytes of every object reachable from one message.
///
/// Ids are computed once at capture time; later pushes transmit exactly the
/// bytes that were hashed here, whatever happens to the source message.
#[derive(Debug, Clone)]
pub struct ObjectSnapshot {
    tree: ObjectTree,
    objects: HashMap<ObjectId, Bytes>,
}

impl ObjectSnapshot {
    /// Deflates `message` using the default chunk size.
    pub fn capture(message: &Message) -> Result<Self, CodecError> {
        Self::capture_with_chunk_size(message, MAX_ARRAY_CHUNK_SIZE)
    }

    pub fn capture_with_chunk_size(message: &Message, chunk_size: usize) -> Result<Self, CodecError> {
        let mut builder = DagBuilder {
            chunk_size: chunk_size.max(1),
            objects: HashMap::new(),
        };
        let tree = builder.message(message)?;
        Ok(Self {
            tree,
            objects: builder.objects,
        })
    }

    /// Id of the root object, i.e. the message id.
    pub fn root_id(&self) -> ObjectId {
        self.tree.object_id
    }

    pub fn tree(&self) -> &ObjectTree {
        &self.tree
    }

    pub fn objects(&self) -> &HashMap<ObjectId, Bytes> {
        &self.objects
    }

    pub fn get(&self, object_id: &ObjectId) -> Option<&Bytes> {
        self.objects.get(object_id)
    }

    /// Number of distinct objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

struct DagBuilder {
    chunk_size: usize,
    objects: HashMap<ObjectId, Bytes>,
}

impl DagBuilder {
    fn put(&mut self, object: ObjectV1, subtrees: Vec<ObjectTree>) -> Result<ObjectTree, CodecError> {
        let bytes = encode_object_cbor(&object)?;
        let object_id = object_id_of(&bytes);
        self.objects
            .entry(object_id)
            .or_insert_with(|| Bytes::from(bytes));
        Ok(ObjectTree {
            object_id,
            children: subtrees,
        })
    }

    fn message(&mut self, message: &Message) -> Result<ObjectTree, CodecError> {
        let (subtrees, error) = match message.payload() {
            Payload::Content(content) => (vec![self.record_dict(content)?], None),
            Payload::Error(error) => (Vec::new(), Some(error.clone())),
        };
        let header = MessageHeaderV1 {
            metadata: message.metadata().without_id(),
            error,
        };
        let children = subtrees.iter().map(|t| t.object_id).collect();
        let object = ObjectV1::new(ObjectKind::Message, children, encode_cbor(&header)?);
        self.put(object, subtrees)
    }

    fn record_dict(&mut self, content: &RecordDict) -> Result<ObjectTree, CodecError> {
        let mut names = Vec::with_capacity(content.len());
        let mut subtrees = Vec::with_capacity(content.len());
        for (name, data) in content.iter() {
            names.push(name.clone());
            subtrees.push(self.array(data)?);
        }
        let children = subtrees.iter().map(|t| t.object_id).collect();
        let object = ObjectV1::new(ObjectKind::RecordDict, children, encode_cbor(&names)?);
        self.put(object, subtrees)
    }

    fn array(&mut self, data: &Bytes) -> Result<ObjectTree, CodecError> {
        let mut subtrees = Vec::new();
        let mut start = 0;
        while start < data.len() {
            let end = (start + self.chunk_size).min(data.len());
            let chunk = ObjectV1::new(ObjectKind::Chunk, Vec::new(), data.slice(start..end));
            subtrees.push(self.put(chunk, Vec::new())?);
            start = end;
        }
        let children = subtrees.iter().map(|t| t.object_id).collect();
        let object = ObjectV1::new(ObjectKind::Array, children, encode_cbor(&(data.len() as u64))?);
        self.put(object, subtrees)
    }
}

/// A reconstructed message whose id has not been attached yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InflatedMessage {
    metadata: Metadata,
    payload: Payload,
}

impl InflatedMessage {
    /// Attaches the content-derived id, completing reconstruction.
    pub fn finalize(self, message_id: ObjectId) -> Message {
        Message::from_parts(self.metadata, self.payload).with_message_id(message_id)
    }
}

/// Rebuilds a message from the bytes of every object in its DAG.
///
/// Each object is re-hashed against the id it was requested under.
pub fn inflate_message(
    message_id: ObjectId,
    contents: &HashMap<ObjectId, Bytes>,
) -> Result<InflatedMessage, CodecError> {
    let root = load(contents, message_id, ObjectKind::Message)?;
    let header: MessageHeaderV1 = decode_cbor(&root.body)?;
    let payload = match (header.error, root.children.first()) {
        (Some(error), None) => Payload::Error(error),
        (Some(_), Some(_)) => {
            return Err(CodecError::InvalidObject(
                "message carries both error and content",
            ))
        }
        (None, Some(dict_id)) => Payload::Content(inflate_record_dict(contents, *dict_id)?),
        (None, None) => Payload::Content(RecordDict::new()),
    };
    Ok(InflatedMessage {
        metadata: header.metadata.without_id(),
        payload,
    })
}

fn inflate_record_dict(
    contents: &HashMap<ObjectId, Bytes>,
    object_id: ObjectId,
) -> Result<RecordDict, CodecError> {
    let object = load(contents, object_id, ObjectKind::RecordDict)?;
    let names: Vec<String> = decode_cbor(&object.body)?;
    if names.len() != object.children.len() {
        return Err(CodecError::InvalidObject("record names do not match children"));
    }
    let mut dict = RecordDict::new();
    for (name, array_id) in names.into_iter().zip(object.children) {
        dict.insert(name, inflate_array(contents, array_id)?);
    }
    Ok(dict)
}

fn inflate_array(contents: &HashMap<ObjectId, Bytes>, object_id: ObjectId) -> Result<Bytes, CodecError> {
    let object = load(contents, object_id, ObjectKind::Array)?;
    let declared_len: u64 = decode_cbor(&object.body)?;
    let mut data = BytesMut::new();
    for chunk_id in object.children {
        let chunk = load(contents, chunk_id, ObjectKind::Chunk)?;
        data.extend_from_slice(&chunk.body);
    }
    if data.len() as u64 != declared_len {
        return Err(CodecError::InvalidObject("array length does not match chunks"));
    }
    Ok(data.freeze())
}

fn load(
    contents: &HashMap<ObjectId, Bytes>,
    object_id: ObjectId,
    kind: ObjectKind,
) -> Result<ObjectV1, CodecError> {
    let bytes = contents
        .get(&object_id)
        .ok_or(CodecError::MissingObject(object_id))?;
    let actual = object_id_of(bytes);
    if actual != object_id {
        return Err(CodecError::IntegrityMismatch {
            expected: object_id,
            actual,
        });
    }
    let object = decode_object_cbor(bytes)?;
    if object.kind != kind {
        return Err(CodecError::InvalidObject("unexpected object kind"));
    }
    Ok(object)
}
