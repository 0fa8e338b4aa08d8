use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use fedlink_core::constants::MESSAGE_DEFAULT_TTL;
use fedlink_core::{NodeId, ObjectId, RunId};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Envelope fields of a message.
///
/// `message_id` is the content address of the message's root object. It is
/// never part of the hashed bytes and is only known once the content has been
/// deflated (outbound) or pulled (inbound), so it starts out empty and is set
/// through [`Message::with_message_id`] / [`crate::InflatedMessage::finalize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    message_id: Option<ObjectId>,
    pub run_id: RunId,
    pub src_node_id: NodeId,
    pub dst_node_id: NodeId,
    pub reply_to_message_id: Option<ObjectId>,
    pub group_id: String,
    pub ttl: Duration,
    pub message_type: String,
    pub created_at_micros: u64,
}

impl Metadata {
    /// Content-derived id, if already known.
    pub fn message_id(&self) -> Option<ObjectId> {
        self.message_id
    }

    /// Checks the invariants of a freshly created (non-reply) outbound message.
    pub fn validate_outbound(&self) -> Result<(), CodecError> {
        if self.message_id.is_none() {
            return Err(CodecError::InvalidMessage("message_id must not be empty"));
        }
        if self.reply_to_message_id.is_some() {
            return Err(CodecError::InvalidMessage(
                "reply_to_message_id must be empty on a new message",
            ));
        }
        if self.ttl.is_zero() {
            return Err(CodecError::InvalidMessage("ttl must be positive"));
        }
        Ok(())
    }

    /// Attaches the content-derived id, e.g. when building a control-plane envelope.
    pub fn with_message_id(mut self, message_id: ObjectId) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub(crate) fn without_id(&self) -> Self {
        Self {
            message_id: None,
            ..self.clone()
        }
    }
}

/// Error payload carried instead of content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageError {
    /// One of [`fedlink_core::constants::error_code`].
    pub code: i64,
    pub reason: String,
}

/// Opaque named byte records forming a message's content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordDict {
    records: BTreeMap<String, Bytes>,
}

impl RecordDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a record, returning the previous bytes.
    pub fn insert(&mut self, name: impl Into<String>, data: impl Into<Bytes>) -> Option<Bytes> {
        self.records.insert(name.into(), data.into())
    }

    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.records.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Bytes)> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Message body: content or an error, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Content(RecordDict),
    Error(MessageError),
}

/// A message: envelope metadata plus its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    metadata: Metadata,
    payload: Payload,
}

/// Control-plane form of a message: the envelope without its bulky content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub metadata: Metadata,
}

impl MessageEnvelope {
    pub fn with_message_id(mut self, message_id: ObjectId) -> Self {
        self.metadata = self.metadata.with_message_id(message_id);
        self
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

impl Message {
    /// Creates a new outbound message addressed to `dst_node_id`.
    ///
    /// `run_id` and `src_node_id` are stamped by the sending channel.
    pub fn new(content: RecordDict, dst_node_id: NodeId, message_type: impl Into<String>) -> Self {
        Self {
            metadata: Metadata {
                message_id: None,
                run_id: RunId(0),
                src_node_id: NodeId(0),
                dst_node_id,
                reply_to_message_id: None,
                group_id: String::new(),
                ttl: MESSAGE_DEFAULT_TTL,
                message_type: message_type.into(),
                created_at_micros: now_micros(),
            },
            payload: Payload::Content(content),
        }
    }

    pub(crate) fn from_parts(metadata: Metadata, payload: Payload) -> Self {
        Self { metadata, payload }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.metadata.ttl = ttl;
        self
    }

    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.metadata.group_id = group_id.into();
        self
    }

    pub fn with_created_at_micros(mut self, created_at_micros: u64) -> Self {
        self.metadata.created_at_micros = created_at_micros;
        self
    }

    /// Records the content-derived id once the message has been deflated.
    pub fn with_message_id(mut self, message_id: ObjectId) -> Self {
        self.metadata = self.metadata.with_message_id(message_id);
        self
    }

    /// Stamps routing fields owned by the sending side.
    ///
    /// Any previously assigned message id is cleared because the root
    /// object's bytes change with the route.
    pub fn with_route(mut self, run_id: RunId, src_node_id: NodeId) -> Self {
        self.metadata.run_id = run_id;
        self.metadata.src_node_id = src_node_id;
        self.metadata.message_id = None;
        self
    }

    /// Builds a reply carrying `content`, routed back to this message's sender.
    pub fn create_reply(&self, content: RecordDict) -> Result<Message, CodecError> {
        self.reply_with(Payload::Content(content))
    }

    /// Builds a reply carrying an error instead of content.
    pub fn create_error_reply(&self, error: MessageError) -> Result<Message, CodecError> {
        self.reply_with(Payload::Error(error))
    }

    fn reply_with(&self, payload: Payload) -> Result<Message, CodecError> {
        let reply_to = self
            .metadata
            .message_id
            .ok_or(CodecError::InvalidMessage("cannot reply to a message without id"))?;
        Ok(Self {
            metadata: Metadata {
                message_id: None,
                run_id: self.metadata.run_id,
                src_node_id: self.metadata.dst_node_id,
                dst_node_id: self.metadata.src_node_id,
                reply_to_message_id: Some(reply_to),
                group_id: self.metadata.group_id.clone(),
                ttl: self.metadata.ttl,
                message_type: self.metadata.message_type.clone(),
                created_at_micros: now_micros(),
            },
            payload,
        })
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn content(&self) -> Option<&RecordDict> {
        match &self.payload {
            Payload::Content(content) => Some(content),
            Payload::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&MessageError> {
        match &self.payload {
            Payload::Content(_) => None,
            Payload::Error(error) => Some(error),
        }
    }

    /// Strips the payload for the control-plane call.
    pub fn envelope(&self) -> MessageEnvelope {
        MessageEnvelope {
            metadata: self.metadata.clone(),
        }
    }
}
