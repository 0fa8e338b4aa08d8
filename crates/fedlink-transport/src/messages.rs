//! Request/response payloads of the coordinator RPC surface.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use fedlink_codec::{MessageEnvelope, ObjectTree};
use fedlink_core::{Fab, NodeId, ObjectId, Run, RunId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateNodeRequest {
    pub heartbeat_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateNodeResponse {
    pub node_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteNodeRequest {
    pub node_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendNodeHeartbeatRequest {
    pub node_id: NodeId,
    pub heartbeat_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendNodeHeartbeatResponse {
    /// False when the coordinator does not recognize the node.
    pub success: bool,
}

/// Participant-side pull: at most one message addressed to `node_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullMessagesRequest {
    pub node_id: NodeId,
}

/// Application-side pull: replies to the given message ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullAppMessagesRequest {
    pub run_id: RunId,
    pub message_ids: Vec<ObjectId>,
}

/// Envelopes paired index-by-index with their object trees.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullMessagesResponse {
    pub messages: Vec<MessageEnvelope>,
    pub object_trees: Vec<ObjectTree>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMessagesRequest {
    pub node_id: NodeId,
    pub messages: Vec<MessageEnvelope>,
    pub object_trees: Vec<ObjectTree>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAppMessagesRequest {
    pub run_id: RunId,
    pub messages: Vec<MessageEnvelope>,
    pub object_trees: Vec<ObjectTree>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMessagesResponse {
    /// Per accepted message id, the objects the coordinator does not hold yet.
    pub objects_to_push: HashMap<ObjectId, Vec<ObjectId>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullObjectRequest {
    pub node_id: NodeId,
    pub run_id: RunId,
    pub object_id: ObjectId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullObjectResponse {
    /// The id was announced in some pushed object tree.
    pub object_found: bool,
    /// The bytes have been uploaded and can be served.
    pub object_available: bool,
    pub object_content: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushObjectRequest {
    pub node_id: NodeId,
    pub run_id: RunId,
    pub object_id: ObjectId,
    pub object_content: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushObjectResponse {
    /// False when the id was never announced in a pushed tree.
    pub stored: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmMessageReceivedRequest {
    pub node_id: NodeId,
    pub run_id: RunId,
    pub message_object_id: ObjectId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRunRequest {
    pub node_id: NodeId,
    pub run_id: RunId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRunResponse {
    pub run: Option<Run>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetFabRequest {
    pub node_id: NodeId,
    pub hash_str: String,
    pub run_id: RunId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetFabResponse {
    pub fab: Fab,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetNodesRequest {
    pub run_id: RunId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetNodesResponse {
    pub nodes: Vec<NodeId>,
}
