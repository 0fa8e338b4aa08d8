//! In-memory coordinator for tests and simulations.
//!
//! Implements both [`FleetApi`] and [`AppIoApi`] over one shared store, so a
//! participant channel and an application channel can talk to each other
//! without a network. Calls can be scripted to fail with a status code.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use fedlink_codec::{MessageEnvelope, ObjectTree};
use fedlink_core::hash::object_id_of;
use fedlink_core::{Fab, NodeId, ObjectId, Run, RunId};

use crate::api::{AppIoApi, FleetApi, LinkApi};
use crate::messages::{
    ConfirmMessageReceivedRequest, CreateNodeRequest, CreateNodeResponse, DeleteNodeRequest,
    GetFabRequest, GetFabResponse, GetNodesRequest, GetNodesResponse, GetRunRequest,
    GetRunResponse, PullAppMessagesRequest, PullMessagesRequest, PullMessagesResponse,
    PullObjectRequest, PullObjectResponse, PushAppMessagesRequest, PushMessagesRequest,
    PushMessagesResponse, PushObjectRequest, PushObjectResponse, SendNodeHeartbeatRequest,
    SendNodeHeartbeatResponse,
};
use crate::status::{RpcError, StatusCode};

/// First node id handed out by [`InMemoryCoordinator`].
pub const FIRST_ASSIGNED_NODE_ID: u64 = 1_000;

/// RPC names used for call accounting and failure scripting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    CreateNode,
    DeleteNode,
    SendNodeHeartbeat,
    PullMessages,
    PushMessages,
    PullObject,
    PushObject,
    ConfirmMessageReceived,
    GetRun,
    GetFab,
    GetNodes,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: ObjectId,
    envelope: MessageEnvelope,
    tree: ObjectTree,
}

#[derive(Debug, Default)]
struct CoordinatorState {
    next_node_id: u64,
    nodes: HashSet<NodeId>,
    runs: HashMap<RunId, Run>,
    fabs: HashMap<String, Fab>,
    /// Announced objects; `None` until the bytes are uploaded.
    objects: HashMap<ObjectId, Option<Bytes>>,
    node_inbox: HashMap<NodeId, VecDeque<StoredMessage>>,
    replies: Vec<StoredMessage>,
    calls: HashMap<Call, u64>,
    scripted: HashMap<Call, VecDeque<RpcError>>,
    closed: bool,
}

impl CoordinatorState {
    /// Registers every id of `tree` and returns those without bytes yet.
    fn announce(&mut self, tree: &ObjectTree) -> Vec<ObjectId> {
        tree.unique_ids()
            .into_iter()
            .filter(|id| {
                let slot = self.objects.entry(*id).or_insert(None);
                slot.is_none()
            })
            .collect()
    }

    fn store(&mut self, envelope: MessageEnvelope, tree: ObjectTree) -> (ObjectId, Vec<ObjectId>) {
        let message_id = tree.object_id;
        let missing = self.announce(&tree);
        let stored = StoredMessage {
            message_id,
            envelope,
            tree,
        };
        if stored.envelope.metadata.reply_to_message_id.is_some() {
            self.replies.retain(|m| m.message_id != message_id);
            self.replies.push(stored);
        } else {
            let inbox = self
                .node_inbox
                .entry(stored.envelope.metadata.dst_node_id)
                .or_default();
            if !inbox.iter().any(|m| m.message_id == message_id) {
                inbox.push_back(stored);
            }
        }
        (message_id, missing)
    }
}

/// Shared in-memory coordinator implementing both RPC surfaces.
#[derive(Debug)]
pub struct InMemoryCoordinator {
    state: Mutex<CoordinatorState>,
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CoordinatorState {
                next_node_id: FIRST_ASSIGNED_NODE_ID,
                ..CoordinatorState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts the call and pops a scripted failure, if any.
    fn enter(&self, call: Call) -> Result<MutexGuard<'_, CoordinatorState>, RpcError> {
        let mut state = self.lock();
        *state.calls.entry(call).or_insert(0) += 1;
        if let Some(err) = state.scripted.get_mut(&call).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(state)
    }

    /// Makes the next `times` invocations of `call` fail with `code`.
    pub fn fail_next(&self, call: Call, code: StatusCode, times: usize) {
        let mut state = self.lock();
        let queue = state.scripted.entry(call).or_default();
        for _ in 0..times {
            queue.push_back(RpcError::new(code, format!("scripted {code:?}")));
        }
    }

    /// Number of invocations of `call` so far, failed ones included.
    pub fn call_count(&self, call: Call) -> u64 {
        self.lock().calls.get(&call).copied().unwrap_or(0)
    }

    pub fn add_run(&self, run: Run) {
        self.lock().runs.insert(run.run_id, run);
    }

    pub fn add_fab(&self, fab: Fab) {
        self.lock().fabs.insert(fab.hash_str.clone(), fab);
    }

    /// Registers a node without going through `create_node`.
    pub fn register_node(&self, node_id: NodeId) {
        self.lock().nodes.insert(node_id);
    }

    /// Drops a node so its heartbeats are no longer recognized.
    pub fn forget_node(&self, node_id: NodeId) {
        self.lock().nodes.remove(&node_id);
    }

    pub fn is_registered(&self, node_id: NodeId) -> bool {
        self.lock().nodes.contains(&node_id)
    }

    /// Places an envelope directly in `node_id`'s inbox, bypassing routing.
    pub fn inject_message(&self, node_id: NodeId, envelope: MessageEnvelope, tree: ObjectTree) {
        let mut state = self.lock();
        state.announce(&tree);
        state
            .node_inbox
            .entry(node_id)
            .or_default()
            .push_back(StoredMessage {
                message_id: tree.object_id,
                envelope,
                tree,
            });
    }

    /// Uploads object bytes without a client round-trip.
    pub fn preload_object(&self, object_id: ObjectId, bytes: Bytes) {
        self.lock().objects.insert(object_id, Some(bytes));
    }

    /// Forgets the bytes of an object while keeping it announced.
    pub fn evict_object(&self, object_id: ObjectId) {
        if let Some(slot) = self.lock().objects.get_mut(&object_id) {
            *slot = None;
        }
    }

    pub fn has_object(&self, object_id: ObjectId) -> bool {
        matches!(self.lock().objects.get(&object_id), Some(Some(_)))
    }

    /// Messages waiting in `node_id`'s inbox.
    pub fn pending_for(&self, node_id: NodeId) -> usize {
        self.lock().node_inbox.get(&node_id).map_or(0, VecDeque::len)
    }

    /// Replies not yet confirmed by the application side.
    pub fn pending_replies(&self) -> usize {
        self.lock().replies.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

fn pull_response(messages: Vec<StoredMessage>) -> PullMessagesResponse {
    let mut response = PullMessagesResponse::default();
    for stored in messages {
        response.messages.push(stored.envelope);
        response.object_trees.push(stored.tree);
    }
    response
}

fn push_response(
    state: &mut CoordinatorState,
    messages: Vec<MessageEnvelope>,
    object_trees: Vec<ObjectTree>,
) -> Result<PushMessagesResponse, RpcError> {
    if messages.len() != object_trees.len() {
        return Err(RpcError::new(
            StatusCode::InvalidArgument,
            "messages and object trees differ in length",
        ));
    }
    let mut response = PushMessagesResponse::default();
    for (envelope, tree) in messages.into_iter().zip(object_trees) {
        let (message_id, missing) = state.store(envelope, tree);
        response.objects_to_push.insert(message_id, missing);
    }
    Ok(response)
}

#[async_trait]
impl LinkApi for InMemoryCoordinator {
    async fn push_object(&self, request: PushObjectRequest) -> Result<PushObjectResponse, RpcError> {
        let mut state = self.enter(Call::PushObject)?;
        if object_id_of(&request.object_content) != request.object_id {
            return Err(RpcError::new(
                StatusCode::InvalidArgument,
                "object content does not match object id",
            ));
        }
        match state.objects.get_mut(&request.object_id) {
            Some(slot) => {
                *slot = Some(request.object_content);
                Ok(PushObjectResponse { stored: true })
            }
            None => Ok(PushObjectResponse { stored: false }),
        }
    }

    async fn pull_object(&self, request: PullObjectRequest) -> Result<PullObjectResponse, RpcError> {
        let state = self.enter(Call::PullObject)?;
        let response = match state.objects.get(&request.object_id) {
            None => PullObjectResponse {
                object_found: false,
                object_available: false,
                object_content: Bytes::new(),
            },
            Some(None) => PullObjectResponse {
                object_found: true,
                object_available: false,
                object_content: Bytes::new(),
            },
            Some(Some(bytes)) => PullObjectResponse {
                object_found: true,
                object_available: true,
                object_content: bytes.clone(),
            },
        };
        Ok(response)
    }

    async fn confirm_message_received(
        &self,
        request: ConfirmMessageReceivedRequest,
    ) -> Result<(), RpcError> {
        let mut state = self.enter(Call::ConfirmMessageReceived)?;
        let id = request.message_object_id;
        for inbox in state.node_inbox.values_mut() {
            inbox.retain(|m| m.message_id != id);
        }
        state.replies.retain(|m| m.message_id != id);
        Ok(())
    }

    async fn get_run(&self, request: GetRunRequest) -> Result<GetRunResponse, RpcError> {
        let state = self.enter(Call::GetRun)?;
        Ok(GetRunResponse {
            run: state.runs.get(&request.run_id).cloned(),
        })
    }

    async fn close(&self) {
        self.lock().closed = true;
    }
}

#[async_trait]
impl FleetApi for InMemoryCoordinator {
    async fn create_node(&self, _request: CreateNodeRequest) -> Result<CreateNodeResponse, RpcError> {
        let mut state = self.enter(Call::CreateNode)?;
        let node_id = NodeId(state.next_node_id);
        state.next_node_id += 1;
        state.nodes.insert(node_id);
        Ok(CreateNodeResponse { node_id })
    }

    async fn delete_node(&self, request: DeleteNodeRequest) -> Result<(), RpcError> {
        let mut state = self.enter(Call::DeleteNode)?;
        if !state.nodes.remove(&request.node_id) {
            return Err(RpcError::new(StatusCode::NotFound, "unknown node"));
        }
        state.node_inbox.remove(&request.node_id);
        Ok(())
    }

    async fn send_node_heartbeat(
        &self,
        request: SendNodeHeartbeatRequest,
    ) -> Result<SendNodeHeartbeatResponse, RpcError> {
        let state = self.enter(Call::SendNodeHeartbeat)?;
        Ok(SendNodeHeartbeatResponse {
            success: state.nodes.contains(&request.node_id),
        })
    }

    async fn pull_messages(&self, request: PullMessagesRequest) -> Result<PullMessagesResponse, RpcError> {
        let state = self.enter(Call::PullMessages)?;
        let next = state
            .node_inbox
            .get(&request.node_id)
            .and_then(|inbox| inbox.front().cloned());
        Ok(pull_response(next.into_iter().collect()))
    }

    async fn push_messages(&self, request: PushMessagesRequest) -> Result<PushMessagesResponse, RpcError> {
        let mut state = self.enter(Call::PushMessages)?;
        if !state.nodes.contains(&request.node_id) {
            return Err(RpcError::new(StatusCode::PermissionDenied, "unknown node"));
        }
        push_response(&mut state, request.messages, request.object_trees)
    }

    async fn get_fab(&self, request: GetFabRequest) -> Result<GetFabResponse, RpcError> {
        let state = self.enter(Call::GetFab)?;
        state
            .fabs
            .get(&request.hash_str)
            .cloned()
            .map(|fab| GetFabResponse { fab })
            .ok_or_else(|| RpcError::new(StatusCode::NotFound, "unknown fab hash"))
    }
}

#[async_trait]
impl AppIoApi for InMemoryCoordinator {
    async fn push_app_messages(
        &self,
        request: PushAppMessagesRequest,
    ) -> Result<PushMessagesResponse, RpcError> {
        let mut state = self.enter(Call::PushMessages)?;
        if !state.runs.contains_key(&request.run_id) {
            return Err(RpcError::new(StatusCode::NotFound, "unknown run"));
        }
        push_response(&mut state, request.messages, request.object_trees)
    }

    async fn pull_app_messages(
        &self,
        request: PullAppMessagesRequest,
    ) -> Result<PullMessagesResponse, RpcError> {
        let state = self.enter(Call::PullMessages)?;
        let wanted: HashSet<ObjectId> = request.message_ids.into_iter().collect();
        let replies = state
            .replies
            .iter()
            .filter(|m| {
                m.envelope.metadata.run_id == request.run_id
                    && m.envelope
                        .metadata
                        .reply_to_message_id
                        .is_some_and(|id| wanted.contains(&id))
            })
            .cloned()
            .collect();
        Ok(pull_response(replies))
    }

    async fn get_nodes(&self, _request: GetNodesRequest) -> Result<GetNodesResponse, RpcError> {
        let state = self.enter(Call::GetNodes)?;
        let mut nodes: Vec<NodeId> = state.nodes.iter().copied().collect();
        nodes.sort();
        Ok(GetNodesResponse { nodes })
    }
}
