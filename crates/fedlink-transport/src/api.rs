use async_trait::async_trait;

use crate::messages::{
    ConfirmMessageReceivedRequest, CreateNodeRequest, CreateNodeResponse, DeleteNodeRequest,
    GetFabRequest, GetFabResponse, GetNodesRequest, GetNodesResponse, GetRunRequest,
    GetRunResponse, PullAppMessagesRequest, PullMessagesRequest, PullMessagesResponse,
    PullObjectRequest, PullObjectResponse, PushAppMessagesRequest, PushMessagesRequest,
    PushMessagesResponse, PushObjectRequest, PushObjectResponse, SendNodeHeartbeatRequest,
    SendNodeHeartbeatResponse,
};
use crate::status::RpcError;

/// Calls shared by both the participant and the application side.
///
/// Every call is unary: it either returns a response or an [`RpcError`]
/// carrying a status code.
#[async_trait]
pub trait LinkApi: Send + Sync {
    /// Uploads the bytes of one announced object.
    async fn push_object(&self, request: PushObjectRequest) -> Result<PushObjectResponse, RpcError>;
    /// Downloads the bytes of one object.
    async fn pull_object(&self, request: PullObjectRequest) -> Result<PullObjectResponse, RpcError>;
    /// Lets the coordinator reclaim a delivered message.
    async fn confirm_message_received(
        &self,
        request: ConfirmMessageReceivedRequest,
    ) -> Result<(), RpcError>;
    async fn get_run(&self, request: GetRunRequest) -> Result<GetRunResponse, RpcError>;

    /// Releases the underlying connection. Further calls may fail.
    async fn close(&self) {}
}

/// Participant-side surface.
#[async_trait]
pub trait FleetApi: LinkApi {
    async fn create_node(&self, request: CreateNodeRequest) -> Result<CreateNodeResponse, RpcError>;
    async fn delete_node(&self, request: DeleteNodeRequest) -> Result<(), RpcError>;
    async fn send_node_heartbeat(
        &self,
        request: SendNodeHeartbeatRequest,
    ) -> Result<SendNodeHeartbeatResponse, RpcError>;
    async fn pull_messages(&self, request: PullMessagesRequest) -> Result<PullMessagesResponse, RpcError>;
    async fn push_messages(&self, request: PushMessagesRequest) -> Result<PushMessagesResponse, RpcError>;
    async fn get_fab(&self, request: GetFabRequest) -> Result<GetFabResponse, RpcError>;
}

/// Coordinator-application-side surface.
#[async_trait]
pub trait AppIoApi: LinkApi {
    async fn push_app_messages(
        &self,
        request: PushAppMessagesRequest,
    ) -> Result<PushMessagesResponse, RpcError>;
    async fn pull_app_messages(
        &self,
        request: PullAppMessagesRequest,
    ) -> Result<PullMessagesResponse, RpcError>;
    async fn get_nodes(&self, request: GetNodesRequest) -> Result<GetNodesResponse, RpcError>;
}
