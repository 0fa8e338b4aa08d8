use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fedlink_client::{ClientConfig, ClientError, NodeChannel};
use fedlink_core::{Fab, NodeId, RunId};
use fedlink_transport::memory::{Call, InMemoryCoordinator, FIRST_ASSIGNED_NODE_ID};
use fedlink_transport::messages::{
    ConfirmMessageReceivedRequest, CreateNodeRequest, CreateNodeResponse, DeleteNodeRequest,
    GetFabRequest, GetFabResponse, GetRunRequest, GetRunResponse, PullMessagesRequest,
    PullMessagesResponse, PullObjectRequest, PullObjectResponse, PushMessagesRequest,
    PushMessagesResponse, PushObjectRequest, PushObjectResponse, SendNodeHeartbeatRequest,
    SendNodeHeartbeatResponse,
};
use fedlink_transport::{FleetApi, LinkApi, RpcError, StatusCode};

/// Coordinator whose heartbeat endpoint stalls for `stall`.
struct StallingHeartbeats {
    inner: InMemoryCoordinator,
    stall: Duration,
}

#[async_trait]
impl LinkApi for StallingHeartbeats {
    async fn push_object(&self, request: PushObjectRequest) -> Result<PushObjectResponse, RpcError> {
        self.inner.push_object(request).await
    }

    async fn pull_object(&self, request: PullObjectRequest) -> Result<PullObjectResponse, RpcError> {
        self.inner.pull_object(request).await
    }

    async fn confirm_message_received(
        &self,
        request: ConfirmMessageReceivedRequest,
    ) -> Result<(), RpcError> {
        self.inner.confirm_message_received(request).await
    }

    async fn get_run(&self, request: GetRunRequest) -> Result<GetRunResponse, RpcError> {
        self.inner.get_run(request).await
    }
}

#[async_trait]
impl FleetApi for StallingHeartbeats {
    async fn create_node(&self, request: CreateNodeRequest) -> Result<CreateNodeResponse, RpcError> {
        self.inner.create_node(request).await
    }

    async fn delete_node(&self, request: DeleteNodeRequest) -> Result<(), RpcError> {
        self.inner.delete_node(request).await
    }

    async fn send_node_heartbeat(
        &self,
        request: SendNodeHeartbeatRequest,
    ) -> Result<SendNodeHeartbeatResponse, RpcError> {
        tokio::time::sleep(self.stall).await;
        self.inner.send_node_heartbeat(request).await
    }

    async fn pull_messages(&self, request: PullMessagesRequest) -> Result<PullMessagesResponse, RpcError> {
        self.inner.pull_messages(request).await
    }

    async fn push_messages(&self, request: PushMessagesRequest) -> Result<PushMessagesResponse, RpcError> {
        self.inner.push_messages(request).await
    }

    async fn get_fab(&self, request: GetFabRequest) -> Result<GetFabResponse, RpcError> {
        self.inner.get_fab(request).await
    }
}

fn config() -> ClientConfig {
    ClientConfig {
        heartbeat_interval: Duration::from_secs(20),
        ..ClientConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn scoped_session_tears_down_after_success() {
    let coordinator = Arc::new(InMemoryCoordinator::new());
    let node = NodeChannel::new(Arc::clone(&coordinator), config());

    let node_id = node
        .scoped(|ch| Box::pin(async move { ch.create_node().await }))
        .await
        .expect("session body");

    assert_eq!(node_id, NodeId(FIRST_ASSIGNED_NODE_ID));
    assert!(!coordinator.is_registered(node_id));
    assert_eq!(coordinator.call_count(Call::DeleteNode), 1);
    assert!(coordinator.is_closed());
}

#[tokio::test(start_paused = true)]
async fn scoped_session_tears_down_after_failure() {
    let coordinator = Arc::new(InMemoryCoordinator::new());
    let node = NodeChannel::new(Arc::clone(&coordinator), config());

    let err = node
        .scoped(|ch| {
            Box::pin(async move {
                ch.create_node().await?;
                ch.get_fab("missing", RunId(1)).await
            })
        })
        .await
        .expect_err("fab lookup should fail");

    assert!(matches!(err, ClientError::Rpc(ref e) if e.code == StatusCode::NotFound));
    assert_eq!(coordinator.call_count(Call::DeleteNode), 1);
    assert!(!coordinator.is_registered(NodeId(FIRST_ASSIGNED_NODE_ID)));
    assert!(coordinator.is_closed());
}

#[tokio::test(start_paused = true)]
async fn teardown_attempts_deregistration_once_and_swallows_failure() {
    let coordinator = Arc::new(InMemoryCoordinator::new());
    coordinator.fail_next(Call::DeleteNode, StatusCode::Unavailable, 3);
    let node = NodeChannel::new(Arc::clone(&coordinator), config());

    let node_id = node
        .scoped(|ch| Box::pin(async move { ch.create_node().await }))
        .await
        .expect("teardown errors are not reported");

    assert_eq!(coordinator.call_count(Call::DeleteNode), 1);
    assert!(coordinator.is_registered(node_id));
    assert!(coordinator.is_closed());
}

#[tokio::test(start_paused = true)]
async fn explicit_delete_node_retries_transient_failures() {
    let coordinator = Arc::new(InMemoryCoordinator::new());
    coordinator.fail_next(Call::DeleteNode, StatusCode::Unavailable, 2);
    let mut node = NodeChannel::new(Arc::clone(&coordinator), config());
    let node_id = node.create_node().await.expect("create node");

    node.delete_node().await.expect("delete node");
    assert_eq!(coordinator.call_count(Call::DeleteNode), 3);
    assert!(!coordinator.is_registered(node_id));

    node.close().await;
    assert_eq!(coordinator.call_count(Call::DeleteNode), 3);
}

#[tokio::test(start_paused = true)]
async fn immediate_deregistration_sends_at_most_one_heartbeat() {
    let coordinator = Arc::new(InMemoryCoordinator::new());
    let mut node = NodeChannel::new(Arc::clone(&coordinator), config());
    node.create_node().await.expect("create node");
    node.delete_node().await.expect("delete node");

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(coordinator.call_count(Call::SendNodeHeartbeat) <= 1);
    node.close().await;
}

#[tokio::test(start_paused = true)]
async fn heartbeat_keeps_beating_at_the_configured_cadence() {
    let coordinator = Arc::new(InMemoryCoordinator::new());
    let mut node = NodeChannel::new(Arc::clone(&coordinator), config());
    node.create_node().await.expect("create node");

    // Beats every 20s * 0.8 * (1 +/- 0.1), i.e. 14.4s to 17.6s apart.
    tokio::time::sleep(Duration::from_secs(60)).await;
    let beats = coordinator.call_count(Call::SendNodeHeartbeat);
    assert!((4..=5).contains(&beats), "unexpected beat count {beats}");
    assert_eq!(node.heartbeat_metrics().missed, 0);

    node.close().await;
}

#[tokio::test(start_paused = true)]
async fn unavailable_heartbeats_back_off_and_recover() {
    let coordinator = Arc::new(InMemoryCoordinator::new());
    coordinator.fail_next(Call::SendNodeHeartbeat, StatusCode::Unavailable, 3);
    let mut node = NodeChannel::new(Arc::clone(&coordinator), config());
    node.create_node().await.expect("create node");

    // Retries after 1s, 2s and 4s; the fourth beat at t = 7s succeeds.
    tokio::time::sleep(Duration::from_secs(8)).await;
    let metrics = node.heartbeat_metrics();
    assert_eq!(metrics.missed, 3);
    assert_eq!(metrics.delivered, 1);
    assert!(node.is_heartbeat_running());
    assert!(node.receive().await.expect("receive").is_none());

    node.close().await;
}

#[tokio::test(start_paused = true)]
async fn fab_is_fetched_by_hash() {
    let coordinator = Arc::new(InMemoryCoordinator::new());
    coordinator.add_fab(Fab {
        hash_str: "abc123".to_string(),
        content: vec![1, 2, 3],
    });
    let mut node = NodeChannel::new(Arc::clone(&coordinator), config());
    node.create_node().await.expect("create node");

    let fab = node.get_fab("abc123", RunId(1)).await.expect("fab");
    assert_eq!(fab.content, vec![1, 2, 3]);
    node.close().await;
}

#[tokio::test(start_paused = true)]
async fn stalled_heartbeat_calls_count_as_missed() {
    let api = Arc::new(StallingHeartbeats {
        inner: InMemoryCoordinator::new(),
        stall: Duration::from_secs(60),
    });
    let mut node = NodeChannel::new(Arc::clone(&api), config());
    node.create_node().await.expect("create node");

    // Each call is cut off after 5s: misses at t = 5 and t = 11 (5s + 1s backoff + 5s).
    tokio::time::sleep(Duration::from_secs(12)).await;
    let metrics = node.heartbeat_metrics();
    assert_eq!(metrics.missed, 2);
    assert_eq!(metrics.delivered, 0);
    assert!(node.is_heartbeat_running());

    node.close().await;
    assert_eq!(api.inner.call_count(Call::DeleteNode), 1);
}
