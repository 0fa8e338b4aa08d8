//! Participant-side session: registration, heartbeat and message exchange.

use std::sync::Arc;

use fedlink_codec::{inflate_message, Message, ObjectSnapshot};
use fedlink_core::{Fab, NodeId, Run, RunId};
use fedlink_transport::messages::{
    ConfirmMessageReceivedRequest, CreateNodeRequest, DeleteNodeRequest, GetFabRequest,
    GetRunRequest, PullMessagesRequest, PushMessagesRequest,
};
use fedlink_transport::FleetApi;
use futures_util::future::BoxFuture;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::heartbeat::{send_node_heartbeat, HeartbeatMetrics, HeartbeatSender};
use crate::object_store::ObjectStoreClient;
use crate::retry::RetryInvoker;

/// Connection of one participant node to the coordinator.
///
/// Unary calls go through the channel's [`RetryInvoker`]; heartbeats run on a
/// separate task once the node is registered. Use [`NodeChannel::scoped`] or
/// [`NodeChannel::close`] to guarantee teardown: heartbeat stopped first,
/// then a single deregistration attempt, then the connection released.
pub struct NodeChannel<T: FleetApi + 'static> {
    api: Arc<T>,
    invoker: RetryInvoker,
    config: ClientConfig,
    node_id: Option<NodeId>,
    heartbeat: HeartbeatSender,
    /// Set once the coordinator stopped recognizing the node; cleared by
    /// the next successful registration.
    revoked: bool,
    closed: bool,
}

impl<T: FleetApi + 'static> NodeChannel<T> {
    pub fn new(api: Arc<T>, config: ClientConfig) -> Self {
        let invoker = config.retry_invoker();
        Self::with_invoker(api, config, invoker)
    }

    pub fn with_invoker(api: Arc<T>, config: ClientConfig, invoker: RetryInvoker) -> Self {
        let heartbeat = HeartbeatSender::new(config.heartbeat_config());
        Self {
            api,
            invoker,
            config,
            node_id: None,
            heartbeat,
            revoked: false,
            closed: false,
        }
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.node_id
    }

    pub fn heartbeat_metrics(&self) -> HeartbeatMetrics {
        self.heartbeat.metrics_snapshot()
    }

    pub fn is_heartbeat_running(&self) -> bool {
        self.heartbeat.is_running()
    }

    fn require_node(&self) -> Result<NodeId, ClientError> {
        self.node_id.ok_or_else(|| {
            tracing::error!("node instance missing");
            ClientError::NodeMissing
        })
    }

    /// Node id of a session the coordinator still recognizes.
    ///
    /// A heartbeat rejected as unrecognized revokes the session: every later
    /// operation fails with [`ClientError::UnrecognizedSession`] until
    /// [`NodeChannel::create_node`] registers again.
    fn require_live_node(&self) -> Result<NodeId, ClientError> {
        let node_id = self.require_node()?;
        if self.revoked {
            return Err(ClientError::UnrecognizedSession);
        }
        Ok(node_id)
    }

    /// Like [`Self::require_live_node`], also surfacing a failed heartbeat.
    async fn require_session(&mut self) -> Result<NodeId, ClientError> {
        let node_id = self.require_live_node()?;
        if let Err(err) = self.heartbeat.check().await {
            if matches!(err, ClientError::UnrecognizedSession) {
                tracing::error!(?node_id, "session revoked by the coordinator");
                self.revoked = true;
            }
            return Err(err);
        }
        Ok(node_id)
    }

    /// Registers with the coordinator and starts the heartbeat.
    ///
    /// Calling it on an already registered channel registers a second node
    /// identity; the heartbeat is moved over to the new one.
    pub async fn create_node(&mut self) -> Result<NodeId, ClientError> {
        let api = &self.api;
        let request = CreateNodeRequest {
            heartbeat_interval: self.config.heartbeat_interval,
        };
        let response = self
            .invoker
            .invoke(|| api.create_node(request.clone()))
            .await?;
        let node_id = response.node_id;

        self.heartbeat.stop().await;
        self.node_id = Some(node_id);
        self.revoked = false;
        self.start_heartbeat(node_id);
        tracing::info!(?node_id, "node registered");
        Ok(node_id)
    }

    fn start_heartbeat(&mut self, node_id: NodeId) {
        let api = Arc::clone(&self.api);
        let interval = self.config.heartbeat_interval;
        let call_timeout = self.config.heartbeat_call_timeout;
        self.heartbeat.start(move || {
            let api = Arc::clone(&api);
            async move { send_node_heartbeat(&*api, node_id, interval, call_timeout).await }
        });
    }

    /// Stops the heartbeat and deregisters the node.
    pub async fn delete_node(&mut self) -> Result<(), ClientError> {
        let invoker = self.invoker.clone();
        self.deregister(&invoker).await
    }

    async fn deregister(&mut self, invoker: &RetryInvoker) -> Result<(), ClientError> {
        let node_id = self.require_node()?;
        self.heartbeat.stop().await;
        if self.revoked {
            tracing::info!(?node_id, "dropping revoked node without deregistering");
            self.node_id = None;
            self.revoked = false;
            return Ok(());
        }
        let api = &self.api;
        invoker
            .invoke(|| api.delete_node(DeleteNodeRequest { node_id }))
            .await?;
        self.node_id = None;
        tracing::info!(?node_id, "node deregistered");
        Ok(())
    }

    /// Pulls at most one message addressed to this node.
    ///
    /// A message addressed to another node is discarded and `None` returned.
    pub async fn receive(&mut self) -> Result<Option<Message>, ClientError> {
        let node_id = self.require_session().await?;

        let api = &self.api;
        let response = self
            .invoker
            .invoke(|| api.pull_messages(PullMessagesRequest { node_id }))
            .await?;
        let (Some(envelope), Some(tree)) = (
            response.messages.into_iter().next(),
            response.object_trees.into_iter().next(),
        ) else {
            return Ok(None);
        };
        if envelope.metadata.dst_node_id != node_id {
            tracing::warn!(
                ?node_id,
                dst_node_id = ?envelope.metadata.dst_node_id,
                "discarding message addressed to another node"
            );
            return Ok(None);
        }

        let message_id = tree.object_id;
        let run_id = envelope.metadata.run_id;
        let store = ObjectStoreClient::new(&**api, node_id, run_id);
        let contents = store
            .pull(&tree.unique_ids(), &self.config.pull_policy())
            .await?;
        self.invoker
            .invoke(|| {
                api.confirm_message_received(ConfirmMessageReceivedRequest {
                    node_id,
                    run_id,
                    message_object_id: message_id,
                })
            })
            .await?;

        let message = inflate_message(message_id, &contents)?.finalize(message_id);
        tracing::debug!(%message_id, ?run_id, "message received");
        Ok(Some(message))
    }

    /// Pushes one message (typically a reply) and the objects the coordinator lacks.
    pub async fn send(&mut self, message: &Message) -> Result<(), ClientError> {
        let node_id = self.require_session().await?;

        let snapshot = ObjectSnapshot::capture_with_chunk_size(message, self.config.max_chunk_size)?;
        let message_id = snapshot.root_id();
        let run_id = message.metadata().run_id;
        let request = PushMessagesRequest {
            node_id,
            messages: vec![message.envelope().with_message_id(message_id)],
            object_trees: vec![snapshot.tree().clone()],
        };
        let api = &self.api;
        let response = self
            .invoker
            .invoke(|| api.push_messages(request.clone()))
            .await?;

        let Some(to_push) = response.objects_to_push.get(&message_id) else {
            tracing::warn!(%message_id, "coordinator did not accept the message");
            return Ok(());
        };
        let store = ObjectStoreClient::new(&**api, node_id, run_id);
        let pushed = store
            .push(&snapshot, to_push, &self.config.push_policy())
            .await?;
        tracing::debug!(%message_id, pushed, "message sent");
        Ok(())
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<Run, ClientError> {
        let node_id = self.require_live_node()?;
        let api = &self.api;
        let response = self
            .invoker
            .invoke(|| api.get_run(GetRunRequest { node_id, run_id }))
            .await?;
        response.run.ok_or(ClientError::RunNotFound(run_id))
    }

    pub async fn get_fab(&self, hash_str: &str, run_id: RunId) -> Result<Fab, ClientError> {
        let node_id = self.require_live_node()?;
        let api = &self.api;
        let request = GetFabRequest {
            node_id,
            hash_str: hash_str.to_string(),
            run_id,
        };
        let response = self
            .invoker
            .invoke(|| api.get_fab(request.clone()))
            .await?;
        Ok(response.fab)
    }

    /// Runs `body` and then tears the session down, whatever the outcome.
    pub async fn scoped<R, F>(mut self, body: F) -> Result<R, ClientError>
    where
        F: for<'c> FnOnce(&'c mut NodeChannel<T>) -> BoxFuture<'c, Result<R, ClientError>>,
    {
        let result = body(&mut self).await;
        if let Err(err) = &result {
            tracing::error!(error = %err, "node session failed");
        }
        self.teardown().await;
        result
    }

    /// Tears the session down.
    pub async fn close(mut self) {
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.heartbeat.stop().await;
        if self.node_id.is_some() {
            let once = self.invoker.without_retries();
            if let Err(err) = self.deregister(&once).await {
                tracing::debug!(error = %err, "deregistration during teardown failed");
            }
            self.node_id = None;
        }
        self.api.close().await;
    }
}

impl<T: FleetApi + 'static> Drop for NodeChannel<T> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.heartbeat.abort();
        let node_id = self.node_id.take();
        let api = Arc::clone(&self.api);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(?node_id, "node channel dropped outside a runtime, skipping teardown");
            return;
        };
        runtime.spawn(async move {
            if let Some(node_id) = node_id {
                if let Err(err) = api.delete_node(DeleteNodeRequest { node_id }).await {
                    tracing::debug!(error = %err, "deregistration on drop failed");
                }
            }
            api.close().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use fedlink_codec::{Message, MessageEnvelope, ObjectSnapshot, RecordDict};
    use fedlink_core::{NodeId, Run, RunId};
    use fedlink_transport::memory::{Call, InMemoryCoordinator};
    use fedlink_transport::StatusCode;

    use super::NodeChannel;
    use crate::config::ClientConfig;
    use crate::error::ClientError;

    fn config() -> ClientConfig {
        ClientConfig {
            heartbeat_interval: Duration::from_secs(10),
            ..ClientConfig::default()
        }
    }

    fn channel(coordinator: &Arc<InMemoryCoordinator>) -> NodeChannel<InMemoryCoordinator> {
        NodeChannel::new(Arc::clone(coordinator), config())
    }

    #[tokio::test(start_paused = true)]
    async fn operations_require_registration() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let mut node = channel(&coordinator);

        assert!(matches!(node.receive().await, Err(ClientError::NodeMissing)));
        assert!(matches!(node.delete_node().await, Err(ClientError::NodeMissing)));
        assert_eq!(coordinator.call_count(Call::PullMessages), 0);
        node.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn create_node_registers_and_starts_heartbeat() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let mut node = channel(&coordinator);

        let node_id = node.create_node().await.expect("create node");
        assert!(coordinator.is_registered(node_id));
        assert!(node.is_heartbeat_running());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(node.heartbeat_metrics().delivered, 1);

        node.delete_node().await.expect("delete node");
        assert!(!coordinator.is_registered(node_id));
        assert!(!node.is_heartbeat_running());
        assert_eq!(node.node_id(), None);
        node.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn create_node_retries_unavailable() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        coordinator.fail_next(Call::CreateNode, StatusCode::Unavailable, 2);
        let mut node = channel(&coordinator);

        node.create_node().await.expect("create node");
        assert_eq!(coordinator.call_count(Call::CreateNode), 3);
        node.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn receive_with_empty_inbox_returns_none() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let mut node = channel(&coordinator);
        node.create_node().await.expect("create node");

        assert!(node.receive().await.expect("receive").is_none());
        node.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn misaddressed_message_is_discarded() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let mut node = channel(&coordinator);
        let node_id = node.create_node().await.expect("create node");

        let message = Message::new(RecordDict::new(), NodeId(4242), "train")
            .with_route(RunId(1), NodeId(1));
        let snapshot = ObjectSnapshot::capture(&message).expect("capture");
        coordinator.inject_message(
            node_id,
            MessageEnvelope {
                metadata: message.metadata().clone(),
            },
            snapshot.tree().clone(),
        );

        assert!(node.receive().await.expect("receive").is_none());
        assert_eq!(coordinator.call_count(Call::PullObject), 0);
        node.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn receive_pulls_confirms_and_inflates() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let mut node = channel(&coordinator);
        let node_id = node.create_node().await.expect("create node");

        let mut content = RecordDict::new();
        content.insert("weights", Bytes::from(vec![1_u8; 128]));
        let message = Message::new(content, node_id, "train").with_route(RunId(3), NodeId(1));
        let snapshot = ObjectSnapshot::capture(&message).expect("capture");
        coordinator.inject_message(
            node_id,
            MessageEnvelope {
                metadata: message.metadata().clone(),
            },
            snapshot.tree().clone(),
        );
        for (id, bytes) in snapshot.objects() {
            coordinator.preload_object(*id, bytes.clone());
        }

        let received = node
            .receive()
            .await
            .expect("receive")
            .expect("a message should be delivered");
        assert_eq!(received.metadata().message_id(), Some(snapshot.root_id()));
        assert_eq!(received.content(), message.content());
        assert_eq!(coordinator.pending_for(node_id), 0);
        assert_eq!(coordinator.call_count(Call::ConfirmMessageReceived), 1);
        node.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unrecognized_node_surfaces_on_next_operation() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let mut node = channel(&coordinator);
        let node_id = node.create_node().await.expect("create node");

        coordinator.forget_node(node_id);
        // First beat fires immediately and is rejected.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!node.is_heartbeat_running());

        let err = node.receive().await.expect_err("session should be gone");
        assert!(matches!(err, ClientError::UnrecognizedSession));
        node.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn revoked_session_stays_revoked_until_registered_again() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        coordinator.add_run(Run::with_id(RunId(2)));
        let mut node = channel(&coordinator);
        let first_id = node.create_node().await.expect("create node");

        coordinator.forget_node(first_id);
        tokio::time::sleep(Duration::from_millis(10)).await;

        for _ in 0..2 {
            let err = node.receive().await.expect_err("session should stay revoked");
            assert!(matches!(err, ClientError::UnrecognizedSession));
        }
        let reply = Message::new(RecordDict::new(), NodeId(1), "train").with_route(RunId(2), first_id);
        assert!(matches!(
            node.send(&reply).await,
            Err(ClientError::UnrecognizedSession)
        ));
        assert!(matches!(
            node.get_run(RunId(2)).await,
            Err(ClientError::UnrecognizedSession)
        ));
        assert_eq!(coordinator.call_count(Call::PullMessages), 0);
        assert_eq!(coordinator.call_count(Call::PushMessages), 0);

        let second_id = node.create_node().await.expect("register again");
        assert_ne!(second_id, first_id);
        assert!(node.receive().await.expect("receive").is_none());
        assert_eq!(node.get_run(RunId(2)).await.expect("get run").run_id, RunId(2));
        node.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn deleting_a_revoked_node_skips_the_coordinator() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let mut node = channel(&coordinator);
        let node_id = node.create_node().await.expect("create node");

        coordinator.forget_node(node_id);
        tokio::time::sleep(Duration::from_millis(10)).await;
        node.receive().await.expect_err("session should be gone");

        node.delete_node().await.expect("delete revoked node");
        assert_eq!(node.node_id(), None);
        assert_eq!(coordinator.call_count(Call::DeleteNode), 0);
        node.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn get_run_reports_missing_run() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        coordinator.add_run(Run::with_id(RunId(9)));
        let mut node = channel(&coordinator);
        node.create_node().await.expect("create node");

        assert_eq!(node.get_run(RunId(9)).await.expect("get run").run_id, RunId(9));
        assert!(matches!(
            node.get_run(RunId(10)).await,
            Err(ClientError::RunNotFound(RunId(10)))
        ));
        node.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_deregisters_once_and_releases_connection() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        coordinator.fail_next(Call::DeleteNode, StatusCode::Unavailable, 1);
        let mut node = channel(&coordinator);
        let node_id = node.create_node().await.expect("create node");

        node.close().await;
        assert_eq!(coordinator.call_count(Call::DeleteNode), 1);
        assert!(coordinator.is_registered(node_id));
        assert!(coordinator.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_without_close_still_deregisters() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let mut node = channel(&coordinator);
        let node_id = node.create_node().await.expect("create node");

        drop(node);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!coordinator.is_registered(node_id));
        assert!(coordinator.is_closed());
    }
}
