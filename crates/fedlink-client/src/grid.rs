//! Application-side channel: push instructions to nodes, pull their replies.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use fedlink_codec::{inflate_message, Message, MessageEnvelope, ObjectSnapshot, ObjectTree};
use fedlink_core::constants::SUPERLINK_NODE_ID;
use fedlink_core::{NodeId, ObjectId, Run, RunId};
use fedlink_transport::messages::{
    ConfirmMessageReceivedRequest, GetNodesRequest, GetRunRequest, PullAppMessagesRequest,
    PushAppMessagesRequest,
};
use fedlink_transport::AppIoApi;
use tokio::time::Instant;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::object_store::ObjectStoreClient;
use crate::retry::RetryInvoker;

const PUSH_TOO_LARGE_HINT: &str = "pushed messages exceed the per-call size limit; \
     send fewer or smaller messages per call, or raise the coordinator's message size limit";
const PULL_TOO_LARGE_HINT: &str = "pulled messages exceed the per-call size limit; \
     pull replies for fewer message ids per call, or raise the coordinator's message size limit";

/// Connection of a coordinator-side application to the coordinator.
pub struct GridChannel<T: AppIoApi> {
    api: Arc<T>,
    invoker: RetryInvoker,
    config: ClientConfig,
    node_id: NodeId,
    run: Option<Run>,
    closed: bool,
}

impl<T: AppIoApi> GridChannel<T> {
    pub fn new(api: Arc<T>, config: ClientConfig) -> Self {
        let invoker = config.retry_invoker();
        Self::with_invoker(api, config, invoker)
    }

    pub fn with_invoker(api: Arc<T>, config: ClientConfig, invoker: RetryInvoker) -> Self {
        Self {
            api,
            invoker,
            config,
            node_id: SUPERLINK_NODE_ID,
            run: None,
            closed: false,
        }
    }

    /// Node id stamped as the source of every pushed message.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn run(&self) -> Option<&Run> {
        self.run.as_ref()
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.closed {
            return Err(ClientError::ChannelClosed);
        }
        Ok(())
    }

    fn current_run_id(&self) -> Result<RunId, ClientError> {
        self.ensure_open()?;
        self.run
            .as_ref()
            .map(|run| run.run_id)
            .ok_or(ClientError::RunNotSet)
    }

    /// Fetches `run_id` from the coordinator and makes it the current run.
    pub async fn set_run(&mut self, run_id: RunId) -> Result<&Run, ClientError> {
        self.ensure_open()?;
        let api = &self.api;
        let node_id = self.node_id;
        let response = self
            .invoker
            .invoke(|| api.get_run(GetRunRequest { node_id, run_id }))
            .await?;
        let run = response.run.ok_or(ClientError::RunNotFound(run_id))?;
        tracing::info!(?run_id, fab_id = %run.fab_id, "run selected");
        Ok(&*self.run.insert(run))
    }

    /// Ids of the nodes currently taking part in the run.
    pub async fn get_node_ids(&self) -> Result<Vec<NodeId>, ClientError> {
        let run_id = self.current_run_id()?;
        let api = &self.api;
        let response = self
            .invoker
            .invoke(|| api.get_nodes(GetNodesRequest { run_id }))
            .await?;
        Ok(response.nodes)
    }

    /// Pushes `messages` and returns their ids in input order.
    ///
    /// Every message is stamped with the current run and this channel's node
    /// id, and validated before anything is sent. A slot is `None` when the
    /// coordinator did not accept that message or its objects failed to
    /// upload. A batch over the transport size limit yields an empty list.
    pub async fn push_messages(
        &self,
        messages: Vec<Message>,
    ) -> Result<Vec<Option<ObjectId>>, ClientError> {
        let run_id = self.current_run_id()?;

        let mut sealed = Vec::with_capacity(messages.len());
        for message in messages {
            let message = message.with_route(run_id, self.node_id);
            let snapshot = ObjectSnapshot::capture_with_chunk_size(&message, self.config.max_chunk_size)?;
            let message = message.with_message_id(snapshot.root_id());
            message.metadata().validate_outbound()?;
            sealed.push((message, snapshot));
        }

        match self.push_sealed(run_id, &sealed).await {
            Err(ClientError::PayloadTooLarge(err)) => {
                tracing::error!(error = %err, "{PUSH_TOO_LARGE_HINT}");
                Ok(Vec::new())
            }
            other => other,
        }
    }

    async fn push_sealed(
        &self,
        run_id: RunId,
        sealed: &[(Message, ObjectSnapshot)],
    ) -> Result<Vec<Option<ObjectId>>, ClientError> {
        let mut ids = Vec::with_capacity(sealed.len());
        for (message, snapshot) in sealed {
            let message_id = snapshot.root_id();
            match self.push_one(run_id, message, snapshot).await {
                Ok(true) => ids.push(Some(message_id)),
                Ok(false) => ids.push(None),
                Err(err @ (ClientError::ObjectTransfer { .. } | ClientError::ObjectNotRegistered(_))) => {
                    tracing::warn!(%message_id, error = %err, "message objects failed to upload");
                    ids.push(None);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(ids)
    }

    async fn push_one(
        &self,
        run_id: RunId,
        message: &Message,
        snapshot: &ObjectSnapshot,
    ) -> Result<bool, ClientError> {
        let message_id = snapshot.root_id();
        let request = PushAppMessagesRequest {
            run_id,
            messages: vec![message.envelope()],
            object_trees: vec![snapshot.tree().clone()],
        };
        let api = &self.api;
        let response = self
            .invoker
            .invoke(|| api.push_app_messages(request.clone()))
            .await?;

        let Some(to_push) = response.objects_to_push.get(&message_id) else {
            tracing::warn!(%message_id, "coordinator did not accept the message");
            return Ok(false);
        };
        let store = ObjectStoreClient::new(&**api, self.node_id, run_id);
        let pushed = store
            .push(snapshot, to_push, &self.config.push_policy())
            .await?;
        tracing::debug!(%message_id, pushed, dst_node_id = ?message.metadata().dst_node_id, "message pushed");
        Ok(true)
    }

    /// Pulls every available reply to the given message ids.
    ///
    /// Replies are confirmed as received, so each is returned once. Unknown
    /// ids and ids without a reply yet contribute nothing.
    pub async fn pull_messages(&self, message_ids: &[ObjectId]) -> Result<Vec<Message>, ClientError> {
        let run_id = self.current_run_id()?;
        match self.pull_replies(run_id, message_ids).await {
            Err(ClientError::PayloadTooLarge(err)) => {
                tracing::error!(error = %err, "{PULL_TOO_LARGE_HINT}");
                Ok(Vec::new())
            }
            other => other,
        }
    }

    async fn pull_replies(
        &self,
        run_id: RunId,
        message_ids: &[ObjectId],
    ) -> Result<Vec<Message>, ClientError> {
        let api = &self.api;
        let request = PullAppMessagesRequest {
            run_id,
            message_ids: message_ids.to_vec(),
        };
        let response = self
            .invoker
            .invoke(|| api.pull_app_messages(request.clone()))
            .await?;

        // No reply is confirmed before every reply has been pulled and rebuilt.
        let mut replies = Vec::with_capacity(response.messages.len());
        for (envelope, tree) in response.messages.into_iter().zip(response.object_trees) {
            let message_id = tree.object_id;
            replies.push((message_id, self.fetch_reply(run_id, envelope, tree).await?));
        }
        for (message_id, _) in &replies {
            self.confirm_reply(run_id, *message_id).await?;
        }
        Ok(replies.into_iter().map(|(_, reply)| reply).collect())
    }

    async fn fetch_reply(
        &self,
        run_id: RunId,
        envelope: MessageEnvelope,
        tree: ObjectTree,
    ) -> Result<Message, ClientError> {
        let message_id = tree.object_id;
        let store = ObjectStoreClient::new(&*self.api, self.node_id, run_id);
        let contents = store
            .pull(&tree.unique_ids(), &self.config.pull_policy())
            .await?;
        tracing::debug!(
            %message_id,
            src_node_id = ?envelope.metadata.src_node_id,
            "reply pulled"
        );
        Ok(inflate_message(message_id, &contents)?.finalize(message_id))
    }

    async fn confirm_reply(&self, run_id: RunId, message_id: ObjectId) -> Result<(), ClientError> {
        let api = &self.api;
        let node_id = self.node_id;
        self.invoker
            .invoke(|| {
                api.confirm_message_received(ConfirmMessageReceivedRequest {
                    node_id,
                    run_id,
                    message_object_id: message_id,
                })
            })
            .await
    }

    /// Pushes `messages`, then polls until every accepted message has a reply.
    ///
    /// With a `timeout`, polling stops once it elapses and the replies
    /// collected so far are returned; the last poll may end up to one poll
    /// interval after the deadline.
    pub async fn send_and_receive(
        &self,
        messages: Vec<Message>,
        timeout: Option<Duration>,
    ) -> Result<Vec<Message>, ClientError> {
        let mut outstanding: HashSet<ObjectId> = self
            .push_messages(messages)
            .await?
            .into_iter()
            .flatten()
            .collect();
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut replies = Vec::new();

        while !outstanding.is_empty() {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                tracing::warn!(missing = outstanding.len(), "timed out waiting for replies");
                break;
            }
            let ids: Vec<ObjectId> = outstanding.iter().copied().collect();
            let batch = self.pull_messages(&ids).await?;
            for reply in &batch {
                if let Some(reply_to) = reply.metadata().reply_to_message_id {
                    outstanding.remove(&reply_to);
                }
            }
            replies.extend(batch);
            if outstanding.is_empty() {
                break;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
        Ok(replies)
    }

    /// Releases the connection. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.api.close().await;
        tracing::debug!("grid channel closed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use fedlink_codec::{Message, RecordDict};
    use fedlink_core::{NodeId, Run, RunId};
    use fedlink_transport::memory::{Call, InMemoryCoordinator};

    use super::GridChannel;
    use crate::config::ClientConfig;
    use crate::error::ClientError;

    fn grid(coordinator: &Arc<InMemoryCoordinator>) -> GridChannel<InMemoryCoordinator> {
        GridChannel::new(Arc::clone(coordinator), ClientConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn operations_require_a_run() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let grid = grid(&coordinator);
        let message = Message::new(RecordDict::new(), NodeId(5), "train");

        assert!(matches!(
            grid.push_messages(vec![message]).await,
            Err(ClientError::RunNotSet)
        ));
        assert!(matches!(grid.get_node_ids().await, Err(ClientError::RunNotSet)));
        assert_eq!(coordinator.call_count(Call::PushMessages), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn set_run_fetches_run_or_reports_missing() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        coordinator.add_run(Run::with_id(RunId(7)));
        let mut grid = grid(&coordinator);

        assert_eq!(grid.set_run(RunId(7)).await.expect("set run").run_id, RunId(7));
        assert_eq!(grid.run().map(|r| r.run_id), Some(RunId(7)));
        assert!(matches!(
            grid.set_run(RunId(8)).await,
            Err(ClientError::RunNotFound(RunId(8)))
        ));
        assert_eq!(grid.run().map(|r| r.run_id), Some(RunId(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn get_node_ids_lists_registered_nodes() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        coordinator.add_run(Run::with_id(RunId(1)));
        coordinator.register_node(NodeId(12));
        coordinator.register_node(NodeId(11));
        let mut grid = grid(&coordinator);
        grid.set_run(RunId(1)).await.expect("set run");

        assert_eq!(
            grid.get_node_ids().await.expect("node ids"),
            vec![NodeId(11), NodeId(12)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent_and_blocks_further_calls() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        coordinator.add_run(Run::with_id(RunId(1)));
        let mut grid = grid(&coordinator);
        grid.set_run(RunId(1)).await.expect("set run");

        grid.close().await;
        grid.close().await;
        assert!(coordinator.is_closed());
        assert!(matches!(grid.get_node_ids().await, Err(ClientError::ChannelClosed)));
    }
}
