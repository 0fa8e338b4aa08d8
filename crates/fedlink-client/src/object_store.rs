//! Concurrent transfer of content-addressed objects to and from the coordinator.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use fedlink_codec::error::CodecError;
use fedlink_codec::ObjectSnapshot;
use fedlink_core::constants::{
    MAX_CONCURRENT_PULLS, PULL_BACKOFF_CAP, PULL_INITIAL_BACKOFF, PULL_MAX_TIME,
    PULL_MAX_TRIES_PER_OBJECT,
};
use fedlink_core::{NodeId, ObjectId, RunId};
use fedlink_transport::messages::{PullObjectRequest, PushObjectRequest};
use fedlink_transport::LinkApi;
use futures_util::stream::{self, StreamExt};

use crate::error::ClientError;
use crate::retry::doubled_backoff;

/// Concurrency and per-object retry bounds of one push or pull.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferPolicy {
    pub max_concurrent: usize,
    pub initial_backoff: Duration,
    pub backoff_cap: Duration,
    pub max_tries_per_object: u32,
    /// Wall-clock ceiling for the whole transfer.
    pub max_time: Option<Duration>,
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self {
            max_concurrent: MAX_CONCURRENT_PULLS,
            initial_backoff: PULL_INITIAL_BACKOFF,
            backoff_cap: PULL_BACKOFF_CAP,
            max_tries_per_object: PULL_MAX_TRIES_PER_OBJECT,
            max_time: Some(PULL_MAX_TIME),
        }
    }
}

enum Attempt<T> {
    Done(T),
    Retry(String),
}

/// Pushes and pulls object bytes on behalf of one node and run.
#[derive(Debug)]
pub struct ObjectStoreClient<'a, A: ?Sized> {
    api: &'a A,
    node_id: NodeId,
    run_id: RunId,
}

impl<'a, A> ObjectStoreClient<'a, A>
where
    A: LinkApi + ?Sized,
{
    pub fn new(api: &'a A, node_id: NodeId, run_id: RunId) -> Self {
        Self {
            api,
            node_id,
            run_id,
        }
    }

    /// Uploads the objects in `object_ids`, taking their bytes from `snapshot`.
    ///
    /// Returns the number of objects transferred. Every id must be part of
    /// the snapshot.
    pub async fn push(
        &self,
        snapshot: &ObjectSnapshot,
        object_ids: &[ObjectId],
        policy: &TransferPolicy,
    ) -> Result<usize, ClientError> {
        let mut jobs = Vec::with_capacity(object_ids.len());
        for object_id in object_ids {
            let bytes = snapshot
                .get(object_id)
                .ok_or(CodecError::MissingObject(*object_id))?;
            jobs.push((*object_id, bytes.clone()));
        }
        if jobs.is_empty() {
            return Ok(0);
        }

        let total = jobs.len();
        let results: Vec<Result<(), ClientError>> = stream::iter(jobs)
            .map(|(object_id, bytes)| self.push_one(object_id, bytes, policy))
            .buffer_unordered(policy.max_concurrent.max(1))
            .collect()
            .await;
        aggregate(results)?;

        tracing::debug!(objects = total, run_id = ?self.run_id, "objects pushed");
        Ok(total)
    }

    /// Downloads the bytes of every id in `object_ids`.
    ///
    /// Objects not uploaded yet are polled until available. An id the
    /// coordinator has never seen fails immediately.
    pub async fn pull(
        &self,
        object_ids: &[ObjectId],
        policy: &TransferPolicy,
    ) -> Result<HashMap<ObjectId, Bytes>, ClientError> {
        let transfer = async {
            let results: Vec<Result<(ObjectId, Bytes), ClientError>> =
                stream::iter(object_ids.iter().copied())
                    .map(|object_id| self.pull_one(object_id, policy))
                    .buffer_unordered(policy.max_concurrent.max(1))
                    .collect()
                    .await;
            aggregate(results).map(|pulled| pulled.into_iter().collect::<HashMap<_, _>>())
        };

        let contents = match policy.max_time {
            Some(max_time) => tokio::time::timeout(max_time, transfer)
                .await
                .map_err(|_| ClientError::PullTimedOut(max_time))??,
            None => transfer.await?,
        };

        tracing::debug!(objects = contents.len(), run_id = ?self.run_id, "objects pulled");
        Ok(contents)
    }

    async fn push_one(
        &self,
        object_id: ObjectId,
        object_content: Bytes,
        policy: &TransferPolicy,
    ) -> Result<(), ClientError> {
        let request = PushObjectRequest {
            node_id: self.node_id,
            run_id: self.run_id,
            object_id,
            object_content,
        };
        with_transfer_retries(object_id, policy, || async {
            match self.api.push_object(request.clone()).await {
                Ok(response) if response.stored => Ok(Attempt::Done(())),
                Ok(_) => Err(ClientError::ObjectNotRegistered(object_id)),
                Err(err) if err.is_transient() => Ok(Attempt::Retry(err.to_string())),
                Err(err) => Err(err.into()),
            }
        })
        .await
    }

    async fn pull_one(
        &self,
        object_id: ObjectId,
        policy: &TransferPolicy,
    ) -> Result<(ObjectId, Bytes), ClientError> {
        let request = PullObjectRequest {
            node_id: self.node_id,
            run_id: self.run_id,
            object_id,
        };
        with_transfer_retries(object_id, policy, || async {
            match self.api.pull_object(request.clone()).await {
                Ok(response) if !response.object_found => {
                    Err(ClientError::ObjectNotRegistered(object_id))
                }
                Ok(response) if !response.object_available => {
                    Ok(Attempt::Retry("object not available yet".to_string()))
                }
                Ok(response) => Ok(Attempt::Done((object_id, response.object_content))),
                Err(err) if err.is_transient() => Ok(Attempt::Retry(err.to_string())),
                Err(err) => Err(err.into()),
            }
        })
        .await
    }
}

async fn with_transfer_retries<T, F, Fut>(
    object_id: ObjectId,
    policy: &TransferPolicy,
    mut attempt: F,
) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Attempt<T>, ClientError>>,
{
    let max_tries = policy.max_tries_per_object.max(1);
    let mut backoff = policy.initial_backoff;
    let mut tries = 0;
    loop {
        tries += 1;
        let reason = match attempt().await? {
            Attempt::Done(value) => return Ok(value),
            Attempt::Retry(reason) => reason,
        };
        if tries >= max_tries {
            return Err(ClientError::ObjectTransferExhausted {
                object_id,
                attempts: tries,
                last_error: reason,
            });
        }
        tracing::trace!(%object_id, tries, ?backoff, %reason, "object transfer retry");
        tokio::time::sleep(backoff).await;
        backoff = doubled_backoff(backoff, policy.backoff_cap);
    }
}

fn aggregate<T>(results: Vec<Result<T, ClientError>>) -> Result<Vec<T>, ClientError> {
    let mut values = Vec::with_capacity(results.len());
    let mut failures = Vec::new();
    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(err) => failures.push(err),
        }
    }
    if failures.is_empty() {
        return Ok(values);
    }
    tracing::warn!(failed = failures.len(), "object transfer failed");
    Err(ClientError::ObjectTransfer { failures })
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use fedlink_codec::{Message, ObjectSnapshot, RecordDict};
    use fedlink_core::{NodeId, RunId};
    use fedlink_transport::memory::{Call, InMemoryCoordinator};
    use fedlink_transport::messages::{
        ConfirmMessageReceivedRequest, GetRunRequest, GetRunResponse, PullObjectRequest,
        PullObjectResponse, PushObjectRequest, PushObjectResponse,
    };
    use fedlink_transport::{LinkApi, RpcError, StatusCode};

    use super::{ObjectStoreClient, TransferPolicy};
    use crate::error::ClientError;

    fn snapshot() -> ObjectSnapshot {
        let mut content = RecordDict::new();
        content.insert("weights", Bytes::from(vec![5_u8; 300]));
        content.insert("config", Bytes::from_static(b"lr=0.1"));
        let message = Message::new(content, NodeId(2), "train").with_route(RunId(1), NodeId(1));
        ObjectSnapshot::capture_with_chunk_size(&message, 64).expect("capture should work")
    }

    fn policy() -> TransferPolicy {
        TransferPolicy {
            max_concurrent: 4,
            initial_backoff: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(1),
            max_tries_per_object: 3,
            max_time: Some(Duration::from_secs(60)),
        }
    }

    /// Object calls take 10ms each; records how many overlap.
    #[derive(Default)]
    struct SlowStore {
        inner: InMemoryCoordinator,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl SlowStore {
        async fn track<T>(&self, call: impl Future<Output = T>) -> T {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            let out = call.await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            out
        }
    }

    #[async_trait]
    impl LinkApi for SlowStore {
        async fn push_object(&self, request: PushObjectRequest) -> Result<PushObjectResponse, RpcError> {
            self.track(self.inner.push_object(request)).await
        }

        async fn pull_object(&self, request: PullObjectRequest) -> Result<PullObjectResponse, RpcError> {
            self.track(self.inner.pull_object(request)).await
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

    fn many_chunks() -> ObjectSnapshot {
        let mut content = RecordDict::new();
        let weights: Vec<u8> = (0..2048_u32).map(|i| (i % 251) as u8).collect();
        content.insert("weights", Bytes::from(weights));
        let message = Message::new(content, NodeId(2), "train").with_route(RunId(1), NodeId(1));
        ObjectSnapshot::capture_with_chunk_size(&message, 64).expect("capture should work")
    }

    fn announce(coordinator: &InMemoryCoordinator, snapshot: &ObjectSnapshot) {
        coordinator.inject_message(
            NodeId(2),
            fedlink_codec::MessageEnvelope {
                metadata: Message::new(RecordDict::new(), NodeId(2), "train")
                    .metadata()
                    .clone(),
            },
            snapshot.tree().clone(),
        );
    }

    #[tokio::test(start_paused = true)]
    async fn push_transfers_each_requested_object_once() {
        let coordinator = InMemoryCoordinator::new();
        let snapshot = snapshot();
        announce(&coordinator, &snapshot);
        let ids = snapshot.tree().unique_ids();

        let store = ObjectStoreClient::new(&coordinator, NodeId(1), RunId(1));
        let pushed = store.push(&snapshot, &ids, &policy()).await.expect("push");

        assert_eq!(pushed, snapshot.len());
        assert_eq!(coordinator.call_count(Call::PushObject), snapshot.len() as u64);
        assert!(ids.iter().all(|id| coordinator.has_object(*id)));
    }

    #[tokio::test(start_paused = true)]
    async fn transfers_never_exceed_their_concurrency_limit() {
        let api = SlowStore::default();
        let snapshot = many_chunks();
        assert!(snapshot.len() >= 20);
        announce(&api.inner, &snapshot);
        let ids = snapshot.tree().unique_ids();
        let store = ObjectStoreClient::new(&api, NodeId(1), RunId(1));

        let push_policy = TransferPolicy {
            max_concurrent: 4,
            ..policy()
        };
        store.push(&snapshot, &ids, &push_policy).await.expect("push");
        assert_eq!(api.peak.load(Ordering::SeqCst), 4);

        api.peak.store(0, Ordering::SeqCst);
        let pull_policy = TransferPolicy {
            max_concurrent: 6,
            ..policy()
        };
        let pulled = store.pull(&ids, &pull_policy).await.expect("pull");
        assert_eq!(pulled.len(), snapshot.len());
        assert_eq!(api.peak.load(Ordering::SeqCst), 6);
        assert_eq!(api.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn push_of_nothing_makes_no_calls() {
        let coordinator = InMemoryCoordinator::new();
        let store = ObjectStoreClient::new(&coordinator, NodeId(1), RunId(1));
        assert_eq!(store.push(&snapshot(), &[], &policy()).await.expect("push"), 0);
        assert_eq!(coordinator.call_count(Call::PushObject), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn push_retries_transient_failures() {
        let coordinator = InMemoryCoordinator::new();
        let snapshot = snapshot();
        announce(&coordinator, &snapshot);
        coordinator.fail_next(Call::PushObject, StatusCode::Unavailable, 2);

        let store = ObjectStoreClient::new(&coordinator, NodeId(1), RunId(1));
        let ids = snapshot.tree().unique_ids();
        store.push(&snapshot, &ids, &policy()).await.expect("push");
        assert_eq!(
            coordinator.call_count(Call::PushObject),
            snapshot.len() as u64 + 2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn push_of_unannounced_object_fails() {
        let coordinator = InMemoryCoordinator::new();
        let snapshot = snapshot();
        let store = ObjectStoreClient::new(&coordinator, NodeId(1), RunId(1));

        let err = store
            .push(&snapshot, &[snapshot.root_id()], &policy())
            .await
            .expect_err("push should fail");
        assert!(matches!(
            err.transfer_failures(),
            [ClientError::ObjectNotRegistered(id)] if *id == snapshot.root_id()
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn pull_returns_pushed_bytes() {
        let coordinator = InMemoryCoordinator::new();
        let snapshot = snapshot();
        announce(&coordinator, &snapshot);
        let ids = snapshot.tree().unique_ids();
        let store = ObjectStoreClient::new(&coordinator, NodeId(1), RunId(1));
        store.push(&snapshot, &ids, &policy()).await.expect("push");

        let pulled = store.pull(&ids, &policy()).await.expect("pull");
        assert_eq!(&pulled, snapshot.objects());
    }

    #[tokio::test(start_paused = true)]
    async fn pull_gives_up_after_max_tries_per_object() {
        let coordinator = InMemoryCoordinator::new();
        let snapshot = snapshot();
        announce(&coordinator, &snapshot);
        let store = ObjectStoreClient::new(&coordinator, NodeId(1), RunId(1));

        let err = store
            .pull(&[snapshot.root_id()], &policy())
            .await
            .expect_err("pull should fail");
        assert!(matches!(
            err.transfer_failures(),
            [ClientError::ObjectTransferExhausted { attempts: 3, .. }]
        ));
        assert_eq!(coordinator.call_count(Call::PullObject), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn pull_of_unknown_object_fails_without_retry() {
        let coordinator = InMemoryCoordinator::new();
        let snapshot = snapshot();
        let store = ObjectStoreClient::new(&coordinator, NodeId(1), RunId(1));

        let err = store
            .pull(&[snapshot.root_id()], &policy())
            .await
            .expect_err("pull should fail");
        assert!(matches!(
            err.transfer_failures(),
            [ClientError::ObjectNotRegistered(_)]
        ));
        assert_eq!(coordinator.call_count(Call::PullObject), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pull_is_bounded_by_max_time() {
        let coordinator = InMemoryCoordinator::new();
        let snapshot = snapshot();
        announce(&coordinator, &snapshot);
        let store = ObjectStoreClient::new(&coordinator, NodeId(1), RunId(1));
        let patient = TransferPolicy {
            max_tries_per_object: 500,
            max_time: Some(Duration::from_secs(5)),
            ..policy()
        };

        let err = store
            .pull(&[snapshot.root_id()], &patient)
            .await
            .expect_err("pull should time out");
        assert!(matches!(err, ClientError::PullTimedOut(d) if d == Duration::from_secs(5)));
    }
}
