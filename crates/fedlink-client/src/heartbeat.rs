//! Background liveness signal for a registered node.
//!
//! After a successful beat the next one is scheduled at
//! `interval * base_multiplier * (1 + U(random_range))`, capped by
//! `max_interval`. A missed beat (transient error or call timeout) is retried
//! with exponential backoff starting at `retry_initial` and capped by the
//! interval. Any other failure stops the loop; the error is kept on the task
//! handle and surfaced by [`HeartbeatSender::check`].

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use fedlink_core::constants::{
    HEARTBEAT_BASE_MULTIPLIER, HEARTBEAT_CALL_TIMEOUT, HEARTBEAT_DEFAULT_INTERVAL,
    HEARTBEAT_MAX_INTERVAL, HEARTBEAT_RANDOM_RANGE,
};
use fedlink_core::NodeId;
use fedlink_transport::messages::SendNodeHeartbeatRequest;
use fedlink_transport::FleetApi;
use rand::Rng;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::ClientError;
use crate::retry::doubled_backoff;

#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    /// Deadline for a single heartbeat call.
    pub call_timeout: Duration,
    pub max_interval: Duration,
    pub base_multiplier: f64,
    pub random_range: (f64, f64),
    /// First delay after a missed beat.
    pub retry_initial: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: HEARTBEAT_DEFAULT_INTERVAL,
            call_timeout: HEARTBEAT_CALL_TIMEOUT,
            max_interval: HEARTBEAT_MAX_INTERVAL,
            base_multiplier: HEARTBEAT_BASE_MULTIPLIER,
            random_range: HEARTBEAT_RANDOM_RANGE,
            retry_initial: Duration::from_secs(1),
        }
    }
}

impl HeartbeatConfig {
    /// Delay before the next beat after a successful one.
    pub fn next_interval(&self) -> Duration {
        let (low, high) = self.random_range;
        let spread = if low < high {
            rand::thread_rng().gen_range(low..high)
        } else {
            low
        };
        let factor = (self.base_multiplier * (1.0 + spread)).max(0.0);
        let secs = self.interval.as_secs_f64() * factor;
        Duration::try_from_secs_f64(secs)
            .unwrap_or(Duration::MAX)
            .min(self.max_interval)
    }
}

/// Outcome of one heartbeat attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    Delivered,
    /// Transient failure; the loop backs off and tries again.
    Missed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatMetrics {
    pub delivered: u64,
    pub missed: u64,
}

#[derive(Debug, Default)]
struct HeartbeatMetricsInner {
    delivered: AtomicU64,
    missed: AtomicU64,
    last_delivered: Mutex<Option<Instant>>,
}

/// Owns the heartbeat task of one node session.
#[derive(Debug)]
pub struct HeartbeatSender {
    config: HeartbeatConfig,
    metrics: Arc<HeartbeatMetricsInner>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<Result<(), ClientError>>>,
}

impl HeartbeatSender {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            metrics: Arc::new(HeartbeatMetricsInner::default()),
            shutdown_tx: None,
            worker: None,
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Spawns the heartbeat loop on the current runtime.
    ///
    /// Starting an already running sender is a no-op.
    pub fn start<F, Fut>(&mut self, beat: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Beat, ClientError>> + Send + 'static,
    {
        if self.worker.is_some() {
            tracing::warn!("heartbeat already running");
            return;
        }
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let worker = tokio::spawn(run_heartbeat_worker(
            self.config.clone(),
            Arc::clone(&self.metrics),
            beat,
            shutdown_rx,
        ));
        self.shutdown_tx = Some(shutdown_tx);
        self.worker = Some(worker);
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|worker| !worker.is_finished())
    }

    /// Reports a heartbeat loop that ended on its own.
    ///
    /// Returns the fatal error once; a running or stopped sender yields `Ok`.
    pub async fn check(&mut self) -> Result<(), ClientError> {
        if !self.worker.as_ref().is_some_and(JoinHandle::is_finished) {
            return Ok(());
        }
        self.shutdown_tx = None;
        match self.worker.take() {
            Some(worker) => join_worker(worker).await,
            None => Ok(()),
        }
    }

    /// Stops the loop and waits for it to exit. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            if let Err(err) = join_worker(worker).await {
                tracing::debug!(error = %err, "heartbeat had already stopped");
            }
        }
    }

    /// Cancels the loop without waiting for it.
    pub fn abort(&mut self) {
        self.shutdown_tx = None;
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }

    pub fn metrics_snapshot(&self) -> HeartbeatMetrics {
        HeartbeatMetrics {
            delivered: self.metrics.delivered.load(Ordering::Relaxed),
            missed: self.metrics.missed.load(Ordering::Relaxed),
        }
    }

    /// When the coordinator last acknowledged a beat.
    pub fn last_delivered(&self) -> Option<Instant> {
        *self
            .metrics
            .last_delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for HeartbeatSender {
    fn drop(&mut self) {
        self.abort();
    }
}

async fn join_worker(worker: JoinHandle<Result<(), ClientError>>) -> Result<(), ClientError> {
    match worker.await {
        Ok(result) => result,
        Err(err) if err.is_cancelled() => Ok(()),
        Err(err) => Err(ClientError::HeartbeatTask(err.to_string())),
    }
}

async fn run_heartbeat_worker<F, Fut>(
    config: HeartbeatConfig,
    metrics: Arc<HeartbeatMetricsInner>,
    mut beat: F,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> Result<(), ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Beat, ClientError>>,
{
    let mut backoff = config.retry_initial;

    loop {
        let outcome = tokio::select! {
            biased;
            _ = &mut shutdown_rx => return Ok(()),
            outcome = beat() => outcome,
        };

        let delay = match outcome {
            Ok(Beat::Delivered) => {
                metrics.delivered.fetch_add(1, Ordering::Relaxed);
                *metrics
                    .last_delivered
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
                backoff = config.retry_initial;
                config.next_interval()
            }
            Ok(Beat::Missed) => {
                metrics.missed.fetch_add(1, Ordering::Relaxed);
                let delay = backoff;
                backoff = doubled_backoff(backoff, config.interval);
                tracing::warn!(?delay, "heartbeat missed, retrying");
                delay
            }
            Err(err) => {
                tracing::error!(error = %err, "heartbeat failed, stopping");
                return Err(err);
            }
        };

        tokio::select! {
            biased;
            _ = &mut shutdown_rx => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Sends one heartbeat for `node_id`, bounded by `call_timeout`.
///
/// Transient errors and timeouts count as a missed beat. A `success = false`
/// response means the coordinator no longer knows the node.
pub async fn send_node_heartbeat<A>(
    api: &A,
    node_id: NodeId,
    heartbeat_interval: Duration,
    call_timeout: Duration,
) -> Result<Beat, ClientError>
where
    A: FleetApi + ?Sized,
{
    let request = SendNodeHeartbeatRequest {
        node_id,
        heartbeat_interval,
    };
    let response = match tokio::time::timeout(call_timeout, api.send_node_heartbeat(request)).await {
        Err(_) => {
            tracing::debug!(?node_id, ?call_timeout, "heartbeat call timed out");
            return Ok(Beat::Missed);
        }
        Ok(Err(err)) if err.is_transient() => {
            tracing::debug!(?node_id, error = %err, "heartbeat call failed");
            return Ok(Beat::Missed);
        }
        Ok(Err(err)) => return Err(err.into()),
        Ok(Ok(response)) => response,
    };
    if !response.success {
        return Err(ClientError::UnrecognizedSession);
    }
    Ok(Beat::Delivered)
}
