use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use fedlink_core::constants::{
    HEARTBEAT_BASE_MULTIPLIER, HEARTBEAT_CALL_TIMEOUT, HEARTBEAT_DEFAULT_INTERVAL,
    HEARTBEAT_MAX_INTERVAL, HEARTBEAT_RANDOM_RANGE, MAX_ARRAY_CHUNK_SIZE, MAX_CONCURRENT_PULLS,
    MAX_CONCURRENT_PUSHES, MAX_RETRY_DELAY, PULL_BACKOFF_CAP, PULL_INITIAL_BACKOFF, PULL_MAX_TIME,
    PULL_MAX_TRIES_PER_OBJECT, SEND_AND_RECEIVE_POLL_INTERVAL,
};
use serde::Deserialize;

use crate::heartbeat::HeartbeatConfig;
use crate::object_store::TransferPolicy;
use crate::retry::{RetryPolicy, RetryInvoker};

/// Tunables shared by the node and grid channels.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ClientConfig {
    /// Interval announced to the coordinator at registration and on each beat.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_call_timeout: Duration,
    /// Ceiling for the delay between two beats; unbounded when unset.
    #[serde(default, with = "humantime_serde")]
    pub heartbeat_max_interval: Option<Duration>,
    pub heartbeat_base_multiplier: f64,
    /// Half-width of the symmetric random range applied to the next beat.
    pub heartbeat_jitter: f64,
    #[serde(with = "humantime_serde")]
    pub retry_initial_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub retry_max_delay: Duration,
    #[serde(default)]
    pub retry_max_tries: Option<u32>,
    #[serde(default, with = "humantime_serde")]
    pub retry_max_time: Option<Duration>,
    pub max_concurrent_pushes: usize,
    pub max_concurrent_pulls: usize,
    #[serde(with = "humantime_serde")]
    pub pull_max_time: Duration,
    pub max_tries_per_object: u32,
    #[serde(with = "humantime_serde")]
    pub transfer_initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub transfer_backoff_cap: Duration,
    /// Delay between reply polls in send-and-receive.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Record payloads above this size are split into several chunk objects.
    pub max_chunk_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_DEFAULT_INTERVAL,
            heartbeat_call_timeout: HEARTBEAT_CALL_TIMEOUT,
            heartbeat_max_interval: None,
            heartbeat_base_multiplier: HEARTBEAT_BASE_MULTIPLIER,
            heartbeat_jitter: HEARTBEAT_RANDOM_RANGE.1,
            retry_initial_delay: Duration::from_secs(1),
            retry_max_delay: MAX_RETRY_DELAY,
            retry_max_tries: None,
            retry_max_time: None,
            max_concurrent_pushes: MAX_CONCURRENT_PUSHES,
            max_concurrent_pulls: MAX_CONCURRENT_PULLS,
            pull_max_time: PULL_MAX_TIME,
            max_tries_per_object: PULL_MAX_TRIES_PER_OBJECT,
            transfer_initial_backoff: PULL_INITIAL_BACKOFF,
            transfer_backoff_cap: PULL_BACKOFF_CAP,
            poll_interval: SEND_AND_RECEIVE_POLL_INTERVAL,
            max_chunk_size: MAX_ARRAY_CHUNK_SIZE,
        }
    }
}

impl ClientConfig {
    /// Layers defaults, an optional config file and `FEDLINK_*` environment
    /// variables, in that order of precedence.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("heartbeat_interval", "30s")?
            .set_default("heartbeat_call_timeout", "5s")?
            .set_default("heartbeat_base_multiplier", HEARTBEAT_BASE_MULTIPLIER)?
            .set_default("heartbeat_jitter", HEARTBEAT_RANDOM_RANGE.1)?
            .set_default("retry_initial_delay", "1s")?
            .set_default("retry_max_delay", "20s")?
            .set_default("max_concurrent_pushes", MAX_CONCURRENT_PUSHES as i64)?
            .set_default("max_concurrent_pulls", MAX_CONCURRENT_PULLS as i64)?
            .set_default("pull_max_time", "2h")?
            .set_default("max_tries_per_object", i64::from(PULL_MAX_TRIES_PER_OBJECT))?
            .set_default("transfer_initial_backoff", "1s")?
            .set_default("transfer_backoff_cap", "10s")?
            .set_default("poll_interval", "3s")?
            .set_default("max_chunk_size", MAX_ARRAY_CHUNK_SIZE as i64)?;

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(Environment::with_prefix("FEDLINK").try_parsing(true));

        builder.build()?.try_deserialize()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: self.retry_initial_delay,
            max_delay: Some(self.retry_max_delay),
            max_tries: self.retry_max_tries,
            max_time: self.retry_max_time,
            ..RetryPolicy::default()
        }
    }

    /// Invoker that retries transient errors under [`Self::retry_policy`].
    pub fn retry_invoker(&self) -> RetryInvoker {
        RetryInvoker::new(self.retry_policy())
    }

    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: self.heartbeat_interval,
            call_timeout: self.heartbeat_call_timeout,
            max_interval: self.heartbeat_max_interval.unwrap_or(HEARTBEAT_MAX_INTERVAL),
            base_multiplier: self.heartbeat_base_multiplier,
            random_range: (-self.heartbeat_jitter, self.heartbeat_jitter),
            retry_initial: Duration::from_secs(1),
        }
    }

    pub fn push_policy(&self) -> TransferPolicy {
        TransferPolicy {
            max_concurrent: self.max_concurrent_pushes,
            initial_backoff: self.transfer_initial_backoff,
            backoff_cap: self.transfer_backoff_cap,
            max_tries_per_object: self.max_tries_per_object,
            max_time: None,
        }
    }

    pub fn pull_policy(&self) -> TransferPolicy {
        TransferPolicy {
            max_concurrent: self.max_concurrent_pulls,
            max_time: Some(self.pull_max_time),
            ..self.push_policy()
        }
    }
}
