//! Consumer configuration structures

use crate::consumer::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Stream the consumer drains
pub const DEFAULT_STREAM: &str = "message_stream";
/// Consumer group shared by all workers
pub const DEFAULT_GROUP: &str = "processors";
/// Prefix of generated consumer names
pub const DEFAULT_CONSUMER_PREFIX: &str = "consumer";
/// Host used when `REDIS_HOST` is unset
pub const DEFAULT_HOST: &str = "redis";
/// Port used when `REDIS_PORT` is unset
pub const DEFAULT_PORT: u16 = 6379;
/// Fields every entry is expected to carry
pub const DEFAULT_REQUIRED_FIELDS: [&str; 4] = ["id", "content", "timestamp", "sender"];

/// TCP connect timeout for every attempt
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Per-command response timeout
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// What the loop does with an entry that fails the presence check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedPolicy {
    /// Retire it; redelivery cannot repair it
    #[default]
    Acknowledge,
    /// Leave it in the pending list for inspection
    LeavePending,
}

/// Redis Streams consumer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Redis host
    pub host: String,

    /// Redis port
    pub port: u16,

    /// Stream to consume from
    pub stream: String,

    /// Consumer group name
    pub group: String,

    /// Prefix for the generated consumer name
    pub consumer_prefix: String,

    /// Id the group cursor starts from when it is created (`0` = earliest, `$` = latest)
    pub group_start_id: String,

    /// Maximum entries per fetch
    pub batch_size: usize,

    /// How long an idle fetch blocks before returning empty
    pub block_timeout: Duration,

    /// Fixed pause after a failed fetch
    pub error_pause: Duration,

    /// Connection timeout for each connect attempt
    pub connect_timeout: Duration,

    /// Response timeout for every command
    pub response_timeout: Duration,

    /// Simulated work done by the logging handler
    pub processing_delay: Duration,

    /// Startup connection retry policy
    pub retry_policy: RetryPolicy,

    /// Fields an entry must carry
    pub required_fields: Vec<String>,

    /// Handling of entries missing required fields
    pub malformed_policy: MalformedPolicy,

    /// Interval between metrics log lines
    pub metrics_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            stream: DEFAULT_STREAM.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer_prefix: DEFAULT_CONSUMER_PREFIX.to_string(),
            group_start_id: "0".to_string(),
            batch_size: 1,
            block_timeout: Duration::from_secs(1),
            error_pause: Duration::from_secs(1),
            connect_timeout: CONNECT_TIMEOUT,
            response_timeout: RESPONSE_TIMEOUT,
            processing_delay: Duration::from_millis(500),
            retry_policy: RetryPolicy::default(),
            required_fields: DEFAULT_REQUIRED_FIELDS
                .iter()
                .map(|f| f.to_string())
                .collect(),
            malformed_policy: MalformedPolicy::default(),
            metrics_interval: Duration::from_secs(60),
        }
    }
}

/// Builder for ConsumerConfig
pub struct ConsumerConfigBuilder {
    config: ConsumerConfig,
}

impl ConsumerConfigBuilder {
    /// Create a new consumer config builder
    pub fn new() -> Self {
        Self {
            config: ConsumerConfig::default(),
        }
    }

    /// Set the Redis host
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Set the Redis port
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the stream name
    pub fn stream(mut self, stream: impl Into<String>) -> Self {
        self.config.stream = stream.into();
        self
    }

    /// Set the consumer group name
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.config.group = group.into();
        self
    }

    /// Set the prefix of generated consumer names
    pub fn consumer_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.consumer_prefix = prefix.into();
        self
    }

    /// Set the id a newly created group starts reading after
    pub fn group_start_id(mut self, id: impl Into<String>) -> Self {
        self.config.group_start_id = id.into();
        self
    }

    /// Set the maximum entries per fetch
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the fetch block timeout
    pub fn block_timeout(mut self, timeout: Duration) -> Self {
        self.config.block_timeout = timeout;
        self
    }

    /// Set the pause after a failed fetch
    pub fn error_pause(mut self, pause: Duration) -> Self {
        self.config.error_pause = pause;
        self
    }

    /// Set the per-command response timeout
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    /// Set the simulated processing delay
    pub fn processing_delay(mut self, delay: Duration) -> Self {
        self.config.processing_delay = delay;
        self
    }

    /// Set the retry policy
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = policy;
        self
    }

    /// Replace the required field list
    pub fn required_fields(mut self, fields: Vec<String>) -> Self {
        self.config.required_fields = fields;
        self
    }

    /// Set what happens to entries missing required fields
    pub fn malformed_policy(mut self, policy: MalformedPolicy) -> Self {
        self.config.malformed_policy = policy;
        self
    }

    /// Set the metrics reporting interval
    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.config.metrics_interval = interval;
        self
    }

    /// Build the consumer configuration
    pub fn build(self) -> ConsumerConfig {
        self.config
    }
}

impl Default for ConsumerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerConfig {
    /// Create a new consumer config builder
    pub fn builder() -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::new()
    }

    /// Defaults overlaid with `REDIS_HOST` and `REDIS_PORT`.
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup("REDIS_HOST") {
            config.host = host;
        }

        if let Some(port) = lookup("REDIS_PORT") {
            config.port = port
                .trim()
                .parse()
                .map_err(|e| format!("Invalid REDIS_PORT {:?}: {}", port, e))?;
        }

        Ok(config)
    }

    /// Connection URL for the Redis client
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("Host cannot be empty".to_string());
        }

        if self.stream.is_empty() {
            return Err("Stream cannot be empty".to_string());
        }

        if self.group.is_empty() {
            return Err("Group cannot be empty".to_string());
        }

        if self.group_start_id.is_empty() {
            return Err("Group start id cannot be empty".to_string());
        }

        if self.batch_size == 0 {
            return Err("Batch size must be greater than 0".to_string());
        }

        if self.block_timeout.is_zero() {
            // BLOCK 0 means wait forever and would hide shutdown requests
            return Err("Block timeout must be greater than 0".to_string());
        }

        if self.response_timeout <= self.block_timeout {
            return Err("Response timeout must exceed the block timeout".to_string());
        }

        if self.retry_policy.max_attempts == 0 {
            return Err("Retry policy needs at least one attempt".to_string());
        }

        if self.retry_policy.initial_backoff > self.retry_policy.max_backoff {
            return Err("Initial backoff cannot exceed max backoff".to_string());
        }

        if self.metrics_interval.is_zero() {
            return Err("Metrics interval must be greater than 0".to_string());
        }

        Ok(())
    }
}
