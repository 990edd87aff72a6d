// RPC defaults and env overrides.
use std::time::Duration;

use crate::{Result, RpcError};
use waggle_common::env;

pub const DEFAULT_REQUEST_TOPIC: &str = "request_topic";
pub const DEFAULT_REPLY_TOPIC: &str = "response_topic";
pub const DEFAULT_SERVER_GROUP: &str = "rpc-server";
pub const DEFAULT_CONSUMER_TASKS: usize = 2;
pub const DEFAULT_WORKER_TASKS: usize = 4;
pub const DEFAULT_QUEUE_DEPTH: usize = 256;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

/// Topics and pool sizes for one RPC client/server pair.
///
/// ```
/// use waggle_rpc::RpcConfig;
///
/// let config = RpcConfig::default().with_worker_tasks(8).expect("workers");
/// assert_eq!(config.worker_tasks, 8);
/// ```
#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub request_topic: String,
    pub reply_topic: String,
    // Consumer group shared by all server consumers so each request is
    // handled exactly once per server deployment.
    pub server_group: String,
    pub consumer_tasks: usize,
    pub worker_tasks: usize,
    // Bound of the consumer -> worker queue; a full queue blocks the
    // consumers rather than dropping requests.
    pub queue_depth: usize,
    pub shutdown_grace: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_topic: DEFAULT_REQUEST_TOPIC.to_string(),
            reply_topic: DEFAULT_REPLY_TOPIC.to_string(),
            server_group: DEFAULT_SERVER_GROUP.to_string(),
            consumer_tasks: DEFAULT_CONSUMER_TASKS,
            worker_tasks: DEFAULT_WORKER_TASKS,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
        }
    }
}

impl RpcConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = env::read_string("WAGGLE_REQUEST_TOPIC") {
            config.request_topic = value;
        }
        if let Some(value) = env::read_string("WAGGLE_REPLY_TOPIC") {
            config.reply_topic = value;
        }
        if let Some(value) = env::read_string("WAGGLE_SERVER_GROUP") {
            config.server_group = value;
        }
        if let Some(value) = env::read_usize("WAGGLE_CONSUMER_TASKS") {
            config.consumer_tasks = value;
        }
        if let Some(value) = env::read_usize("WAGGLE_WORKER_TASKS") {
            config.worker_tasks = value;
        }
        if let Some(value) = env::read_usize("WAGGLE_QUEUE_DEPTH") {
            config.queue_depth = value;
        }
        if let Some(value) = env::read_u64("WAGGLE_SHUTDOWN_GRACE_MS") {
            config.shutdown_grace = Duration::from_millis(value);
        }
        config
    }

    pub fn with_request_topic(mut self, topic: impl Into<String>) -> Self {
        self.request_topic = topic.into();
        self
    }

    pub fn with_reply_topic(mut self, topic: impl Into<String>) -> Self {
        self.reply_topic = topic.into();
        self
    }

    pub fn with_server_group(mut self, group: impl Into<String>) -> Self {
        self.server_group = group.into();
        self
    }

    pub fn with_consumer_tasks(mut self, count: usize) -> Result<Self> {
        if count == 0 {
            return Err(RpcError::Config("consumer task count must be non-zero".into()));
        }
        self.consumer_tasks = count;
        Ok(self)
    }

    pub fn with_worker_tasks(mut self, count: usize) -> Result<Self> {
        if count == 0 {
            return Err(RpcError::Config("worker task count must be non-zero".into()));
        }
        self.worker_tasks = count;
        Ok(self)
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Result<Self> {
        if depth == 0 {
            return Err(RpcError::Config("queue depth must be non-zero".into()));
        }
        self.queue_depth = depth;
        Ok(self)
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_constants() {
        let config = RpcConfig::default();
        assert_eq!(config.request_topic, DEFAULT_REQUEST_TOPIC);
        assert_eq!(config.reply_topic, DEFAULT_REPLY_TOPIC);
        assert_eq!(config.consumer_tasks, DEFAULT_CONSUMER_TASKS);
        assert_eq!(config.worker_tasks, DEFAULT_WORKER_TASKS);
        assert_eq!(config.queue_depth, DEFAULT_QUEUE_DEPTH);
    }

    #[test]
    fn zero_pool_sizes_are_rejected() {
        assert!(RpcConfig::default().with_consumer_tasks(0).is_err());
        assert!(RpcConfig::default().with_worker_tasks(0).is_err());
        assert!(RpcConfig::default().with_queue_depth(0).is_err());
    }
}
