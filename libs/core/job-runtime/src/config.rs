//! Runtime configuration.
//!
//! Every field has a default and can be overridden from the environment
//! (`JOBS_*` variables) or through the `with_*` builders.

use crate::error::JobError;
use core_config::{env_optional, env_or_default, env_parse_or_default, ConfigError, FromEnv};
use std::time::Duration;
use strum::{AsRefStr, Display, EnumString};

/// Default broker URL (single local NATS server).
pub const DEFAULT_BROKER_URL: &str = "nats://localhost:4222";

/// Handler method used when a job does not name one.
pub const DEFAULT_HANDLER_METHOD: &str = "perform";

/// Subscription semantics requested from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ConsumerType {
    Exclusive,
    #[default]
    Shared,
    Failover,
    KeyShared,
}

/// Per-subscription consumer options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    pub consumer_type: ConsumerType,
    /// Upper bound on messages returned by one batch receive
    pub batch_max_messages: usize,
    /// How long a batch receive waits to fill up
    pub batch_timeout: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            consumer_type: ConsumerType::Shared,
            batch_max_messages: 100,
            batch_timeout: Duration::from_millis(100),
        }
    }
}

impl ConsumerOptions {
    pub fn with_consumer_type(mut self, consumer_type: ConsumerType) -> Self {
        self.consumer_type = consumer_type;
        self
    }

    pub fn with_batch_max_messages(mut self, max: usize) -> Self {
        self.batch_max_messages = max;
        self
    }

    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }
}

/// Job runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// `scheme://host1,host2,...`
    pub broker_url: String,

    /// Topic used by jobs that do not declare one
    pub default_topic: Option<String>,

    /// Subscription used by jobs that do not declare one
    pub default_subscription: Option<String>,

    /// Consumer type used by jobs that do not declare one
    pub default_consumer_type: ConsumerType,

    /// Redelivery threshold used by jobs that do not declare one
    pub default_max_redelivery_count: u32,

    /// How long shutdown waits for an in-flight delivery
    pub max_shutdown_wait: Duration,

    /// How often shutdown re-checks the in-flight flag
    pub shutdown_poll_interval: Duration,

    /// Per-operation timeout handed to the broker client
    pub broker_operation_timeout: Duration,

    /// Per-attempt connection timeout
    pub broker_connection_timeout: Duration,

    /// Connection attempts before giving up
    pub broker_max_retries: u32,

    /// Sleep between connection attempts
    pub broker_retry_interval: Duration,

    /// Producer send timeout
    pub producer_send_timeout: Duration,

    /// Single-message receive timeout
    pub consumer_receive_timeout: Duration,

    /// Delay after every poll cycle (zero disables it)
    pub consumer_receive_interval: Duration,

    /// Batch receive size
    pub batch_max_messages: usize,

    /// Batch receive wait
    pub batch_timeout: Duration,

    /// Identity of this worker process, used in generated names
    pub host_id: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            broker_url: DEFAULT_BROKER_URL.to_string(),
            default_topic: None,
            default_subscription: None,
            default_consumer_type: ConsumerType::Shared,
            default_max_redelivery_count: 3,
            max_shutdown_wait: Duration::from_secs(10),
            shutdown_poll_interval: Duration::from_secs(1),
            broker_operation_timeout: Duration::from_secs(30),
            broker_connection_timeout: Duration::from_millis(10_000),
            broker_max_retries: 5,
            broker_retry_interval: Duration::from_secs(1),
            producer_send_timeout: Duration::from_millis(3_000),
            consumer_receive_timeout: Duration::from_millis(5_000),
            consumer_receive_interval: Duration::ZERO,
            batch_max_messages: 100,
            batch_timeout: Duration::from_millis(100),
            host_id: detect_host_id(),
        }
    }
}

impl RuntimeConfig {
    /// Create a configuration for the given broker URL.
    pub fn new(broker_url: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            ..Default::default()
        }
    }

    pub fn with_default_topic(mut self, topic: impl Into<String>) -> Self {
        self.default_topic = Some(topic.into());
        self
    }

    pub fn with_default_subscription(mut self, subscription: impl Into<String>) -> Self {
        self.default_subscription = Some(subscription.into());
        self
    }

    pub fn with_default_consumer_type(mut self, consumer_type: ConsumerType) -> Self {
        self.default_consumer_type = consumer_type;
        self
    }

    pub fn with_default_max_redelivery_count(mut self, count: u32) -> Self {
        self.default_max_redelivery_count = count;
        self
    }

    pub fn with_max_shutdown_wait(mut self, wait: Duration) -> Self {
        self.max_shutdown_wait = wait;
        self
    }

    pub fn with_shutdown_poll_interval(mut self, interval: Duration) -> Self {
        self.shutdown_poll_interval = interval;
        self
    }

    pub fn with_broker_max_retries(mut self, retries: u32) -> Self {
        self.broker_max_retries = retries;
        self
    }

    pub fn with_broker_retry_interval(mut self, interval: Duration) -> Self {
        self.broker_retry_interval = interval;
        self
    }

    pub fn with_consumer_receive_timeout(mut self, timeout: Duration) -> Self {
        self.consumer_receive_timeout = timeout;
        self
    }

    pub fn with_consumer_receive_interval(mut self, interval: Duration) -> Self {
        self.consumer_receive_interval = interval;
        self
    }

    pub fn with_batch(mut self, max_messages: usize, timeout: Duration) -> Self {
        self.batch_max_messages = max_messages;
        self.batch_timeout = timeout;
        self
    }

    pub fn with_host_id(mut self, host_id: impl Into<String>) -> Self {
        self.host_id = host_id.into();
        self
    }

    /// Parse the broker URL into its host list.
    ///
    /// `nats://a:4222,b:4222` yields `["a:4222", "b:4222"]`.
    pub fn broker_hosts(&self) -> Result<Vec<String>, JobError> {
        let (_, hosts) = self.broker_url.split_once("://").ok_or_else(|| {
            JobError::configuration(format!("invalid broker url '{}'", self.broker_url))
        })?;

        let hosts: Vec<String> = hosts
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect();

        if hosts.is_empty() {
            return Err(JobError::configuration(format!(
                "broker url '{}' lists no hosts",
                self.broker_url
            )));
        }

        Ok(hosts)
    }

    /// URL scheme of the broker URL (`nats` by default).
    pub fn broker_scheme(&self) -> &str {
        self.broker_url
            .split_once("://")
            .map(|(scheme, _)| scheme)
            .unwrap_or("nats")
    }

    /// Subscription used when neither the job nor the config names one.
    pub fn auto_subscription(&self) -> String {
        format!("job-runtime-subscription-{}", self.host_id)
    }

    /// Producer name advertised to the broker.
    pub fn producer_name(&self) -> String {
        format!("job-runtime-producer-{}", self.host_id)
    }

    /// Consumer options derived from the runtime defaults.
    pub fn consumer_options(&self) -> ConsumerOptions {
        ConsumerOptions {
            consumer_type: self.default_consumer_type,
            batch_max_messages: self.batch_max_messages,
            batch_timeout: self.batch_timeout,
        }
    }
}

impl FromEnv for RuntimeConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = RuntimeConfig::default();

        let consumer_type = match env_optional("JOBS_DEFAULT_CONSUMER_TYPE") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::ParseError {
                key: "JOBS_DEFAULT_CONSUMER_TYPE".to_string(),
                details: format!("unknown consumer type '{raw}'"),
            })?,
            None => defaults.default_consumer_type,
        };

        Ok(Self {
            broker_url: env_or_default("JOBS_BROKER_URL", DEFAULT_BROKER_URL),
            default_topic: env_optional("JOBS_DEFAULT_TOPIC"),
            default_subscription: env_optional("JOBS_DEFAULT_SUBSCRIPTION"),
            default_consumer_type: consumer_type,
            default_max_redelivery_count: env_parse_or_default(
                "JOBS_MAX_REDELIVERY_COUNT",
                defaults.default_max_redelivery_count,
            )?,
            max_shutdown_wait: Duration::from_secs(env_parse_or_default(
                "JOBS_MAX_SHUTDOWN_WAIT_SECONDS",
                10,
            )?),
            shutdown_poll_interval: defaults.shutdown_poll_interval,
            broker_operation_timeout: Duration::from_secs(env_parse_or_default(
                "JOBS_BROKER_OPERATION_TIMEOUT_SECONDS",
                30,
            )?),
            broker_connection_timeout: Duration::from_millis(env_parse_or_default(
                "JOBS_BROKER_CONNECTION_TIMEOUT_MS",
                10_000,
            )?),
            broker_max_retries: env_parse_or_default(
                "JOBS_BROKER_MAX_RETRIES",
                defaults.broker_max_retries,
            )?,
            broker_retry_interval: Duration::from_secs(env_parse_or_default(
                "JOBS_BROKER_RETRY_INTERVAL_SECONDS",
                1,
            )?),
            producer_send_timeout: Duration::from_millis(env_parse_or_default(
                "JOBS_PRODUCER_SEND_TIMEOUT_MS",
                3_000,
            )?),
            consumer_receive_timeout: Duration::from_millis(env_parse_or_default(
                "JOBS_CONSUMER_RECEIVE_TIMEOUT_MS",
                5_000,
            )?),
            consumer_receive_interval: Duration::from_millis(env_parse_or_default(
                "JOBS_CONSUMER_RECEIVE_INTERVAL_MS",
                0,
            )?),
            batch_max_messages: env_parse_or_default(
                "JOBS_BATCH_MAX_MESSAGES",
                defaults.batch_max_messages,
            )?,
            batch_timeout: Duration::from_millis(env_parse_or_default(
                "JOBS_BATCH_TIMEOUT_MS",
                100,
            )?),
            host_id: defaults.host_id,
        })
    }
}

/// Hostname when available, otherwise a random 16 hex char id.
fn detect_host_id() -> String {
    env_optional("HOSTNAME").unwrap_or_else(|| {
        let mut id = uuid::Uuid::new_v4().simple().to_string();
        id.truncate(16);
        id
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.broker_url, "nats://localhost:4222");
        assert_eq!(config.default_consumer_type, ConsumerType::Shared);
        assert_eq!(config.max_shutdown_wait, Duration::from_secs(10));
        assert_eq!(config.consumer_receive_timeout, Duration::from_millis(5000));
        assert_eq!(config.consumer_receive_interval, Duration::ZERO);
        assert!(config.default_topic.is_none());
    }

    #[test]
    fn test_broker_hosts_splits_list() {
        let config = RuntimeConfig::new("nats://a:4222, b:4222,,c:4222");
        assert_eq!(
            config.broker_hosts().unwrap(),
            vec!["a:4222".to_string(), "b:4222".to_string(), "c:4222".to_string()]
        );
        assert_eq!(config.broker_scheme(), "nats");
    }

    #[test]
    fn test_broker_hosts_rejects_invalid_url() {
        let err = RuntimeConfig::new("localhost:4222").broker_hosts().unwrap_err();
        assert!(matches!(err, JobError::Configuration(_)));

        let err = RuntimeConfig::new("nats://").broker_hosts().unwrap_err();
        assert!(err.to_string().contains("no hosts"));
    }

    #[test]
    fn test_generated_names_use_host_id() {
        let config = RuntimeConfig::default().with_host_id("worker-7");
        assert_eq!(config.auto_subscription(), "job-runtime-subscription-worker-7");
        assert_eq!(config.producer_name(), "job-runtime-producer-worker-7");
    }

    #[test]
    fn test_consumer_type_parsing() {
        assert_eq!("key_shared".parse::<ConsumerType>().unwrap(), ConsumerType::KeyShared);
        assert_eq!("Exclusive".parse::<ConsumerType>().unwrap(), ConsumerType::Exclusive);
        assert_eq!(ConsumerType::Failover.to_string(), "failover");
        assert!("round_robin".parse::<ConsumerType>().is_err());
    }

    #[test]
    fn test_from_env() {
        temp_env::with_vars(
            [
                ("JOBS_BROKER_URL", Some("nats://n1:4222,n2:4222")),
                ("JOBS_DEFAULT_TOPIC", Some("jobs.default")),
                ("JOBS_DEFAULT_CONSUMER_TYPE", Some("failover")),
                ("JOBS_MAX_SHUTDOWN_WAIT_SECONDS", Some("3")),
                ("JOBS_CONSUMER_RECEIVE_INTERVAL_MS", Some("250")),
                ("JOBS_DEFAULT_SUBSCRIPTION", None),
            ],
            || {
                let config = RuntimeConfig::from_env().unwrap();
                assert_eq!(config.broker_hosts().unwrap().len(), 2);
                assert_eq!(config.default_topic.as_deref(), Some("jobs.default"));
                assert!(config.default_subscription.is_none());
                assert_eq!(config.default_consumer_type, ConsumerType::Failover);
                assert_eq!(config.max_shutdown_wait, Duration::from_secs(3));
                assert_eq!(config.consumer_receive_interval, Duration::from_millis(250));
            },
        );
    }

    #[test]
    fn test_from_env_rejects_bad_numbers() {
        temp_env::with_var("JOBS_BROKER_MAX_RETRIES", Some("many"), || {
            let err = RuntimeConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("JOBS_BROKER_MAX_RETRIES"));
        });
    }

    #[test]
    fn test_from_env_rejects_unknown_consumer_type() {
        temp_env::with_var("JOBS_DEFAULT_CONSUMER_TYPE", Some("broadcast"), || {
            let err = RuntimeConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("broadcast"));
        });
    }
}
