use std::time::Duration;

use anyhow::Context;
use envconfig::Envconfig;

use kafka_trigger::backoff::BackoffPolicy;
use kafka_trigger::{ConsumerConfig, CoordinatorConfig, DeliveryConfig, FetchConfig, HostConfig};

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "trigger-samples")]
    pub kafka_client_id: String,

    // comma separated topic:partitions pairs
    #[envconfig(default = "users:1,PAGEVIEWS_FEMALE:1")]
    pub kafka_topic_partitions: String,

    // Fetch configuration
    #[envconfig(default = "500")]
    pub fetch_max_wait_ms: u64,

    #[envconfig(default = "1048576")] // 1MB
    pub fetch_max_bytes: i32,

    #[envconfig(default = "100")]
    pub fetch_backoff_base_ms: u64,

    #[envconfig(default = "30000")]
    pub fetch_backoff_max_ms: u64,

    #[envconfig(default = "10")]
    pub fetch_max_consecutive_failures: u32,

    // Delivery configuration
    #[envconfig(default = "5")]
    pub delivery_max_attempts: u32,

    #[envconfig(default = "500")]
    pub delivery_retry_delay_ms: u64,

    // Group membership
    #[envconfig(default = "10000")]
    pub session_timeout_ms: u64,

    #[envconfig(default = "3000")]
    pub heartbeat_interval_ms: u64,

    #[envconfig(default = "30000")]
    pub rebalance_timeout_ms: u64,

    #[envconfig(default = "30")]
    pub shutdown_timeout_secs: u64,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// Parse `KAFKA_TOPIC_PARTITIONS` into (topic, partition count) pairs.
    pub fn topic_partitions(&self) -> anyhow::Result<Vec<(String, i32)>> {
        self.kafka_topic_partitions
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let (topic, partitions) = entry
                    .rsplit_once(':')
                    .with_context(|| format!("expected topic:partitions, got {entry:?}"))?;
                let partitions: i32 = partitions
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid partition count in {entry:?}"))?;
                if topic.trim().is_empty() || partitions < 1 {
                    anyhow::bail!("invalid topic entry {entry:?}");
                }
                Ok((topic.trim().to_string(), partitions))
            })
            .collect()
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig::default()
            .with_client_id(self.kafka_client_id.clone())
            .with_max_wait(Duration::from_millis(self.fetch_max_wait_ms))
            .with_max_bytes(self.fetch_max_bytes)
            .with_backoff(BackoffPolicy::new(
                Duration::from_millis(self.fetch_backoff_base_ms),
                2.0,
                Duration::from_millis(self.fetch_backoff_max_ms),
            ))
            .with_max_consecutive_failures(self.fetch_max_consecutive_failures)
    }

    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig::default()
            .with_max_attempts(self.delivery_max_attempts)
            .with_retry_delay(Duration::from_millis(self.delivery_retry_delay_ms))
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig::default()
            .with_session_timeout(Duration::from_millis(self.session_timeout_ms))
            .with_rebalance_timeout(Duration::from_millis(self.rebalance_timeout_ms))
    }

    pub fn host_config(&self) -> HostConfig {
        HostConfig::default()
            .with_consumer(
                ConsumerConfig::default()
                    .with_heartbeat_interval(Duration::from_millis(self.heartbeat_interval_ms))
                    .with_fetch(self.fetch_config())
                    .with_delivery(self.delivery_config()),
            )
            .with_shutdown_timeout(Duration::from_secs(self.shutdown_timeout_secs))
    }
}
