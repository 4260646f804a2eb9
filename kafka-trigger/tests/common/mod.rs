#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use apache_avro::types::Value as AvroValue;
use apache_avro::Schema;
use bytes::Bytes;

use kafka_trigger::backoff::BackoffPolicy;
use kafka_trigger::codec::{Record, RecordBatch};
use kafka_trigger::schema::framing::frame;
use kafka_trigger::test_utils::InMemoryBroker;
use kafka_trigger::{
    ConsumerConfig, CoordinatorConfig, DeliveryConfig, FetchConfig, GroupCoordinator, HostConfig,
    InMemoryOffsetStore, Partition, SchemaResolver, TriggerHost,
};

pub const USER_SCHEMA: &str = r#"{
    "type": "record",
    "name": "UserRecord",
    "namespace": "KafkaFunctionSample",
    "fields": [
        {"name": "registertime", "type": "long"},
        {"name": "userid", "type": "string"},
        {"name": "regionid", "type": "string"},
        {"name": "gender", "type": "string"}
    ]
}"#;

pub fn user_value(userid: &str) -> AvroValue {
    AvroValue::Record(vec![
        ("registertime".to_string(), AvroValue::Long(1_493_819_497_170)),
        ("userid".to_string(), AvroValue::String(userid.to_string())),
        ("regionid".to_string(), AvroValue::String("Region_4".to_string())),
        ("gender".to_string(), AvroValue::String("FEMALE".to_string())),
    ])
}

pub fn framed_user(userid: &str) -> Bytes {
    let schema = Schema::parse_str(USER_SCHEMA).expect("user schema parses");
    let body = apache_avro::to_avro_datum(&schema, user_value(userid)).expect("user encodes");
    frame(1, &body)
}

/// Append records with the given values at explicit offsets as one batch.
pub fn append_at(broker: &InMemoryBroker, partition: &Partition, first_offset: i64, values: &[Bytes]) {
    let records = values
        .iter()
        .enumerate()
        .map(|(i, value)| Record::new(first_offset + i as i64, value.clone()))
        .collect();
    broker.append_batch(partition, RecordBatch::new(records));
}

pub fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_millis(1), 2.0, Duration::from_millis(5)).without_jitter()
}

pub fn consumer_config() -> ConsumerConfig {
    ConsumerConfig::default()
        .with_heartbeat_interval(Duration::from_millis(20))
        .with_fetch(
            FetchConfig::default()
                .with_max_wait(Duration::from_millis(5))
                .with_backoff(fast_backoff())
                .with_max_consecutive_failures(3),
        )
        .with_delivery(
            DeliveryConfig::default()
                .with_max_attempts(3)
                .with_retry_delay(Duration::from_millis(1)),
        )
}

pub fn coordinator(store: Arc<InMemoryOffsetStore>, topics: &[(&str, i32)]) -> Arc<GroupCoordinator> {
    let config = CoordinatorConfig::default()
        .with_session_timeout(Duration::from_secs(2))
        .with_rebalance_timeout(Duration::from_secs(2))
        .with_commit_backoff(fast_backoff());
    let coordinator = GroupCoordinator::new(config, store);
    for (topic, partitions) in topics {
        coordinator.register_topic(*topic, *partitions);
    }
    Arc::new(coordinator)
}

pub fn host(broker: &InMemoryBroker, coordinator: Arc<GroupCoordinator>) -> TriggerHost {
    TriggerHost::new(
        coordinator,
        Arc::new(SchemaResolver::new()),
        Arc::new(broker.clone()),
        HostConfig::default()
            .with_consumer(consumer_config())
            .with_shutdown_timeout(Duration::from_secs(5)),
    )
}

pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}
