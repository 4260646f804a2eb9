use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use apache_avro::types::Value as AvroValue;
use apache_avro::Schema;
use async_trait::async_trait;
use bytes::Bytes;

use kafka_trigger::schema::framing::frame;
use kafka_trigger::test_utils::{InMemoryBroker, RecordingDeadLetterSink};
use kafka_trigger::{
    AvroDeserializer, ConsumerConfig, CoordinatorConfig, DecodedValue, EventBatch, FetchConfig,
    GroupCoordinator, HostConfig, InMemoryOffsetStore, Partition, SchemaResolver, TriggerBinding,
    TriggerHandler, TriggerHost,
};
use trigger_samples::samples::{
    bindings, PageViewsFemale, UserRecord, PAGEVIEWS_FEMALE_SCHEMA, PAGEVIEWS_FEMALE_TOPIC,
    USERS_TOPIC, USER_SCHEMA,
};

/// Runs the sample handler and keeps every batch it accepted.
struct Delivered {
    inner: Arc<dyn TriggerHandler>,
    batches: Mutex<Vec<EventBatch>>,
}

#[async_trait]
impl TriggerHandler for Delivered {
    async fn handle(&self, batch: &EventBatch) -> anyhow::Result<()> {
        self.inner.handle(batch).await?;
        self.batches.lock().unwrap().push(batch.clone());
        Ok(())
    }
}

impl Delivered {
    fn values(&self) -> Vec<DecodedValue> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|batch| batch.events.iter().map(|event| event.value.clone()))
            .collect()
    }
}

fn framed(schema: &str, fields: &[(&str, AvroValue)]) -> Bytes {
    let schema = Schema::parse_str(schema).unwrap();
    let record = AvroValue::Record(
        fields
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect(),
    );
    frame(1, &apache_avro::to_avro_datum(&schema, record).unwrap())
}

fn user(userid: &str) -> Bytes {
    framed(
        USER_SCHEMA,
        &[
            ("registertime", AvroValue::Long(1_493_819_497_170)),
            ("userid", AvroValue::String(userid.to_string())),
            ("regionid", AvroValue::String("Region_4".to_string())),
            ("gender", AvroValue::String("FEMALE".to_string())),
        ],
    )
}

fn page_view(userid: &str) -> Bytes {
    framed(
        PAGEVIEWS_FEMALE_SCHEMA,
        &[
            ("USERID", AvroValue::String(userid.to_string())),
            ("PAGEID", AvroValue::String("Page_12".to_string())),
            ("REGIONID", AvroValue::String("Region_4".to_string())),
            ("GENDER", AvroValue::String("FEMALE".to_string())),
        ],
    )
}

#[tokio::test]
async fn test_every_sample_binding_consumes_its_topic() {
    let broker = InMemoryBroker::new();
    let users = Partition::new(USERS_TOPIC, 0);
    let page_views = Partition::new(PAGEVIEWS_FEMALE_TOPIC, 0);
    broker.produce(&users, [user("User_1"), user("User_2"), user("User_3")]);
    broker.produce(&page_views, [page_view("User_2")]);

    let store = Arc::new(InMemoryOffsetStore::new());
    let coordinator = Arc::new(
        GroupCoordinator::new(CoordinatorConfig::default(), store.clone())
            .with_topic(USERS_TOPIC, 1)
            .with_topic(PAGEVIEWS_FEMALE_TOPIC, 1),
    );
    let resolver = Arc::new(SchemaResolver::new());
    let config = HostConfig::default()
        .with_consumer(
            ConsumerConfig::default()
                .with_heartbeat_interval(Duration::from_millis(20))
                .with_fetch(FetchConfig::default().with_max_wait(Duration::from_millis(5))),
        )
        .with_shutdown_timeout(Duration::from_secs(5));

    let mut host = TriggerHost::new(coordinator, resolver.clone(), Arc::new(broker.clone()), config);
    let dead_letters = Arc::new(RecordingDeadLetterSink::new());
    let mut delivered = HashMap::new();
    for binding in bindings(&resolver) {
        let observed = Arc::new(Delivered {
            inner: binding.handler().clone(),
            batches: Mutex::new(Vec::new()),
        });
        delivered.insert(binding.name().to_string(), observed.clone());
        host.register(
            TriggerBinding::new(
                binding.name(),
                binding.topic(),
                binding.group(),
                binding.mode().clone(),
                observed,
            )
            .with_style(binding.style())
            .with_dead_letter_sink(dead_letters.clone()),
        )
        .unwrap();
    }
    let running = host.start();

    let expected = [
        ("azfunc", &users, 2),
        ("azfunc_asstring", &users, 2),
        ("azfunc_bytes", &users, 2),
        ("azfunc_byte", &users, 2),
        ("azfunc", &page_views, 0),
    ];
    let committed = tokio::time::timeout(Duration::from_secs(5), async {
        while !expected
            .iter()
            .all(|(group, partition, offset)| store.get(group, partition) == Some(*offset))
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(committed.is_ok(), "sample bindings did not commit");
    running.shutdown().await.unwrap();

    assert!(dead_letters.letters().is_empty());
    let expected_users = vec!["User_1", "User_2", "User_3"];

    let structured_users = |name: &str| -> Vec<String> {
        delivered[name]
            .values()
            .iter()
            .map(|value| value.deserialize::<UserRecord>().unwrap().userid)
            .collect()
    };
    assert_eq!(structured_users("User"), expected_users);
    assert_eq!(structured_users("UserAsString"), expected_users);

    let deserializer = AvroDeserializer::<UserRecord>::with_static_schema(resolver, USER_SCHEMA);
    for name in ["UserAsBytes", "UserAsByte"] {
        let mut users = Vec::new();
        for value in delivered[name].values() {
            let bytes = value.as_bytes().unwrap();
            users.push(deserializer.deserialize(bytes).await.unwrap().userid);
        }
        assert_eq!(users, expected_users, "{name}");
    }
    // single-record style hands each user over in its own invocation
    assert_eq!(delivered["UserAsByte"].batches.lock().unwrap().len(), 3);

    let views: Vec<PageViewsFemale> = delivered["PageViewsFemale"]
        .values()
        .iter()
        .map(|value| value.deserialize().unwrap())
        .collect();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].userid, "User_2");
    assert_eq!(views[0].pageid, "Page_12");
}
