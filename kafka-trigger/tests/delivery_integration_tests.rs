mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;

use kafka_trigger::schema::SchemaError;
use kafka_trigger::test_utils::{
    FailingHandler, InMemoryBroker, RecordingDeadLetterSink, RecordingHandler,
};
use kafka_trigger::{
    AvroDeserializer, DecodingMode, DeliveryStyle, EventBatch, InMemoryOffsetStore, Partition,
    TriggerBinding, TriggerHandler,
};

use common::{append_at, coordinator, framed_user, host, wait_until, USER_SCHEMA};

#[derive(Debug, Deserialize, PartialEq)]
struct User {
    registertime: i64,
    userid: String,
    regionid: String,
    gender: String,
}

/// Receives raw bytes and deserializes each record itself, recording the
/// records it could not read.
struct ManualUserHandler {
    deserializer: AvroDeserializer<User>,
    users: Mutex<Vec<String>>,
    failures: Mutex<Vec<(i64, SchemaError)>>,
}

#[async_trait]
impl TriggerHandler for ManualUserHandler {
    async fn handle(&self, batch: &EventBatch) -> anyhow::Result<()> {
        for event in batch {
            let Some(bytes) = event.value.as_bytes() else {
                anyhow::bail!("expected raw bytes");
            };
            match self.deserializer.deserialize(bytes).await {
                Ok(user) => self.users.lock().unwrap().push(user.userid),
                Err(e) => self.failures.lock().unwrap().push((event.offset, e)),
            }
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_failed_batch_is_redelivered_then_committed() {
    let broker = InMemoryBroker::new();
    let partition = Partition::new("users", 0);
    append_at(
        &broker,
        &partition,
        10,
        &[
            Bytes::from("User_1"),
            Bytes::from("User_2"),
            Bytes::from("User_3"),
        ],
    );

    let store = Arc::new(InMemoryOffsetStore::new());
    let handler = Arc::new(RecordingHandler::new().failing_on(&[1]));
    let mut host = host(&broker, coordinator(store.clone(), &[("users", 1)]));
    host.register(TriggerBinding::new(
        "UserAsString",
        "users",
        "azfunc",
        DecodingMode::RawString,
        handler.clone(),
    ))
    .unwrap();

    let running = host.start();
    wait_until("offset 12 to be committed", || {
        store.get("azfunc", &partition) == Some(12)
    })
    .await;
    running.shutdown().await.unwrap();

    assert_eq!(handler.invocations(), 2);
    let batches = handler.batches();
    assert_eq!(batches[0], batches[1]);
    assert_eq!(batches[0].offsets(), vec![10, 11, 12]);
    assert_eq!(handler.texts(), vec!["User_1", "User_2", "User_3"]);
    assert_eq!(store.get("azfunc", &partition), Some(12));
}

#[tokio::test]
async fn test_malformed_raw_bytes_fail_only_their_record() {
    let broker = InMemoryBroker::new();
    let partition = Partition::new("users", 0);
    append_at(
        &broker,
        &partition,
        0,
        &[
            framed_user("User_1"),
            Bytes::from_static(b"\x07not avro"),
            framed_user("User_3"),
        ],
    );

    let store = Arc::new(InMemoryOffsetStore::new());
    let mut host = host(&broker, coordinator(store.clone(), &[("users", 1)]));
    let handler = Arc::new(ManualUserHandler {
        deserializer: AvroDeserializer::with_static_schema(host.resolver().clone(), USER_SCHEMA),
        users: Mutex::new(Vec::new()),
        failures: Mutex::new(Vec::new()),
    });
    host.register(TriggerBinding::new(
        "UserAsBytes",
        "users",
        "azfunc_bytes",
        DecodingMode::RawBytes,
        handler.clone(),
    ))
    .unwrap();

    let running = host.start();
    wait_until("offset 2 to be committed", || {
        store.get("azfunc_bytes", &partition) == Some(2)
    })
    .await;
    running.shutdown().await.unwrap();

    assert_eq!(*handler.users.lock().unwrap(), vec!["User_1", "User_3"]);
    let failures = handler.failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, 1);
    assert!(matches!(failures[0].1, SchemaError::SchemaMismatch(_)));
}

#[tokio::test]
async fn test_undecodable_records_are_dead_lettered() {
    let broker = InMemoryBroker::new();
    let partition = Partition::new("users", 0);
    append_at(
        &broker,
        &partition,
        0,
        &[
            framed_user("User_1"),
            Bytes::from_static(b"\x00\x00"),
            framed_user("User_3"),
        ],
    );

    let store = Arc::new(InMemoryOffsetStore::new());
    let handler = Arc::new(RecordingHandler::new());
    let dead_letters = Arc::new(RecordingDeadLetterSink::new());
    let mut host = host(&broker, coordinator(store.clone(), &[("users", 1)]));
    host.register(
        TriggerBinding::new(
            "User",
            "users",
            "azfunc",
            DecodingMode::structured(USER_SCHEMA),
            handler.clone(),
        )
        .with_dead_letter_sink(dead_letters.clone()),
    )
    .unwrap();

    let running = host.start();
    wait_until("offset 2 to be committed", || {
        store.get("azfunc", &partition) == Some(2)
    })
    .await;
    running.shutdown().await.unwrap();

    assert_eq!(handler.offsets(), vec![0, 2]);
    let users: Vec<User> = handler
        .delivered()
        .iter()
        .flat_map(|batch| batch.events.clone())
        .map(|event| event.deserialize::<User>().unwrap())
        .collect();
    assert_eq!(
        users[1],
        User {
            registertime: 1_493_819_497_170,
            userid: "User_3".to_string(),
            regionid: "Region_4".to_string(),
            gender: "FEMALE".to_string(),
        }
    );

    let letters = dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].offset, 1);
    assert_eq!(letters[0].binding, "User");
    assert!(matches!(letters[0].error, SchemaError::SchemaMismatch(_)));
}

#[tokio::test]
async fn test_truncated_structured_record_is_dead_lettered_not_retried() {
    let broker = InMemoryBroker::new();
    let partition = Partition::new("users", 0);
    let truncated = framed_user("User_2");
    append_at(
        &broker,
        &partition,
        0,
        &[
            framed_user("User_1"),
            truncated.slice(..truncated.len() - 3),
            framed_user("User_3"),
        ],
    );

    let store = Arc::new(InMemoryOffsetStore::new());
    let handler = Arc::new(RecordingHandler::new());
    let dead_letters = Arc::new(RecordingDeadLetterSink::new());
    let mut host = host(&broker, coordinator(store.clone(), &[("users", 1)]));
    host.register(
        TriggerBinding::new(
            "User",
            "users",
            "azfunc",
            DecodingMode::structured(USER_SCHEMA),
            handler.clone(),
        )
        .with_dead_letter_sink(dead_letters.clone()),
    )
    .unwrap();

    let running = host.start();
    wait_until("offset 2 to be committed", || {
        store.get("azfunc", &partition) == Some(2)
    })
    .await;
    running.shutdown().await.unwrap();

    assert_eq!(handler.invocations(), 1);
    assert_eq!(handler.offsets(), vec![0, 2]);
    let users: Vec<String> = handler
        .delivered()
        .iter()
        .flat_map(|batch| batch.events.clone())
        .map(|event| event.deserialize::<User>().unwrap().userid)
        .collect();
    assert_eq!(users, vec!["User_1", "User_3"]);

    let letters = dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].offset, 1);
    assert!(matches!(letters[0].error, SchemaError::SchemaMismatch(_)));
}

#[tokio::test]
async fn test_batch_of_only_undecodable_records_is_committed() {
    let broker = InMemoryBroker::new();
    let partition = Partition::new("users", 0);
    append_at(&broker, &partition, 0, &[Bytes::from_static(b"\xff\xfe")]);

    let store = Arc::new(InMemoryOffsetStore::new());
    let handler = Arc::new(RecordingHandler::new());
    let mut host = host(&broker, coordinator(store.clone(), &[("users", 1)]));
    host.register(TriggerBinding::new(
        "UserAsString",
        "users",
        "azfunc",
        DecodingMode::RawString,
        handler.clone(),
    ))
    .unwrap();

    let running = host.start();
    wait_until("offset 0 to be committed", || {
        store.get("azfunc", &partition) == Some(0)
    })
    .await;
    running.shutdown().await.unwrap();

    assert_eq!(handler.invocations(), 0);
}

#[tokio::test]
async fn test_single_style_commits_after_every_record() {
    let broker = InMemoryBroker::new();
    let partition = Partition::new("users", 0);
    append_at(
        &broker,
        &partition,
        0,
        &[Bytes::from("a"), Bytes::from("b"), Bytes::from("c")],
    );

    let store = Arc::new(InMemoryOffsetStore::new());
    let handler = Arc::new(
        RecordingHandler::new()
            .failing_on(&[3])
            .with_delay(std::time::Duration::from_millis(20)),
    );
    let mut host = host(&broker, coordinator(store.clone(), &[("users", 1)]));
    host.register(
        TriggerBinding::new(
            "UserAsByte",
            "users",
            "azfunc",
            DecodingMode::RawString,
            handler.clone(),
        )
        .with_style(DeliveryStyle::Single),
    )
    .unwrap();

    let running = host.start();
    // the third record fails once; nothing is committed until it succeeds
    wait_until("third record attempted", || handler.invocations() >= 3).await;
    assert_eq!(store.get("azfunc", &partition), None);
    wait_until("offset 2 to be committed", || {
        store.get("azfunc", &partition) == Some(2)
    })
    .await;
    running.shutdown().await.unwrap();

    assert_eq!(handler.invocations(), 4);
    assert_eq!(handler.texts(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_exhausted_delivery_halts_only_that_partition() {
    let broker = InMemoryBroker::new();
    let failing_partition = Partition::new("PAGEVIEWS_FEMALE", 0);
    let healthy_partition = Partition::new("users", 0);
    append_at(&broker, &failing_partition, 0, &[Bytes::from("pageview")]);
    append_at(&broker, &healthy_partition, 0, &[Bytes::from("User_1")]);

    let store = Arc::new(InMemoryOffsetStore::new());
    let failing = Arc::new(FailingHandler::new(u32::MAX));
    let healthy = Arc::new(RecordingHandler::new());
    let mut host = host(
        &broker,
        coordinator(store.clone(), &[("PAGEVIEWS_FEMALE", 1), ("users", 1)]),
    );
    host.register(TriggerBinding::new(
        "PageViewsFemale",
        "PAGEVIEWS_FEMALE",
        "azfunc",
        DecodingMode::RawString,
        failing.clone(),
    ))
    .unwrap();
    host.register(TriggerBinding::new(
        "UserAsString",
        "users",
        "azfunc_users",
        DecodingMode::RawString,
        healthy.clone(),
    ))
    .unwrap();

    let mut running = host.start();
    let report = loop {
        let report = running.next_report().await.expect("a report arrives");
        if report.is_halted() {
            break report;
        }
    };
    assert_eq!(report.binding, "PageViewsFemale");
    assert_eq!(report.partition, failing_partition);
    assert_eq!(report.committed, None);
    assert!(running
        .halted()
        .contains_key(&("PageViewsFemale".to_string(), failing_partition.clone())));

    wait_until("healthy partition committed", || {
        store.get("azfunc_users", &healthy_partition) == Some(0)
    })
    .await;
    running.shutdown().await.unwrap();

    assert_eq!(failing.invocations(), 3);
    assert_eq!(failing.processed(), 0);
    assert_eq!(store.get("azfunc", &failing_partition), None);
}

#[tokio::test]
async fn test_duplicate_binding_names_are_rejected() {
    let broker = InMemoryBroker::new();
    let mut host = host(
        &broker,
        coordinator(Arc::new(InMemoryOffsetStore::new()), &[("users", 1)]),
    );
    let binding = TriggerBinding::new(
        "User",
        "users",
        "azfunc",
        DecodingMode::structured(USER_SCHEMA),
        Arc::new(RecordingHandler::new()),
    );

    host.register(binding.clone()).unwrap();
    assert!(matches!(
        host.register(binding),
        Err(kafka_trigger::TriggerError::DuplicateBinding(name)) if name == "User"
    ));
    assert_eq!(host.bindings().count(), 1);
}
