//! Sample trigger bindings.
//!
//! Each handler logs what it receives: `User` and `PageViewsFemale` get
//! structured Avro records, `UserAsString` gets each user record as JSON
//! text, and the two byte-oriented handlers decode the Avro payload
//! themselves, skipping the records they cannot read.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use kafka_trigger::schema::SchemaError;
use kafka_trigger::{
    AvroDeserializer, DecodedValue, DecodingMode, DeliveryStyle, EventBatch, SchemaResolver,
    TriggerBinding, TriggerEvent, TriggerHandler,
};

const SKIPPED_RECORDS_COUNTER: &str = "trigger_samples_skipped_records_total";

pub const USERS_TOPIC: &str = "users";
pub const PAGEVIEWS_FEMALE_TOPIC: &str = "PAGEVIEWS_FEMALE";

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

pub const PAGEVIEWS_FEMALE_SCHEMA: &str = r#"{
    "type": "record",
    "name": "PageViewsFemale",
    "namespace": "KafkaFunctionSample",
    "fields": [
        {"name": "USERID", "type": "string"},
        {"name": "PAGEID", "type": "string"},
        {"name": "REGIONID", "type": "string"},
        {"name": "GENDER", "type": "string"}
    ]
}"#;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub registertime: i64,
    pub userid: String,
    pub regionid: String,
    pub gender: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct PageViewsFemale {
    pub userid: String,
    pub pageid: String,
    pub regionid: String,
    pub gender: String,
}

/// Every sample binding, in registration order.
pub fn bindings(resolver: &Arc<SchemaResolver>) -> Vec<TriggerBinding> {
    let user_deserializer =
        AvroDeserializer::<UserRecord>::with_static_schema(resolver.clone(), USER_SCHEMA);

    vec![
        TriggerBinding::new(
            "User",
            USERS_TOPIC,
            "azfunc",
            DecodingMode::structured(USER_SCHEMA),
            Arc::new(UserHandler),
        ),
        TriggerBinding::new(
            "UserAsString",
            USERS_TOPIC,
            "azfunc_asstring",
            DecodingMode::structured(USER_SCHEMA),
            Arc::new(UserAsStringHandler),
        ),
        TriggerBinding::new(
            "UserAsBytes",
            USERS_TOPIC,
            "azfunc_bytes",
            DecodingMode::RawBytes,
            Arc::new(UserAsBytesHandler::new(user_deserializer.clone())),
        ),
        TriggerBinding::new(
            "UserAsByte",
            USERS_TOPIC,
            "azfunc_byte",
            DecodingMode::RawBytes,
            Arc::new(UserAsByteHandler::new(user_deserializer)),
        )
        .with_style(DeliveryStyle::Single),
        TriggerBinding::new(
            "PageViewsFemale",
            PAGEVIEWS_FEMALE_TOPIC,
            "azfunc",
            DecodingMode::structured(PAGEVIEWS_FEMALE_SCHEMA),
            Arc::new(PageViewsFemaleHandler),
        ),
    ]
}

fn log_lines(batch: &EventBatch, lines: &[String]) {
    for line in lines {
        info!(
            binding = batch.binding.as_str(),
            partition = %batch.partition,
            "{line}"
        );
    }
}

pub struct UserHandler;

impl UserHandler {
    pub fn render(&self, batch: &EventBatch) -> anyhow::Result<Vec<String>> {
        batch
            .iter()
            .map(|event| {
                let user: UserRecord = event
                    .deserialize()
                    .with_context(|| format!("user record at offset {}", event.offset))?;
                Ok(serde_json::to_string(&user)?)
            })
            .collect()
    }
}

#[async_trait]
impl TriggerHandler for UserHandler {
    async fn handle(&self, batch: &EventBatch) -> anyhow::Result<()> {
        log_lines(batch, &self.render(batch)?);
        Ok(())
    }
}

/// Takes each user as text: decoded records are rendered as JSON, text values
/// pass through unchanged.
pub struct UserAsStringHandler;

impl UserAsStringHandler {
    pub fn render(&self, batch: &EventBatch) -> anyhow::Result<Vec<String>> {
        batch
            .iter()
            .map(|event| {
                let text = match &event.value {
                    DecodedValue::Text(text) => text.clone(),
                    DecodedValue::Structured(_) => event
                        .value
                        .to_json()
                        .with_context(|| format!("user record at offset {}", event.offset))?
                        .to_string(),
                    DecodedValue::Bytes(_) => {
                        anyhow::bail!("expected text at offset {}", event.offset)
                    }
                };
                Ok(format!("Users from string: {text}"))
            })
            .collect()
    }
}

#[async_trait]
impl TriggerHandler for UserAsStringHandler {
    async fn handle(&self, batch: &EventBatch) -> anyhow::Result<()> {
        log_lines(batch, &self.render(batch)?);
        Ok(())
    }
}

/// Receives raw bytes for a whole batch and decodes each value with its own
/// deserializer. A value that does not decode is skipped; the rest of the
/// batch is still handled.
pub struct UserAsBytesHandler {
    deserializer: AvroDeserializer<UserRecord>,
    skipped: AtomicU64,
}

impl UserAsBytesHandler {
    pub fn new(deserializer: AvroDeserializer<UserRecord>) -> Self {
        Self {
            deserializer,
            skipped: AtomicU64::new(0),
        }
    }

    pub async fn render(&self, batch: &EventBatch) -> anyhow::Result<Vec<String>> {
        let mut lines = Vec::with_capacity(batch.len());
        for event in batch {
            match decode_user(&self.deserializer, event).await {
                Ok(user) => lines.push(format!(
                    "Custom deserialised user from batch: {}",
                    serde_json::to_string(&user)?
                )),
                Err(e) => skip(&self.skipped, batch, event, &e),
            }
        }
        Ok(lines)
    }

    /// Records skipped because they did not decode.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TriggerHandler for UserAsBytesHandler {
    async fn handle(&self, batch: &EventBatch) -> anyhow::Result<()> {
        log_lines(batch, &self.render(batch).await?);
        Ok(())
    }
}

/// Bound with single-record delivery: every invocation carries one event.
pub struct UserAsByteHandler {
    deserializer: AvroDeserializer<UserRecord>,
    skipped: AtomicU64,
}

impl UserAsByteHandler {
    pub fn new(deserializer: AvroDeserializer<UserRecord>) -> Self {
        Self {
            deserializer,
            skipped: AtomicU64::new(0),
        }
    }

    /// `None` when the event's value did not decode and was skipped.
    pub async fn render(&self, batch: &EventBatch) -> anyhow::Result<Option<String>> {
        let [event] = batch.events.as_slice() else {
            anyhow::bail!("expected a single event, got {}", batch.len());
        };
        match decode_user(&self.deserializer, event).await {
            Ok(user) => Ok(Some(format!(
                "Custom deserialised user: {}",
                serde_json::to_string(&user)?
            ))),
            Err(e) => {
                skip(&self.skipped, batch, event, &e);
                Ok(None)
            }
        }
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TriggerHandler for UserAsByteHandler {
    async fn handle(&self, batch: &EventBatch) -> anyhow::Result<()> {
        if let Some(line) = self.render(batch).await? {
            log_lines(batch, &[line]);
        }
        Ok(())
    }
}

pub struct PageViewsFemaleHandler;

impl PageViewsFemaleHandler {
    pub fn render(&self, batch: &EventBatch) -> anyhow::Result<Vec<String>> {
        batch
            .iter()
            .map(|event| {
                let view: PageViewsFemale = event
                    .deserialize()
                    .with_context(|| format!("page view at offset {}", event.offset))?;
                Ok(serde_json::to_string(&view)?)
            })
            .collect()
    }
}

#[async_trait]
impl TriggerHandler for PageViewsFemaleHandler {
    async fn handle(&self, batch: &EventBatch) -> anyhow::Result<()> {
        log_lines(batch, &self.render(batch)?);
        Ok(())
    }
}

async fn decode_user(
    deserializer: &AvroDeserializer<UserRecord>,
    event: &TriggerEvent,
) -> Result<UserRecord, SchemaError> {
    let Some(bytes) = event.value.as_bytes() else {
        return Err(SchemaError::SchemaMismatch(
            "expected a raw bytes value".to_string(),
        ));
    };
    deserializer.deserialize(bytes).await
}

fn skip(skipped: &AtomicU64, batch: &EventBatch, event: &TriggerEvent, error: &SchemaError) {
    skipped.fetch_add(1, Ordering::Relaxed);
    counter!(SKIPPED_RECORDS_COUNTER, "binding" => batch.binding.clone()).increment(1);
    warn!(
        binding = batch.binding.as_str(),
        partition = %batch.partition,
        offset = event.offset,
        error = %error,
        "Skipping user record that does not decode"
    );
}

#[cfg(test)]
mod tests {
    use apache_avro::types::Value as AvroValue;
    use apache_avro::Schema;
    use bytes::Bytes;

    use kafka_trigger::codec::Record;
    use kafka_trigger::schema::framing::frame;
    use kafka_trigger::{DecodedValue, Partition};

    use super::*;

    fn user_value(userid: &str) -> AvroValue {
        AvroValue::Record(vec![
            ("registertime".to_string(), AvroValue::Long(1_493_819_497_170)),
            ("userid".to_string(), AvroValue::String(userid.to_string())),
            ("regionid".to_string(), AvroValue::String("Region_4".to_string())),
            ("gender".to_string(), AvroValue::String("FEMALE".to_string())),
        ])
    }

    fn framed_user(userid: &str) -> Bytes {
        let schema = Schema::parse_str(USER_SCHEMA).unwrap();
        frame(1, &apache_avro::to_avro_datum(&schema, user_value(userid)).unwrap())
    }

    fn batch(values: Vec<DecodedValue>) -> EventBatch {
        let events = values
            .into_iter()
            .enumerate()
            .map(|(i, value)| TriggerEvent::from_record(&Record::new(i as i64, Bytes::new()), value))
            .collect();
        EventBatch::new("sample", Partition::new(USERS_TOPIC, 0), events)
    }

    fn user_json(userid: &str) -> String {
        format!(
            r#"{{"registertime":1493819497170,"userid":"{userid}","regionid":"Region_4","gender":"FEMALE"}}"#
        )
    }

    fn user_deserializer() -> AvroDeserializer<UserRecord> {
        AvroDeserializer::with_static_schema(Arc::new(SchemaResolver::new()), USER_SCHEMA)
    }

    #[test]
    fn test_sample_bindings() {
        let bindings = bindings(&Arc::new(SchemaResolver::new()));
        let summary: Vec<(&str, &str, &str, DeliveryStyle)> = bindings
            .iter()
            .map(|b| (b.name(), b.topic(), b.group(), b.style()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("User", "users", "azfunc", DeliveryStyle::Batch),
                ("UserAsString", "users", "azfunc_asstring", DeliveryStyle::Batch),
                ("UserAsBytes", "users", "azfunc_bytes", DeliveryStyle::Batch),
                ("UserAsByte", "users", "azfunc_byte", DeliveryStyle::Single),
                ("PageViewsFemale", "PAGEVIEWS_FEMALE", "azfunc", DeliveryStyle::Batch),
            ]
        );
        assert_eq!(*bindings[1].mode(), DecodingMode::structured(USER_SCHEMA));
        assert_eq!(*bindings[2].mode(), DecodingMode::RawBytes);
    }

    #[test]
    fn test_user_handler_renders_structured_records() {
        let batch = batch(vec![
            DecodedValue::Structured(user_value("User_1")),
            DecodedValue::Structured(user_value("User_2")),
        ]);
        assert_eq!(
            UserHandler.render(&batch).unwrap(),
            vec![user_json("User_1"), user_json("User_2")]
        );

        let text = batch_of_text("User_1");
        assert!(UserHandler.render(&text).is_err());
    }

    fn batch_of_text(text: &str) -> EventBatch {
        batch(vec![DecodedValue::Text(text.to_string())])
    }

    #[test]
    fn test_user_as_string_handler() {
        assert_eq!(
            UserAsStringHandler.render(&batch_of_text("User_1")).unwrap(),
            vec!["Users from string: User_1"]
        );

        let structured = batch(vec![DecodedValue::Structured(user_value("User_5"))]);
        let lines = UserAsStringHandler.render(&structured).unwrap();
        let json = lines[0].strip_prefix("Users from string: ").unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(json).unwrap(),
            serde_json::from_str::<serde_json::Value>(&user_json("User_5")).unwrap()
        );

        let bytes = batch(vec![DecodedValue::Bytes(Bytes::from_static(b"User_1"))]);
        assert!(UserAsStringHandler.render(&bytes).is_err());
    }

    #[tokio::test]
    async fn test_user_as_bytes_handler_decodes_each_value() {
        let handler = UserAsBytesHandler::new(user_deserializer());
        let batch = batch(vec![
            DecodedValue::Bytes(framed_user("User_1")),
            DecodedValue::Bytes(framed_user("User_2")),
        ]);
        assert_eq!(
            handler.render(&batch).await.unwrap(),
            vec![
                format!("Custom deserialised user from batch: {}", user_json("User_1")),
                format!("Custom deserialised user from batch: {}", user_json("User_2")),
            ]
        );

        let malformed = batch_of_bytes(b"\x00\x00");
        assert!(handler.handle(&malformed).await.is_ok());
        assert_eq!(handler.skipped(), 1);
    }

    #[tokio::test]
    async fn test_user_as_bytes_handler_skips_only_bad_records() {
        let handler = UserAsBytesHandler::new(user_deserializer());
        let truncated = framed_user("User_2");
        let batch = batch(vec![
            DecodedValue::Bytes(framed_user("User_1")),
            DecodedValue::Bytes(Bytes::from_static(b"\x07not avro")),
            DecodedValue::Bytes(truncated.slice(..truncated.len() - 3)),
            DecodedValue::Bytes(framed_user("User_3")),
        ]);

        assert_eq!(
            handler.render(&batch).await.unwrap(),
            vec![
                format!("Custom deserialised user from batch: {}", user_json("User_1")),
                format!("Custom deserialised user from batch: {}", user_json("User_3")),
            ]
        );
        assert_eq!(handler.skipped(), 2);
    }

    fn batch_of_bytes(value: &'static [u8]) -> EventBatch {
        batch(vec![DecodedValue::Bytes(Bytes::from_static(value))])
    }

    #[tokio::test]
    async fn test_user_as_byte_handler_takes_one_event() {
        let handler = UserAsByteHandler::new(user_deserializer());
        let single = batch(vec![DecodedValue::Bytes(framed_user("User_7"))]);
        assert_eq!(
            handler.render(&single).await.unwrap(),
            Some(format!("Custom deserialised user: {}", user_json("User_7")))
        );

        let malformed = batch_of_bytes(b"\x00\x00");
        assert_eq!(handler.render(&malformed).await.unwrap(), None);
        assert!(handler.handle(&malformed).await.is_ok());
        assert_eq!(handler.skipped(), 2);

        let two = batch(vec![
            DecodedValue::Bytes(framed_user("User_1")),
            DecodedValue::Bytes(framed_user("User_2")),
        ]);
        let err = handler.render(&two).await.unwrap_err();
        assert_eq!(err.to_string(), "expected a single event, got 2");
    }

    #[test]
    fn test_page_views_female_handler() {
        let value = AvroValue::Record(vec![
            ("USERID".to_string(), AvroValue::String("User_3".to_string())),
            ("PAGEID".to_string(), AvroValue::String("Page_42".to_string())),
            ("REGIONID".to_string(), AvroValue::String("Region_1".to_string())),
            ("GENDER".to_string(), AvroValue::String("FEMALE".to_string())),
        ]);
        let batch = batch(vec![DecodedValue::Structured(value)]);
        assert_eq!(
            PageViewsFemaleHandler.render(&batch).unwrap(),
            vec![r#"{"USERID":"User_3","PAGEID":"Page_42","REGIONID":"Region_1","GENDER":"FEMALE"}"#]
        );
    }
}
