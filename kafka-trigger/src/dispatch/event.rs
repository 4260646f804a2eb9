use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::codec::{Record, RecordHeader};
use crate::schema::{DecodedValue, SchemaError};
use crate::types::Partition;

/// One decoded record as seen by a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerEvent {
    pub offset: i64,
    pub key: Option<Bytes>,
    /// Milliseconds since the epoch, as written by the producer
    pub timestamp: i64,
    pub headers: Vec<RecordHeader>,
    pub value: DecodedValue,
}

impl TriggerEvent {
    pub fn from_record(record: &Record, value: DecodedValue) -> Self {
        Self {
            offset: record.offset,
            key: record.key.clone(),
            timestamp: record.timestamp,
            headers: record.headers.clone(),
            value,
        }
    }

    pub fn key_str(&self) -> Option<&str> {
        self.key
            .as_deref()
            .and_then(|key| std::str::from_utf8(key).ok())
    }

    pub fn header(&self, key: &str) -> Option<&Bytes> {
        self.headers
            .iter()
            .find(|header| header.key == key)
            .and_then(|header| header.value.as_ref())
    }

    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, SchemaError> {
        self.value.deserialize()
    }
}

/// Events of one partition in offset order, handed to a handler in a single
/// invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct EventBatch {
    pub binding: String,
    pub partition: Partition,
    pub events: Vec<TriggerEvent>,
}

impl EventBatch {
    pub fn new(binding: impl Into<String>, partition: Partition, events: Vec<TriggerEvent>) -> Self {
        Self {
            binding: binding.into(),
            partition,
            events,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TriggerEvent> {
        self.events.iter()
    }

    pub fn offsets(&self) -> Vec<i64> {
        self.events.iter().map(|event| event.offset).collect()
    }

    pub fn first_offset(&self) -> Option<i64> {
        self.events.first().map(|event| event.offset)
    }

    pub fn last_offset(&self) -> Option<i64> {
        self.events.last().map(|event| event.offset)
    }

    /// Split into one batch per event.
    pub fn singles(&self) -> impl Iterator<Item = EventBatch> + '_ {
        self.events.iter().map(|event| EventBatch {
            binding: self.binding.clone(),
            partition: self.partition.clone(),
            events: vec![event.clone()],
        })
    }
}

impl<'a> IntoIterator for &'a EventBatch {
    type Item = &'a TriggerEvent;
    type IntoIter = std::slice::Iter<'a, TriggerEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}
