use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;

use super::EventBatch;
use crate::schema::SchemaError;
use crate::types::Partition;

/// User callback bound to a topic and consumer group.
///
/// An `Err` is retried with the same batch; offsets are committed only after
/// `Ok`. Handlers must tolerate seeing a batch more than once.
#[async_trait]
pub trait TriggerHandler: Send + Sync {
    async fn handle(&self, batch: &EventBatch) -> anyhow::Result<()>;
}

/// A record whose value could not be decoded, with the raw bytes it carried.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub binding: String,
    pub partition: Partition,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub error: SchemaError,
}

/// Receives records that were dropped from delivery because they failed to
/// decode. The batch is committed regardless of what the sink does.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, letter: DeadLetter) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LoggingDeadLetterSink {
    async fn send(&self, letter: DeadLetter) -> anyhow::Result<()> {
        warn!(
            binding = letter.binding.as_str(),
            topic = letter.partition.topic(),
            partition = letter.partition.partition_number(),
            offset = letter.offset,
            value_len = letter.value.as_ref().map_or(0, |value| value.len()),
            error = %letter.error,
            "Dropped undecodable record"
        );
        Ok(())
    }
}
