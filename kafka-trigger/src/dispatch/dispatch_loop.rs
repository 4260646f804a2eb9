use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    DeadLetter, DeliveryConfig, DeliveryError, DeliveryStyle, EventBatch, PartitionOutcome,
    PartitionReport, TriggerBinding, TriggerEvent, TriggerHandler,
};
use crate::coordinator::OffsetCommitter;
use crate::error::TriggerError;
use crate::fetcher::{FetchedBatch, PartitionFetcher};
use crate::metrics_const::{
    BATCH_SIZE_HISTOGRAM, DECODE_FAILURES_COUNTER, DELIVERY_ATTEMPTS_COUNTER,
    DELIVERY_FAILURES_COUNTER, HANDLER_DURATION_HISTOGRAM,
};
use crate::schema::SchemaResolver;
use crate::types::Partition;

/// Decoded form of the batch currently held by the fetcher.
struct DecodedBatch {
    sequence: u64,
    events: EventBatch,
    /// Events already acknowledged by the handler in single-record style
    delivered: usize,
}

enum Delivery {
    Committed,
    /// The handler failed; the fetcher hands the same batch out again
    Retry,
    Interrupted,
}

/// Drives one assigned partition: poll, decode, invoke the handler, commit.
///
/// At most one batch is in flight. The fetcher keeps a batch until it is
/// acknowledged, which only happens after its offset is committed, so a
/// handler failure or a crash before the commit means the batch is seen again.
pub struct DispatchLoop {
    binding: Arc<TriggerBinding>,
    fetcher: PartitionFetcher,
    resolver: Arc<SchemaResolver>,
    committer: Arc<dyn OffsetCommitter>,
    config: DeliveryConfig,
    decoded: Option<DecodedBatch>,
    committed: Option<i64>,
}

impl DispatchLoop {
    pub fn new(
        binding: Arc<TriggerBinding>,
        fetcher: PartitionFetcher,
        resolver: Arc<SchemaResolver>,
        committer: Arc<dyn OffsetCommitter>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            binding,
            fetcher,
            resolver,
            committer,
            config,
            decoded: None,
            committed: None,
        }
    }

    pub fn partition(&self) -> &Partition {
        self.fetcher.partition()
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<PartitionReport> {
        tokio::spawn(self.run(shutdown))
    }

    /// Run until `shutdown` fires or the partition halts. A handler invocation
    /// in progress when `shutdown` fires is awaited and its batch committed.
    pub async fn run(mut self, shutdown: CancellationToken) -> PartitionReport {
        let partition = self.fetcher.partition().clone();
        info!(
            binding = self.binding.name(),
            topic = partition.topic(),
            partition = partition.partition_number(),
            offset = self.fetcher.next_offset(),
            "Starting dispatch loop"
        );

        let max_wait = self.fetcher.config().max_wait;
        let max_bytes = self.fetcher.config().max_bytes;

        let outcome = loop {
            let polled = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break PartitionOutcome::Stopped,
                polled = self.fetcher.poll(max_wait, max_bytes) => polled,
            };

            let batch = match polled {
                Ok(Some(batch)) => batch,
                Ok(None) => continue,
                Err(e) => break PartitionOutcome::Halted(e.into()),
            };

            match self.deliver(&batch, &shutdown).await {
                Ok(Delivery::Committed | Delivery::Retry) => {}
                Ok(Delivery::Interrupted) => break PartitionOutcome::Stopped,
                Err(e) => break PartitionOutcome::Halted(e),
            }
        };

        self.fetcher.stop();
        match &outcome {
            PartitionOutcome::Stopped => info!(
                binding = self.binding.name(),
                topic = partition.topic(),
                partition = partition.partition_number(),
                committed = self.committed,
                "Dispatch loop stopped"
            ),
            PartitionOutcome::Halted(e) => {
                error!(
                    binding = self.binding.name(),
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    committed = self.committed,
                    error = %e,
                    "Partition halted, no further records will be delivered until it is revoked"
                );
            }
        }

        PartitionReport {
            binding: self.binding.name().to_string(),
            partition,
            committed: self.committed,
            outcome,
        }
    }

    async fn deliver(
        &mut self,
        batch: &FetchedBatch,
        shutdown: &CancellationToken,
    ) -> Result<Delivery, TriggerError> {
        let attempt = batch.delivery_count;
        if self.decoded.as_ref().map(|d| d.sequence) != Some(batch.sequence) {
            let events = self.decode(batch).await;
            self.decoded = Some(DecodedBatch {
                sequence: batch.sequence,
                events,
                delivered: 0,
            });
        }

        match self.invoke().await {
            Ok(()) => {
                self.committer
                    .commit(&batch.partition, batch.last_offset)
                    .await?;
                self.fetcher.ack(batch)?;
                self.decoded = None;
                self.committed = Some(batch.last_offset);
                debug!(
                    binding = self.binding.name(),
                    topic = batch.partition.topic(),
                    partition = batch.partition.partition_number(),
                    offset = batch.last_offset,
                    lag = batch.lag(),
                    "Batch delivered and committed"
                );
                Ok(Delivery::Committed)
            }
            Err(e) if attempt >= self.config.max_attempts => {
                counter!(DELIVERY_FAILURES_COUNTER, "binding" => self.binding.name().to_string())
                    .increment(1);
                self.decoded = None;
                let failure = DeliveryError::DeliveryFailed {
                    partition: batch.partition.clone(),
                    first_offset: batch.first_offset().unwrap_or(batch.last_offset),
                    last_offset: batch.last_offset,
                    attempts: attempt,
                    last_error: format!("{e:#}"),
                };
                Err(failure.into())
            }
            Err(e) => {
                warn!(
                    binding = self.binding.name(),
                    topic = batch.partition.topic(),
                    partition = batch.partition.partition_number(),
                    attempt,
                    max_attempts = self.config.max_attempts,
                    error = ?e,
                    "Handler failed, batch will be redelivered"
                );
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => Ok(Delivery::Interrupted),
                    _ = tokio::time::sleep(self.config.retry_delay) => Ok(Delivery::Retry),
                }
            }
        }
    }

    /// Decode every record value. Records that fail are dead-lettered and left
    /// out; the rest keep their order.
    async fn decode(&self, batch: &FetchedBatch) -> EventBatch {
        let mut events = Vec::with_capacity(batch.len());
        for record in &batch.records {
            match self
                .resolver
                .decode(self.binding.mode(), record.value.as_ref())
                .await
            {
                Ok(value) => events.push(TriggerEvent::from_record(record, value)),
                Err(e) => {
                    counter!(DECODE_FAILURES_COUNTER, "binding" => self.binding.name().to_string())
                        .increment(1);
                    warn!(
                        binding = self.binding.name(),
                        topic = batch.partition.topic(),
                        partition = batch.partition.partition_number(),
                        offset = record.offset,
                        error = %e,
                        "Record could not be decoded"
                    );

                    let letter = DeadLetter {
                        binding: self.binding.name().to_string(),
                        partition: batch.partition.clone(),
                        offset: record.offset,
                        key: record.key.clone(),
                        value: record.value.clone(),
                        error: e,
                    };
                    if let Err(e) = self.binding.dead_letters().send(letter).await {
                        error!(
                            binding = self.binding.name(),
                            offset = record.offset,
                            error = ?e,
                            "Dead letter sink failed"
                        );
                    }
                }
            }
        }
        EventBatch::new(self.binding.name(), batch.partition.clone(), events)
    }

    async fn invoke(&mut self) -> anyhow::Result<()> {
        let Some(decoded) = self.decoded.as_mut() else {
            return Ok(());
        };
        let handler = self.binding.handler();
        let name = self.binding.name();

        match self.binding.style() {
            DeliveryStyle::Batch => {
                if decoded.events.is_empty() {
                    return Ok(());
                }
                invoke_timed(handler.as_ref(), name, &decoded.events).await
            }
            DeliveryStyle::Single => {
                while let Some(event) = decoded.events.events.get(decoded.delivered) {
                    let single = EventBatch::new(
                        name,
                        decoded.events.partition.clone(),
                        vec![event.clone()],
                    );
                    invoke_timed(handler.as_ref(), name, &single).await?;
                    decoded.delivered += 1;
                }
                Ok(())
            }
        }
    }
}

async fn invoke_timed(
    handler: &dyn TriggerHandler,
    binding: &str,
    batch: &EventBatch,
) -> anyhow::Result<()> {
    histogram!(BATCH_SIZE_HISTOGRAM, "binding" => binding.to_string()).record(batch.len() as f64);
    let started = Instant::now();
    let result = handler.handle(batch).await;
    histogram!(HANDLER_DURATION_HISTOGRAM, "binding" => binding.to_string())
        .record(started.elapsed().as_secs_f64());

    let outcome = if result.is_ok() { "success" } else { "failure" };
    counter!(DELIVERY_ATTEMPTS_COUNTER, "binding" => binding.to_string(), "outcome" => outcome)
        .increment(1);
    result
}
