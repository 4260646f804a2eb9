use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::transport::{BrokerConnection, Connector, TransportError};
use super::{FetchConfig, FetchError, FetchedBatch, FetcherState};
use crate::codec::{decode_fetch_response, encode_fetch_request, error_code, FetchRequest, RecordBatch};
use crate::metrics_const::{
    BATCHES_RECEIVED_COUNTER, CONTROL_RECORDS_SKIPPED_COUNTER, FETCHERS_FAILED_COUNTER,
    FETCH_DURATION_HISTOGRAM, FETCH_ERRORS_COUNTER, RECORDS_RECEIVED_COUNTER,
};
use crate::types::Partition;

enum AttemptError {
    Transient {
        reason: &'static str,
        detail: String,
    },
    Fatal(String),
}

fn transient(reason: &'static str, detail: impl fmt::Display) -> AttemptError {
    AttemptError::Transient {
        reason,
        detail: detail.to_string(),
    }
}

/// Pulls record batches for one partition and holds each one until it is
/// acknowledged.
///
/// `poll` is cancel safe: if it is dropped mid round trip the connection is
/// discarded on the next call, and a dropped backoff sleep is resumed.
pub struct PartitionFetcher {
    partition: Partition,
    connector: Arc<dyn Connector>,
    config: FetchConfig,
    connection: Option<Box<dyn BrokerConnection>>,
    state: FetcherState,
    next_offset: i64,
    pending: Option<FetchedBatch>,
    next_sequence: u64,
    correlation_id: i32,
    consecutive_failures: u32,
    retry_at: Option<Instant>,
    failure: Option<FetchError>,
}

impl PartitionFetcher {
    pub fn start(
        partition: Partition,
        initial_offset: i64,
        connector: Arc<dyn Connector>,
        config: FetchConfig,
    ) -> Self {
        info!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            offset = initial_offset,
            "Starting partition fetcher"
        );

        Self {
            partition,
            connector,
            config,
            connection: None,
            state: FetcherState::Idle,
            next_offset: initial_offset,
            pending: None,
            next_sequence: 0,
            correlation_id: 0,
            consecutive_failures: 0,
            retry_at: None,
            failure: None,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub fn state(&self) -> FetcherState {
        self.state
    }

    pub fn next_offset(&self) -> i64 {
        self.next_offset
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn pending(&self) -> Option<&FetchedBatch> {
        self.pending.as_ref()
    }

    /// Fetch the next batch, or hand out the unacknowledged one again.
    ///
    /// Returns `Ok(None)` when the broker had nothing new, while backing off
    /// after a transient failure, and once stopped.
    pub async fn poll(
        &mut self,
        max_wait: Duration,
        max_bytes: i32,
    ) -> Result<Option<FetchedBatch>, FetchError> {
        match self.state {
            FetcherState::Stopped => return Ok(None),
            FetcherState::Failed => return Err(self.failure_error()),
            FetcherState::Ready => {
                if let Some(batch) = self.pending.as_mut() {
                    batch.delivery_count += 1;
                    debug!(
                        topic = self.partition.topic(),
                        partition = self.partition.partition_number(),
                        sequence = batch.sequence,
                        delivery_count = batch.delivery_count,
                        "Redelivering unacknowledged batch"
                    );
                    return Ok(Some(batch.clone()));
                }
            }
            FetcherState::Fetching => {
                // A previous poll was dropped mid round trip; its response may
                // still be in flight on this connection.
                self.connection = None;
            }
            FetcherState::Reconnecting => {
                if let Some(retry_at) = self.retry_at {
                    tokio::time::sleep_until(retry_at).await;
                    self.retry_at = None;
                }
            }
            FetcherState::Idle => {}
        }

        self.state = FetcherState::Fetching;
        let started = Instant::now();

        match self.fetch_once(max_wait, max_bytes).await {
            Ok(batch) => {
                histogram!(FETCH_DURATION_HISTOGRAM).record(started.elapsed().as_secs_f64());
                if self.consecutive_failures > 0 {
                    info!(
                        topic = self.partition.topic(),
                        partition = self.partition.partition_number(),
                        failures = self.consecutive_failures,
                        "Fetcher recovered"
                    );
                    self.consecutive_failures = 0;
                }

                let Some(batch) = batch else {
                    self.state = FetcherState::Idle;
                    return Ok(None);
                };

                counter!(BATCHES_RECEIVED_COUNTER).increment(1);
                counter!(RECORDS_RECEIVED_COUNTER).increment(batch.len() as u64);
                debug!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition_number(),
                    first_offset = batch.first_offset(),
                    last_offset = batch.last_offset,
                    records = batch.len(),
                    "Fetched batch"
                );

                self.pending = Some(batch.clone());
                self.state = FetcherState::Ready;
                Ok(Some(batch))
            }
            Err(AttemptError::Fatal(detail)) => {
                counter!(FETCH_ERRORS_COUNTER, "reason" => "fatal").increment(1);
                self.consecutive_failures += 1;
                Err(self.fail(detail))
            }
            Err(AttemptError::Transient { reason, detail }) => {
                counter!(FETCH_ERRORS_COUNTER, "reason" => reason).increment(1);
                self.connection = None;
                self.consecutive_failures += 1;

                if self.consecutive_failures >= self.config.max_consecutive_failures {
                    return Err(self.fail(detail));
                }

                let delay = self.config.backoff.delay_for(self.consecutive_failures - 1);
                warn!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition_number(),
                    attempt = self.consecutive_failures,
                    delay_ms = delay.as_millis() as u64,
                    error = detail.as_str(),
                    "Fetch failed, reconnecting"
                );
                self.retry_at = Some(Instant::now() + delay);
                self.state = FetcherState::Reconnecting;
                Ok(None)
            }
        }
    }

    /// Release the pending batch. Only the batch last returned by `poll` can
    /// be acknowledged.
    pub fn ack(&mut self, batch: &FetchedBatch) -> Result<(), FetchError> {
        match &self.pending {
            Some(pending) if pending.sequence == batch.sequence => {
                self.pending = None;
                if self.state == FetcherState::Ready {
                    self.state = FetcherState::Idle;
                }
                Ok(())
            }
            _ => Err(FetchError::UnknownBatch {
                partition: self.partition.clone(),
                sequence: batch.sequence,
            }),
        }
    }

    /// Stop fetching. An unacknowledged batch is dropped; whoever owns the
    /// partition next fetches it again from the committed offset.
    pub fn stop(&mut self) {
        if self.state == FetcherState::Stopped {
            return;
        }
        if let Some(pending) = self.pending.take() {
            debug!(
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                sequence = pending.sequence,
                "Dropping unacknowledged batch on stop"
            );
        }
        self.connection = None;
        self.retry_at = None;
        self.state = FetcherState::Stopped;
        info!(
            topic = self.partition.topic(),
            partition = self.partition.partition_number(),
            next_offset = self.next_offset,
            "Stopped partition fetcher"
        );
    }

    fn fail(&mut self, detail: String) -> FetchError {
        let failure = FetchError::FetcherFailed {
            partition: self.partition.clone(),
            attempts: self.consecutive_failures,
            last_error: detail,
        };
        error!(
            topic = self.partition.topic(),
            partition = self.partition.partition_number(),
            error = %failure,
            "Partition fetcher failed"
        );
        counter!(FETCHERS_FAILED_COUNTER).increment(1);

        self.connection = None;
        self.state = FetcherState::Failed;
        self.failure = Some(failure.clone());
        failure
    }

    fn failure_error(&self) -> FetchError {
        self.failure
            .clone()
            .unwrap_or_else(|| FetchError::FetcherFailed {
                partition: self.partition.clone(),
                attempts: self.consecutive_failures,
                last_error: "fetcher failed".to_string(),
            })
    }

    async fn fetch_once(
        &mut self,
        max_wait: Duration,
        max_bytes: i32,
    ) -> Result<Option<FetchedBatch>, AttemptError> {
        let mut connection = match self.connection.take() {
            Some(connection) => connection,
            None => self
                .connector
                .connect(&self.partition)
                .await
                .map_err(|e| transient("transport", e))?,
        };

        self.correlation_id = self.correlation_id.wrapping_add(1);
        let request = FetchRequest::new(self.partition.clone(), self.next_offset)
            .with_correlation_id(self.correlation_id)
            .with_client_id(self.config.client_id.clone())
            .with_max_wait(max_wait)
            .with_min_bytes(self.config.min_bytes)
            .with_max_bytes(max_bytes);

        let timeout = max_wait + self.config.request_timeout;
        let raw = tokio::time::timeout(timeout, connection.round_trip(encode_fetch_request(&request)))
            .await
            .map_err(|_| transient("transport", TransportError::Timeout(timeout)))?
            .map_err(|e| transient("transport", e))?;

        let response = decode_fetch_response(&raw).map_err(|e| transient("codec", e))?;
        if response.correlation_id != request.correlation_id {
            return Err(transient(
                "codec",
                format!(
                    "correlation id {} does not match request {}",
                    response.correlation_id, request.correlation_id
                ),
            ));
        }

        let data = response
            .partition(&self.partition)
            .ok_or_else(|| transient("broker", "response has no data for the partition"))?;
        match data.error_code {
            error_code::NONE => {}
            error_code::OFFSET_OUT_OF_RANGE => {
                return Err(AttemptError::Fatal(format!(
                    "offset {} is out of range (high watermark {})",
                    self.next_offset, data.high_watermark
                )))
            }
            code => {
                return Err(transient("broker", format!("broker returned error code {code}")))
            }
        }

        let batches = data
            .batches_with_limit(self.config.decompression_limit(max_bytes))
            .map_err(|e| transient("codec", e))?;
        let high_watermark = data.high_watermark;
        self.connection = Some(connection);

        Ok(self.collect(batches, high_watermark))
    }

    /// Flatten decoded batches into one `FetchedBatch`, dropping records below
    /// the fetch offset and control records, and advance `next_offset`.
    fn collect(&mut self, batches: Vec<RecordBatch>, high_watermark: i64) -> Option<FetchedBatch> {
        let fetch_offset = self.next_offset;
        let mut records = Vec::new();
        let mut last_offset = None;
        let mut control_records = 0u64;

        for batch in batches {
            self.next_offset = self.next_offset.max(batch.last_offset() + 1);
            let is_control = batch.is_control();

            for record in batch.records {
                if record.offset < fetch_offset {
                    continue;
                }
                last_offset = Some(record.offset);
                if is_control {
                    control_records += 1;
                } else {
                    records.push(record);
                }
            }
        }

        if control_records > 0 {
            counter!(CONTROL_RECORDS_SKIPPED_COUNTER).increment(control_records);
        }
        if records.is_empty() {
            return None;
        }

        self.next_sequence += 1;
        Some(FetchedBatch {
            partition: self.partition.clone(),
            sequence: self.next_sequence,
            delivery_count: 1,
            records,
            last_offset: last_offset.unwrap_or(fetch_offset),
            high_watermark,
        })
    }
}
