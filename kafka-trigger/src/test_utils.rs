//! Shared test utilities for the kafka-trigger crate.
//!
//! `InMemoryBroker` answers Fetch v4 requests over the real wire format, so the
//! fetcher, dispatch loops and host can be exercised without a Kafka cluster.
//! The handler fakes record what they were given for assertions.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::codec::{
    decode_fetch_request, encode_batch, encode_fetch_response, error_code, FetchResponse,
    PartitionData, Record, RecordBatch,
};
use crate::dispatch::{DeadLetter, DeadLetterSink, EventBatch, TriggerHandler};
use crate::fetcher::{BrokerConnection, Connector, TransportError};
use crate::types::Partition;

/// Longest a fetch for an empty partition is parked before answering.
const MAX_EMPTY_FETCH_WAIT: Duration = Duration::from_millis(10);

#[derive(Default)]
struct PartitionLog {
    /// (base offset, last offset, encoded batch)
    batches: Vec<(i64, i64, Bytes)>,
    high_watermark: i64,
    injected_errors: VecDeque<i16>,
}

#[derive(Default)]
struct BrokerState {
    logs: Mutex<HashMap<Partition, PartitionLog>>,
    failing_connects: AtomicU32,
    failing_round_trips: AtomicU32,
    connects: AtomicUsize,
    fetches: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append values at the end of the partition log as one batch and return
    /// the offset of the last one.
    pub fn produce<V: Into<Bytes>>(
        &self,
        partition: &Partition,
        values: impl IntoIterator<Item = V>,
    ) -> i64 {
        let start = self.high_watermark(partition);
        let records = values
            .into_iter()
            .enumerate()
            .map(|(i, value)| Record::new(start + i as i64, value).with_timestamp(1_700_000_000_000))
            .collect();
        self.append_batch(partition, RecordBatch::new(records))
    }

    /// Append a prepared batch, which must start at or after the log end.
    pub fn append_batch(&self, partition: &Partition, batch: RecordBatch) -> i64 {
        let last_offset = batch.last_offset();
        let encoded = match encode_batch(&batch) {
            Ok(encoded) => encoded,
            Err(e) => panic!("test batch does not encode: {e}"),
        };

        let mut logs = self.lock_logs();
        let log = logs.entry(partition.clone()).or_default();
        assert!(
            batch.base_offset >= log.high_watermark,
            "batch at {} overlaps log end {}",
            batch.base_offset,
            log.high_watermark
        );
        log.batches.push((batch.base_offset, last_offset, encoded));
        log.high_watermark = last_offset + 1;
        last_offset
    }

    pub fn high_watermark(&self, partition: &Partition) -> i64 {
        self.lock_logs()
            .get(partition)
            .map(|log| log.high_watermark)
            .unwrap_or(0)
    }

    /// The next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.state.failing_connects.store(count, Ordering::SeqCst);
    }

    /// The next `count` round trips on any connection fail as if the broker hung up.
    pub fn fail_next_round_trips(&self, count: u32) {
        self.state.failing_round_trips.store(count, Ordering::SeqCst);
    }

    /// The next fetch for `partition` is answered with `code` instead of data.
    pub fn inject_error(&self, partition: &Partition, code: i16) {
        self.lock_logs()
            .entry(partition.clone())
            .or_default()
            .injected_errors
            .push_back(code);
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> usize {
        self.state.fetches.load(Ordering::SeqCst)
    }

    fn lock_logs(&self) -> std::sync::MutexGuard<'_, HashMap<Partition, PartitionLog>> {
        self.state.logs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(
        &self,
        _partition: &Partition,
    ) -> Result<Box<dyn BrokerConnection>, TransportError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.state.failing_connects) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "injected connect failure",
            )));
        }
        Ok(Box::new(InMemoryConnection {
            broker: self.clone(),
        }))
    }
}

struct InMemoryConnection {
    broker: InMemoryBroker,
}

impl InMemoryConnection {
    fn answer(&self, request: &crate::codec::FetchRequest) -> Option<PartitionData> {
        let partition = &request.partition;
        let mut logs = self.broker.lock_logs();
        let log = logs.entry(partition.clone()).or_default();

        if let Some(code) = log.injected_errors.pop_front() {
            return Some(PartitionData::error(partition.clone(), code));
        }
        if request.fetch_offset > log.high_watermark || request.fetch_offset < 0 {
            return Some(PartitionData::error(
                partition.clone(),
                error_code::OFFSET_OUT_OF_RANGE,
            ));
        }

        // The first batch is always returned whole; later ones are cut at
        // max_bytes like a real broker does.
        let limit = request.max_bytes.max(0) as usize;
        let mut records = BytesMut::new();
        for (_, last_offset, encoded) in &log.batches {
            if *last_offset < request.fetch_offset {
                continue;
            }
            if records.is_empty() || records.len() + encoded.len() <= limit {
                records.extend_from_slice(encoded);
            } else {
                let room = limit.saturating_sub(records.len());
                records.extend_from_slice(&encoded[..room.min(encoded.len())]);
                break;
            }
        }

        if records.is_empty() {
            return None;
        }
        Some(PartitionData::new(
            partition.clone(),
            log.high_watermark,
            records.freeze(),
        ))
    }
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn round_trip(&mut self, request: Bytes) -> Result<Bytes, TransportError> {
        if take_failure(&self.broker.state.failing_round_trips) {
            return Err(TransportError::Closed);
        }
        let request = decode_fetch_request(&request).map_err(|e| {
            TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        self.broker.state.fetches.fetch_add(1, Ordering::SeqCst);

        let data = match self.answer(&request) {
            Some(data) => data,
            None => {
                let wait = Duration::from_millis(request.max_wait_ms.max(0) as u64);
                tokio::time::sleep(wait.min(MAX_EMPTY_FETCH_WAIT)).await;
                self.answer(&request).unwrap_or_else(|| {
                    PartitionData::new(
                        request.partition.clone(),
                        self.broker.high_watermark(&request.partition),
                        Bytes::new(),
                    )
                })
            }
        };

        Ok(encode_fetch_response(&FetchResponse {
            correlation_id: request.correlation_id,
            throttle_time_ms: 0,
            partitions: vec![data],
        }))
    }
}

/// Handler that records every batch it sees. Invocations listed in
/// `failing_on` (1-based) return an error instead.
#[derive(Default)]
pub struct RecordingHandler {
    invocations: AtomicU32,
    failing: Vec<u32>,
    delay: Duration,
    received: Mutex<Vec<EventBatch>>,
    delivered: Mutex<Vec<EventBatch>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(mut self, invocations: &[u32]) -> Self {
        self.failing = invocations.to_vec();
        self
    }

    /// Sleep this long inside every invocation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Every batch handed to the handler, failed invocations included.
    pub fn batches(&self) -> Vec<EventBatch> {
        self.received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Batches the handler returned `Ok` for.
    pub fn delivered(&self) -> Vec<EventBatch> {
        self.delivered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn offsets(&self) -> Vec<i64> {
        self.delivered().iter().flat_map(EventBatch::offsets).collect()
    }

    pub fn texts(&self) -> Vec<String> {
        self.delivered()
            .iter()
            .flat_map(|batch| batch.events.clone())
            .filter_map(|event| event.value.as_text().map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl TriggerHandler for RecordingHandler {
    async fn handle(&self, batch: &EventBatch) -> anyhow::Result<()> {
        let invocation = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
        self.received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(batch.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.contains(&invocation) {
            anyhow::bail!("Simulated handler error on invocation {invocation}");
        }

        self.delivered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(batch.clone());
        Ok(())
    }
}

/// Handler that fails a configurable number of times before succeeding.
pub struct FailingHandler {
    fail_count: AtomicU32,
    max_failures: u32,
    processed_after_failures: AtomicUsize,
}

impl FailingHandler {
    pub fn new(max_failures: u32) -> Self {
        Self {
            fail_count: AtomicU32::new(0),
            max_failures,
            processed_after_failures: AtomicUsize::new(0),
        }
    }

    pub fn invocations(&self) -> u32 {
        self.fail_count.load(Ordering::SeqCst)
    }

    pub fn processed(&self) -> usize {
        self.processed_after_failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TriggerHandler for FailingHandler {
    async fn handle(&self, batch: &EventBatch) -> anyhow::Result<()> {
        let count = self.fail_count.fetch_add(1, Ordering::SeqCst);
        if count < self.max_failures {
            Err(anyhow::anyhow!("Simulated handler error {}", count + 1))
        } else {
            self.processed_after_failures
                .fetch_add(batch.len(), Ordering::SeqCst);
            Ok(())
        }
    }
}

#[derive(Default)]
pub struct RecordingDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
}

impl RecordingDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl DeadLetterSink for RecordingDeadLetterSink {
    async fn send(&self, letter: DeadLetter) -> anyhow::Result<()> {
        self.letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(letter);
        Ok(())
    }
}
