//! Per-partition fetch state machine.

pub mod partition_fetcher;
pub mod transport;

use std::time::Duration;

use thiserror::Error;

use crate::backoff::BackoffPolicy;
use crate::codec::{Record, DEFAULT_MAX_DECOMPRESSED_BYTES};
use crate::types::Partition;

pub use partition_fetcher::PartitionFetcher;
pub use transport::{BrokerConnection, Connector, TcpConnector, TransportError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Fatal for the partition; the fetcher stays `Failed`.
    #[error("fetcher for {partition} failed after {attempts} consecutive attempts: {last_error}")]
    FetcherFailed {
        partition: Partition,
        attempts: u32,
        last_error: String,
    },

    #[error("batch {sequence} is not the pending batch of {partition}")]
    UnknownBatch { partition: Partition, sequence: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetcherState {
    Idle,
    Fetching,
    /// Holding a batch that has not been acknowledged yet
    Ready,
    Reconnecting,
    Failed,
    Stopped,
}

/// Records returned by one fetch, in offset order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedBatch {
    pub partition: Partition,
    /// Identifies the batch for `ack`; unique per fetcher
    pub sequence: u64,
    /// 1 on first delivery, incremented every time `poll` hands it out again
    pub delivery_count: u32,
    pub records: Vec<Record>,
    /// Offset of the last record in the batch, including skipped control records
    pub last_offset: i64,
    pub high_watermark: i64,
}

impl FetchedBatch {
    pub fn first_offset(&self) -> Option<i64> {
        self.records.first().map(|r| r.offset)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records still behind the broker's high watermark after this batch.
    pub fn lag(&self) -> i64 {
        (self.high_watermark - self.last_offset - 1).max(0)
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub client_id: String,
    pub max_wait: Duration,
    pub min_bytes: i32,
    pub max_bytes: i32,
    /// Cap on one batch's decompressed records block; never below `max_bytes`
    pub max_decompressed_bytes: usize,
    /// Added to `max_wait` to bound a single round trip
    pub request_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub max_consecutive_failures: u32,
    /// Where to start on partitions without a committed offset
    pub default_start_offset: i64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            client_id: "kafka-trigger".to_string(),
            max_wait: Duration::from_millis(500),
            min_bytes: 1,
            max_bytes: 1024 * 1024,
            max_decompressed_bytes: DEFAULT_MAX_DECOMPRESSED_BYTES,
            request_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
            max_consecutive_failures: 10,
            default_start_offset: 0,
        }
    }
}

impl FetchConfig {
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: i32) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_max_decompressed_bytes(mut self, max_decompressed_bytes: usize) -> Self {
        self.max_decompressed_bytes = max_decompressed_bytes;
        self
    }

    /// Decompression limit for a response fetched with `max_bytes`.
    pub fn decompression_limit(&self, max_bytes: i32) -> usize {
        self.max_decompressed_bytes.max(max_bytes.max(0) as usize)
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_consecutive_failures(mut self, max_consecutive_failures: u32) -> Self {
        self.max_consecutive_failures = max_consecutive_failures.max(1);
        self
    }

    pub fn with_default_start_offset(mut self, default_start_offset: i64) -> Self {
        self.default_start_offset = default_start_offset;
        self
    }
}
