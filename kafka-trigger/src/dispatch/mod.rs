//! Per-partition delivery of decoded batches to trigger handlers.

pub mod binding;
pub mod dispatch_loop;
pub mod event;
pub mod handler;

use std::time::Duration;

use thiserror::Error;

use crate::error::TriggerError;
use crate::types::Partition;

pub use binding::TriggerBinding;
pub use dispatch_loop::DispatchLoop;
pub use event::{EventBatch, TriggerEvent};
pub use handler::{DeadLetter, DeadLetterSink, LoggingDeadLetterSink, TriggerHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryStyle {
    /// The handler sees every decoded record of a fetched batch at once
    #[default]
    Batch,
    /// The handler is invoked once per record; the batch is committed after
    /// the last one succeeds
    Single,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("delivery of offsets {first_offset}..={last_offset} on {partition} failed after {attempts} attempts: {last_error}")]
    DeliveryFailed {
        partition: Partition,
        first_offset: i64,
        last_offset: i64,
        attempts: u32,
        last_error: String,
    },
}

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Handler invocations per batch before the partition is halted
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay: Duration::from_millis(500),
        }
    }
}

impl DeliveryConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }
}

#[derive(Debug)]
pub enum PartitionOutcome {
    /// Stopped on revocation or shutdown
    Stopped,
    /// Intake stopped after a fatal fetch, delivery or commit failure. The
    /// partition stays owned, and idle, until it is revoked. After a fetch or
    /// delivery failure the coordinator also keeps it from being reassigned
    /// until it is resumed.
    Halted(TriggerError),
}

/// How a dispatch loop ended.
#[derive(Debug)]
pub struct PartitionReport {
    pub binding: String,
    pub partition: Partition,
    /// Last offset committed by this loop, if any
    pub committed: Option<i64>,
    pub outcome: PartitionOutcome,
}

impl PartitionReport {
    pub fn is_halted(&self) -> bool {
        matches!(self.outcome, PartitionOutcome::Halted(_))
    }
}
