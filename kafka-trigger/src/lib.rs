//! Kafka trigger runtime.
//!
//! Binds handlers to topics through consumer groups: partitions are fetched
//! over the Fetch wire protocol, record values are decoded (Avro with schema
//! framing, plain text or raw bytes) and delivered in batches with
//! at-least-once semantics. Offsets are committed only after a handler
//! succeeds.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types that implement `std::error::Error` with
//! a cause chain, use formats that include the full chain so root causes are visible in logs:
//!
//! - **Inline format:** `{e:#}`, full chain on one line (`outer: middle: root cause`).
//! - **Structured field:** `error = ?e`, full chain with `Caused by:` sections (Debug).
//!
//! When constructing errors, use `.context()` / `.with_context()` so the original error remains
//! the source.

pub mod backoff;
pub mod codec;
pub mod consumer;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod fetcher;
pub mod host;
pub mod metrics_const;
pub mod schema;
pub mod test_utils;
pub mod types;

pub use consumer::{ConsumerConfig, TriggerConsumer};
pub use coordinator::{CoordinatorConfig, GroupCoordinator, InMemoryOffsetStore, OffsetStore};
pub use dispatch::{
    DeadLetter, DeadLetterSink, DeliveryConfig, DeliveryStyle, EventBatch, TriggerBinding,
    TriggerEvent, TriggerHandler,
};
pub use error::TriggerError;
pub use fetcher::{FetchConfig, TcpConnector};
pub use host::{HostConfig, RunningHost, TriggerHost};
pub use schema::{AvroDeserializer, DecodedValue, DecodingMode, SchemaResolver};
pub use types::{Partition, PartitionAssignment};
