//! Fetch API v4 request/response bodies (request header v1, response header v0).
//!
//! Messages are encoded without the outer `i32` size prefix; framing belongs to
//! the transport.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use super::record_batch::{decode_record_set, decode_record_set_with_limit, RecordBatch};
use super::wire::{put_nullable_bytes, put_string, WireReader};
use super::CodecError;
use crate::types::Partition;

pub const FETCH_API_KEY: i16 = 1;
pub const FETCH_API_VERSION: i16 = 4;

/// Consumers always send -1; only followers identify themselves.
const CONSUMER_REPLICA_ID: i32 = -1;

pub mod error_code {
    pub const NONE: i16 = 0;
    pub const OFFSET_OUT_OF_RANGE: i16 = 1;
    pub const CORRUPT_MESSAGE: i16 = 2;
    pub const UNKNOWN_TOPIC_OR_PARTITION: i16 = 3;
    pub const LEADER_NOT_AVAILABLE: i16 = 5;
    pub const NOT_LEADER_OR_FOLLOWER: i16 = 6;
    pub const REQUEST_TIMED_OUT: i16 = 7;
}

pub const READ_UNCOMMITTED: i8 = 0;
pub const READ_COMMITTED: i8 = 1;

/// A single-partition fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub correlation_id: i32,
    pub client_id: Option<String>,
    pub partition: Partition,
    pub fetch_offset: i64,
    pub max_wait_ms: i32,
    pub min_bytes: i32,
    pub max_bytes: i32,
    pub isolation_level: i8,
}

impl FetchRequest {
    pub fn new(partition: Partition, fetch_offset: i64) -> Self {
        Self {
            correlation_id: 0,
            client_id: None,
            partition,
            fetch_offset,
            max_wait_ms: 500,
            min_bytes: 1,
            max_bytes: 1024 * 1024,
            isolation_level: READ_UNCOMMITTED,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: i32) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait_ms = i32::try_from(max_wait.as_millis()).unwrap_or(i32::MAX);
        self
    }

    pub fn with_min_bytes(mut self, min_bytes: i32) -> Self {
        self.min_bytes = min_bytes;
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: i32) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortedTransaction {
    pub producer_id: i64,
    pub first_offset: i64,
}

/// Per-partition section of a fetch response. `records` holds the raw record
/// set; a null record set reads as empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionData {
    pub partition: Partition,
    pub error_code: i16,
    pub high_watermark: i64,
    pub last_stable_offset: i64,
    pub aborted_transactions: Vec<AbortedTransaction>,
    pub records: Bytes,
}

impl PartitionData {
    pub fn new(partition: Partition, high_watermark: i64, records: Bytes) -> Self {
        Self {
            partition,
            error_code: error_code::NONE,
            high_watermark,
            last_stable_offset: high_watermark,
            aborted_transactions: Vec::new(),
            records,
        }
    }

    pub fn error(partition: Partition, error_code: i16) -> Self {
        Self {
            partition,
            error_code,
            high_watermark: -1,
            last_stable_offset: -1,
            aborted_transactions: Vec::new(),
            records: Bytes::new(),
        }
    }

    pub fn batches(&self) -> Result<Vec<RecordBatch>, CodecError> {
        decode_record_set(&self.records)
    }

    /// Decode the record set, bounding each batch's decompressed records block.
    pub fn batches_with_limit(
        &self,
        max_decompressed: usize,
    ) -> Result<Vec<RecordBatch>, CodecError> {
        decode_record_set_with_limit(&self.records, max_decompressed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub correlation_id: i32,
    pub throttle_time_ms: i32,
    pub partitions: Vec<PartitionData>,
}

impl FetchResponse {
    pub fn partition(&self, partition: &Partition) -> Option<&PartitionData> {
        self.partitions.iter().find(|p| &p.partition == partition)
    }
}

pub fn encode_fetch_request(request: &FetchRequest) -> Bytes {
    let mut buf = BytesMut::with_capacity(64 + request.partition.topic().len());

    buf.put_i16(FETCH_API_KEY);
    buf.put_i16(FETCH_API_VERSION);
    buf.put_i32(request.correlation_id);
    match &request.client_id {
        Some(client_id) => put_string(&mut buf, client_id),
        None => buf.put_i16(-1),
    }

    buf.put_i32(CONSUMER_REPLICA_ID);
    buf.put_i32(request.max_wait_ms);
    buf.put_i32(request.min_bytes);
    buf.put_i32(request.max_bytes);
    buf.put_i8(request.isolation_level);

    buf.put_i32(1);
    put_string(&mut buf, request.partition.topic());
    buf.put_i32(1);
    buf.put_i32(request.partition.partition_number());
    buf.put_i64(request.fetch_offset);
    buf.put_i32(request.max_bytes);

    buf.freeze()
}

/// Broker-side decode. Only single-partition requests, as sent by
/// `encode_fetch_request`, are accepted.
pub fn decode_fetch_request(raw: &[u8]) -> Result<FetchRequest, CodecError> {
    read_fetch_request(&mut WireReader::new(raw)).map_err(CodecError::into_malformed_message)
}

fn read_fetch_request(reader: &mut WireReader<'_>) -> Result<FetchRequest, CodecError> {
    let api_key = reader.read_i16()?;
    let api_version = reader.read_i16()?;
    if api_key != FETCH_API_KEY || api_version != FETCH_API_VERSION {
        return Err(CodecError::MalformedMessage(format!(
            "expected fetch v{FETCH_API_VERSION} (api key {FETCH_API_KEY}), got api key {api_key} v{api_version}"
        )));
    }
    let correlation_id = reader.read_i32()?;
    let client_id = reader.read_nullable_string()?;

    let _replica_id = reader.read_i32()?;
    let max_wait_ms = reader.read_i32()?;
    let min_bytes = reader.read_i32()?;
    let max_bytes = reader.read_i32()?;
    let isolation_level = reader.read_i8()?;

    let topics = reader.read_array_len()?;
    if topics != 1 {
        return Err(CodecError::MalformedMessage(format!(
            "expected exactly one topic, got {topics}"
        )));
    }
    let topic = reader.read_string()?;
    let partitions = reader.read_array_len()?;
    if partitions != 1 {
        return Err(CodecError::MalformedMessage(format!(
            "expected exactly one partition, got {partitions}"
        )));
    }
    let partition_number = reader.read_i32()?;
    let fetch_offset = reader.read_i64()?;
    let _partition_max_bytes = reader.read_i32()?;

    if !reader.is_empty() {
        return Err(CodecError::MalformedMessage(format!(
            "{} trailing bytes after fetch request",
            reader.remaining()
        )));
    }

    Ok(FetchRequest {
        correlation_id,
        client_id,
        partition: Partition::new(topic, partition_number),
        fetch_offset,
        max_wait_ms,
        min_bytes,
        max_bytes,
        isolation_level,
    })
}

/// Consecutive partitions of the same topic share one topic entry.
pub fn encode_fetch_response(response: &FetchResponse) -> Bytes {
    let mut groups: Vec<(&str, Vec<&PartitionData>)> = Vec::new();
    for data in &response.partitions {
        match groups.last_mut() {
            Some((topic, partitions)) if *topic == data.partition.topic() => partitions.push(data),
            _ => groups.push((data.partition.topic(), vec![data])),
        }
    }

    let mut buf = BytesMut::new();
    buf.put_i32(response.correlation_id);
    buf.put_i32(response.throttle_time_ms);
    buf.put_i32(groups.len() as i32);
    for (topic, partitions) in groups {
        put_string(&mut buf, topic);
        buf.put_i32(partitions.len() as i32);
        for data in partitions {
            buf.put_i32(data.partition.partition_number());
            buf.put_i16(data.error_code);
            buf.put_i64(data.high_watermark);
            buf.put_i64(data.last_stable_offset);
            buf.put_i32(data.aborted_transactions.len() as i32);
            for aborted in &data.aborted_transactions {
                buf.put_i64(aborted.producer_id);
                buf.put_i64(aborted.first_offset);
            }
            put_nullable_bytes(&mut buf, Some(&data.records[..]));
        }
    }

    buf.freeze()
}

pub fn decode_fetch_response(raw: &[u8]) -> Result<FetchResponse, CodecError> {
    read_fetch_response(&mut WireReader::new(raw)).map_err(CodecError::into_malformed_message)
}

fn read_fetch_response(reader: &mut WireReader<'_>) -> Result<FetchResponse, CodecError> {
    let correlation_id = reader.read_i32()?;
    let throttle_time_ms = reader.read_i32()?;

    let mut partitions = Vec::new();
    for _ in 0..reader.read_array_len()? {
        let topic = reader.read_string()?;
        for _ in 0..reader.read_array_len()? {
            let partition_number = reader.read_i32()?;
            let error_code = reader.read_i16()?;
            let high_watermark = reader.read_i64()?;
            let last_stable_offset = reader.read_i64()?;

            let mut aborted_transactions = Vec::new();
            for _ in 0..reader.read_array_len()? {
                aborted_transactions.push(AbortedTransaction {
                    producer_id: reader.read_i64()?,
                    first_offset: reader.read_i64()?,
                });
            }

            let records = reader.read_nullable_bytes()?.unwrap_or_default();
            partitions.push(PartitionData {
                partition: Partition::new(topic.clone(), partition_number),
                error_code,
                high_watermark,
                last_stable_offset,
                aborted_transactions,
                records,
            });
        }
    }

    if !reader.is_empty() {
        return Err(CodecError::MalformedMessage(format!(
            "{} trailing bytes after fetch response",
            reader.remaining()
        )));
    }

    Ok(FetchResponse {
        correlation_id,
        throttle_time_ms,
        partitions,
    })
}
