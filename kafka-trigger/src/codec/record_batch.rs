//! Record batch (magic 2) framing.
//!
//! Layout of one batch on the wire:
//!
//! ```text
//! baseOffset: i64 | batchLength: i32 | partitionLeaderEpoch: i32 | magic: i8
//! crc: u32 (CRC-32C of everything from attributes to the end of the batch)
//! attributes: i16 | lastOffsetDelta: i32 | baseTimestamp: i64 | maxTimestamp: i64
//! producerId: i64 | producerEpoch: i16 | baseSequence: i32 | recordCount: i32
//! records... (optionally compressed as one block)
//! ```

use std::borrow::Cow;
use std::io::{Read, Write};

use bytes::{BufMut, Bytes, BytesMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use super::wire::{put_var_bytes, put_varint, put_varlong, WireReader};
use super::CodecError;

pub const CURRENT_MAGIC: i8 = 2;

/// baseOffset + batchLength, the part of the header not counted by batchLength
pub const LOG_OVERHEAD: usize = 12;
pub const BATCH_HEADER_LEN: usize = 61;
/// Upper bound on the decompressed records block of one batch
pub const DEFAULT_MAX_DECOMPRESSED_BYTES: usize = 64 * 1024 * 1024;

const MAGIC_OFFSET: usize = 16;
const CRC_OFFSET: usize = 17;
const ATTRIBUTES_OFFSET: usize = 21;

const COMPRESSION_MASK: i16 = 0x07;
const TRANSACTIONAL_FLAG: i16 = 0x10;
const CONTROL_FLAG: i16 = 0x20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    fn from_attributes(attributes: i16) -> Result<Self, CodecError> {
        match attributes & COMPRESSION_MASK {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Gzip),
            2 => Ok(Compression::Snappy),
            3 => Ok(Compression::Lz4),
            4 => Ok(Compression::Zstd),
            other => Err(CodecError::MalformedBatch(format!(
                "unknown compression codec id {other}"
            ))),
        }
    }

    fn id(self) -> i16 {
        match self {
            Compression::None => 0,
            Compression::Gzip => 1,
            Compression::Snappy => 2,
            Compression::Lz4 => 3,
            Compression::Zstd => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub key: String,
    pub value: Option<Bytes>,
}

/// One record with its absolute offset and timestamp (deltas already applied).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: i64,
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<RecordHeader>,
}

impl Record {
    pub fn new(offset: i64, value: impl Into<Bytes>) -> Self {
        Self {
            offset,
            timestamp: 0,
            key: None,
            value: Some(value.into()),
            headers: Vec::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_header(mut self, key: &str, value: impl Into<Bytes>) -> Self {
        self.headers.push(RecordHeader {
            key: key.to_string(),
            value: Some(value.into()),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    pub base_offset: i64,
    pub partition_leader_epoch: i32,
    pub attributes: i16,
    pub last_offset_delta: i32,
    pub base_timestamp: i64,
    pub max_timestamp: i64,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub base_sequence: i32,
    pub records: Vec<Record>,
}

impl RecordBatch {
    /// Build an uncompressed, non-transactional batch around `records`, which
    /// must be sorted by offset.
    pub fn new(records: Vec<Record>) -> Self {
        let base_offset = records.first().map(|r| r.offset).unwrap_or(0);
        let last_offset = records.last().map(|r| r.offset).unwrap_or(base_offset);
        let base_timestamp = records.iter().map(|r| r.timestamp).min().unwrap_or(0);
        let max_timestamp = records.iter().map(|r| r.timestamp).max().unwrap_or(0);

        Self {
            base_offset,
            partition_leader_epoch: -1,
            attributes: 0,
            last_offset_delta: (last_offset - base_offset) as i32,
            base_timestamp,
            max_timestamp,
            producer_id: -1,
            producer_epoch: -1,
            base_sequence: -1,
            records,
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.attributes = (self.attributes & !COMPRESSION_MASK) | compression.id();
        self
    }

    /// Marks the batch as a transaction control batch (commit/abort markers).
    pub fn with_control_flag(mut self) -> Self {
        self.attributes |= CONTROL_FLAG | TRANSACTIONAL_FLAG;
        self
    }

    pub fn compression(&self) -> Compression {
        Compression::from_attributes(self.attributes).unwrap_or(Compression::None)
    }

    pub fn is_control(&self) -> bool {
        self.attributes & CONTROL_FLAG != 0
    }

    pub fn is_transactional(&self) -> bool {
        self.attributes & TRANSACTIONAL_FLAG != 0
    }

    /// Offset of the last record the producer wrote into this batch. Can be past
    /// the last surviving record after log compaction.
    pub fn last_offset(&self) -> i64 {
        self.base_offset.saturating_add(i64::from(self.last_offset_delta))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Decode exactly one record batch. `raw` must hold the whole batch and nothing
/// else.
pub fn decode_batch(raw: &[u8]) -> Result<RecordBatch, CodecError> {
    decode_batch_with_limit(raw, DEFAULT_MAX_DECOMPRESSED_BYTES)
}

/// Like `decode_batch`, rejecting a compressed records block that expands past
/// `max_decompressed` bytes.
pub fn decode_batch_with_limit(
    raw: &[u8],
    max_decompressed: usize,
) -> Result<RecordBatch, CodecError> {
    if raw.len() <= MAGIC_OFFSET {
        return Err(CodecError::MalformedBatch(format!(
            "{} bytes is too short to hold a batch header",
            raw.len()
        )));
    }

    // Legacy message sets keep the magic byte at the same position.
    let magic = raw[MAGIC_OFFSET] as i8;
    if magic != CURRENT_MAGIC {
        return Err(CodecError::UnsupportedVersion(magic));
    }

    decode_batch_v2(raw, max_decompressed).map_err(CodecError::into_malformed_batch)
}

fn decode_batch_v2(raw: &[u8], max_decompressed: usize) -> Result<RecordBatch, CodecError> {
    if raw.len() < BATCH_HEADER_LEN {
        return Err(CodecError::MalformedBatch(format!(
            "{} bytes is too short to hold a batch header",
            raw.len()
        )));
    }

    let mut reader = WireReader::new(raw);
    let base_offset = reader.read_i64()?;
    let batch_length = reader.read_i32()?;
    if batch_length < (BATCH_HEADER_LEN - LOG_OVERHEAD) as i32
        || LOG_OVERHEAD + batch_length as usize != raw.len()
    {
        return Err(CodecError::MalformedBatch(format!(
            "batch length {batch_length} is inconsistent with buffer size {}",
            raw.len()
        )));
    }

    let partition_leader_epoch = reader.read_i32()?;
    let _magic = reader.read_i8()?;
    let crc = reader.read_u32()?;
    let computed = crc32c::crc32c(&raw[ATTRIBUTES_OFFSET..]);
    if crc != computed {
        return Err(CodecError::MalformedBatch(format!(
            "checksum mismatch: header {crc:#010x}, computed {computed:#010x}"
        )));
    }

    let attributes = reader.read_i16()?;
    let last_offset_delta = reader.read_i32()?;
    if last_offset_delta < 0
        || base_offset
            .checked_add(i64::from(last_offset_delta))
            .is_none()
    {
        return Err(CodecError::MalformedBatch(format!(
            "last offset delta {last_offset_delta} is invalid for base offset {base_offset}"
        )));
    }
    let base_timestamp = reader.read_i64()?;
    let max_timestamp = reader.read_i64()?;
    let producer_id = reader.read_i64()?;
    let producer_epoch = reader.read_i16()?;
    let base_sequence = reader.read_i32()?;
    let record_count = reader.read_i32()?;
    if record_count < 0 {
        return Err(CodecError::MalformedBatch(format!(
            "negative record count {record_count}"
        )));
    }

    let compression = Compression::from_attributes(attributes)?;
    let body = reader.take(reader.remaining())?;
    let records_data = decompress(compression, body, max_decompressed)?;
    let records = decode_records(
        &records_data,
        record_count as usize,
        base_offset,
        base_timestamp,
        last_offset_delta,
    )?;

    Ok(RecordBatch {
        base_offset,
        partition_leader_epoch,
        attributes,
        last_offset_delta,
        base_timestamp,
        max_timestamp,
        producer_id,
        producer_epoch,
        base_sequence,
        records,
    })
}

fn decode_records(
    data: &[u8],
    record_count: usize,
    base_offset: i64,
    base_timestamp: i64,
    last_offset_delta: i32,
) -> Result<Vec<Record>, CodecError> {
    let mut reader = WireReader::new(data);
    // a hostile count must not turn into a huge allocation
    let mut records = Vec::with_capacity(record_count.min(data.len()));

    for index in 0..record_count {
        let length = reader.read_varint()?;
        if length < 0 {
            return Err(CodecError::MalformedBatch(format!(
                "record {index} has negative length {length}"
            )));
        }
        let mut fields = WireReader::new(reader.take(length as usize)?);

        let _attributes = fields.read_i8()?;
        let timestamp_delta = fields.read_varlong()?;
        let offset_delta = fields.read_varint()?;
        if offset_delta < 0 || offset_delta > last_offset_delta {
            return Err(CodecError::MalformedBatch(format!(
                "record {index} offset delta {offset_delta} outside 0..={last_offset_delta}"
            )));
        }
        let key = fields.read_var_bytes()?;
        let value = fields.read_var_bytes()?;

        let header_count = fields.read_varint()?;
        if header_count < 0 {
            return Err(CodecError::MalformedBatch(format!(
                "record {index} has negative header count {header_count}"
            )));
        }
        let mut headers = Vec::with_capacity((header_count as usize).min(fields.remaining()));
        for _ in 0..header_count {
            let key = fields.read_var_bytes()?.ok_or_else(|| {
                CodecError::MalformedBatch(format!("record {index} has a null header key"))
            })?;
            let key = String::from_utf8(key.to_vec()).map_err(|_| {
                CodecError::MalformedBatch(format!("record {index} header key is not UTF-8"))
            })?;
            let value = fields.read_var_bytes()?;
            headers.push(RecordHeader { key, value });
        }

        if !fields.is_empty() {
            return Err(CodecError::MalformedBatch(format!(
                "record {index} length {length} leaves {} unread bytes",
                fields.remaining()
            )));
        }

        let offset = base_offset
            .checked_add(i64::from(offset_delta))
            .ok_or_else(|| {
                CodecError::MalformedBatch(format!("record {index} offset overflows"))
            })?;
        let timestamp = base_timestamp.checked_add(timestamp_delta).ok_or_else(|| {
            CodecError::MalformedBatch(format!(
                "record {index} timestamp delta {timestamp_delta} overflows base {base_timestamp}"
            ))
        })?;

        records.push(Record {
            offset,
            timestamp,
            key,
            value,
            headers,
        });
    }

    if !reader.is_empty() {
        return Err(CodecError::MalformedBatch(format!(
            "{} trailing bytes after {record_count} records",
            reader.remaining()
        )));
    }

    Ok(records)
}

/// Encode a batch, compressing the records block per the batch attributes.
pub fn encode_batch(batch: &RecordBatch) -> Result<Bytes, CodecError> {
    let mut records = BytesMut::new();
    for record in &batch.records {
        let mut body = BytesMut::new();
        body.put_i8(0);
        put_varlong(&mut body, record.timestamp - batch.base_timestamp);
        put_varint(&mut body, (record.offset - batch.base_offset) as i32);
        put_var_bytes(&mut body, record.key.as_deref());
        put_var_bytes(&mut body, record.value.as_deref());
        put_varint(&mut body, record.headers.len() as i32);
        for header in &record.headers {
            put_var_bytes(&mut body, Some(header.key.as_bytes()));
            put_var_bytes(&mut body, header.value.as_deref());
        }

        put_varint(&mut records, body.len() as i32);
        records.extend_from_slice(&body);
    }

    let compression = Compression::from_attributes(batch.attributes)?;
    let records = compress(compression, &records)?;

    let mut buf = BytesMut::with_capacity(BATCH_HEADER_LEN + records.len());
    buf.put_i64(batch.base_offset);
    buf.put_i32((BATCH_HEADER_LEN - LOG_OVERHEAD + records.len()) as i32);
    buf.put_i32(batch.partition_leader_epoch);
    buf.put_i8(CURRENT_MAGIC);
    buf.put_u32(0);
    buf.put_i16(batch.attributes);
    buf.put_i32(batch.last_offset_delta);
    buf.put_i64(batch.base_timestamp);
    buf.put_i64(batch.max_timestamp);
    buf.put_i64(batch.producer_id);
    buf.put_i16(batch.producer_epoch);
    buf.put_i32(batch.base_sequence);
    buf.put_i32(batch.records.len() as i32);
    buf.extend_from_slice(&records);

    let crc = crc32c::crc32c(&buf[ATTRIBUTES_OFFSET..]);
    buf[CRC_OFFSET..ATTRIBUTES_OFFSET].copy_from_slice(&crc.to_be_bytes());

    Ok(buf.freeze())
}

/// Decode the `records` field of a fetch response: zero or more concatenated
/// batches. The broker may cut the last batch short at `max_bytes`; that
/// trailing fragment is dropped and fetched again on the next request.
pub fn decode_record_set(data: &[u8]) -> Result<Vec<RecordBatch>, CodecError> {
    decode_record_set_with_limit(data, DEFAULT_MAX_DECOMPRESSED_BYTES)
}

pub fn decode_record_set_with_limit(
    data: &[u8],
    max_decompressed: usize,
) -> Result<Vec<RecordBatch>, CodecError> {
    let mut batches = Vec::new();
    let mut pos = 0;

    while data.len() - pos >= LOG_OVERHEAD {
        let mut header = WireReader::new(&data[pos..]);
        let _base_offset = header.read_i64()?;
        let batch_length = header.read_i32()?;
        if batch_length < 0 {
            return Err(CodecError::MalformedBatch(format!(
                "negative batch length {batch_length} at position {pos}"
            )));
        }

        let end = pos + LOG_OVERHEAD + batch_length as usize;
        if end > data.len() {
            break;
        }

        batches.push(decode_batch_with_limit(&data[pos..end], max_decompressed)?);
        pos = end;
    }

    Ok(batches)
}

fn decompress(
    compression: Compression,
    data: &[u8],
    limit: usize,
) -> Result<Cow<'_, [u8]>, CodecError> {
    match compression {
        Compression::None => Ok(Cow::Borrowed(data)),
        Compression::Gzip => read_limited("gzip", GzDecoder::new(data), limit).map(Cow::Owned),
        Compression::Zstd => {
            let decoder = zstd::stream::read::Decoder::new(data)
                .map_err(|e| CodecError::MalformedBatch(format!("zstd records block: {e}")))?;
            read_limited("zstd", decoder, limit).map(Cow::Owned)
        }
        other => Err(CodecError::UnsupportedCompression(other)),
    }
}

/// Read at most `limit` decompressed bytes; one byte more means the block is
/// too large.
fn read_limited(codec: &str, decoder: impl Read, limit: usize) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    decoder
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| CodecError::MalformedBatch(format!("{codec} records block: {e}")))?;
    if out.len() > limit {
        return Err(CodecError::MalformedBatch(format!(
            "{codec} records block expands past {limit} bytes"
        )));
    }
    Ok(out)
}

fn compress(compression: Compression, data: &[u8]) -> Result<Vec<u8>, CodecError> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(data)
                .and_then(|_| encoder.finish())
                .map_err(|e| CodecError::MalformedBatch(format!("gzip records block: {e}")))
        }
        Compression::Zstd => zstd::stream::encode_all(data, 0)
            .map_err(|e| CodecError::MalformedBatch(format!("zstd records block: {e}"))),
        other => Err(CodecError::UnsupportedCompression(other)),
    }
}
