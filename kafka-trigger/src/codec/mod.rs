//! Wire codec for Kafka record batches (magic 2) and the Fetch v4 exchange.
//!
//! Everything here is pure: bytes in, typed values out (and back). No I/O and no
//! shared state, so the fetcher and the in-memory test broker share one codec.

pub mod fetch;
pub mod record_batch;
pub(crate) mod wire;

use thiserror::Error;

pub use fetch::{
    decode_fetch_request, decode_fetch_response, encode_fetch_request, encode_fetch_response,
    error_code, AbortedTransaction, FetchRequest, FetchResponse, PartitionData,
};
pub use record_batch::{
    decode_batch, decode_batch_with_limit, decode_record_set, decode_record_set_with_limit,
    encode_batch, Compression, Record, RecordBatch, RecordHeader, DEFAULT_MAX_DECOMPRESSED_BYTES,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Length prefixes, counts or checksum disagree with the buffer contents
    #[error("malformed record batch: {0}")]
    MalformedBatch(String),

    /// Legacy message sets (magic 0 and 1) and unknown future formats
    #[error("unsupported record batch magic byte {0}")]
    UnsupportedVersion(i8),

    #[error("unsupported compression codec {0:?}")]
    UnsupportedCompression(Compression),

    #[error("malformed protocol message: {0}")]
    MalformedMessage(String),

    #[error("needed {needed} bytes but only {remaining} remain")]
    Truncated { needed: usize, remaining: usize },

    #[error("varint is longer than its type allows")]
    InvalidVarint,
}

impl CodecError {
    /// Re-labels low-level read failures as a malformed batch, keeping the detail.
    pub(crate) fn into_malformed_batch(self) -> Self {
        match self {
            CodecError::Truncated { .. }
            | CodecError::InvalidVarint
            | CodecError::MalformedMessage(_) => CodecError::MalformedBatch(self.to_string()),
            other => other,
        }
    }

    /// Re-labels low-level read failures as a malformed protocol message.
    pub(crate) fn into_malformed_message(self) -> Self {
        match self {
            CodecError::Truncated { .. } | CodecError::InvalidVarint => {
                CodecError::MalformedMessage(self.to_string())
            }
            other => other,
        }
    }
}
