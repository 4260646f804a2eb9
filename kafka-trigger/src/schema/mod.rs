//! Avro schema resolution and record value decoding.

pub mod deserializer;
pub mod framing;
pub mod resolver;
pub mod source;

use std::fmt;
use std::sync::Arc;

use apache_avro::types::Value as AvroValue;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use thiserror::Error;

pub use deserializer::AvroDeserializer;
pub use resolver::{AvroDecoder, SchemaResolver};
pub use source::{LocalSchemaRegistry, SchemaSource};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// The bytes do not match the expected layout. Never retried.
    #[error("value does not match schema: {0}")]
    SchemaMismatch(String),

    #[error("unknown schema id {0}")]
    UnknownSchemaId(u32),

    #[error("invalid schema definition: {0}")]
    InvalidSchema(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SchemaKey {
    Id(u32),
    Static(Arc<str>),
}

impl fmt::Display for SchemaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaKey::Id(id) => write!(f, "id:{id}"),
            // full schema text is too noisy for log lines
            SchemaKey::Static(text) => write!(f, "static({} bytes)", text.len()),
        }
    }
}

/// Where a structured binding gets its writer schema from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaRef {
    /// One schema for every record; the id in the framing header is ignored.
    Static(Arc<str>),
    /// The id in each record's framing header is looked up in the schema source.
    Registry,
}

/// How record values of a binding are turned into `DecodedValue`s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodingMode {
    Structured(SchemaRef),
    RawString,
    RawBytes,
}

impl DecodingMode {
    pub fn structured(schema_text: impl Into<Arc<str>>) -> Self {
        DecodingMode::Structured(SchemaRef::Static(schema_text.into()))
    }

    pub fn registry() -> Self {
        DecodingMode::Structured(SchemaRef::Registry)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedValue {
    Structured(AvroValue),
    Text(String),
    Bytes(Bytes),
}

impl DecodedValue {
    pub fn as_structured(&self) -> Option<&AvroValue> {
        match self {
            DecodedValue::Structured(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            DecodedValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            DecodedValue::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Map a structured value onto a serde type.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, SchemaError> {
        match self {
            DecodedValue::Structured(value) => apache_avro::from_value::<T>(value)
                .map_err(|e| SchemaError::SchemaMismatch(e.to_string())),
            DecodedValue::Text(_) => Err(SchemaError::SchemaMismatch(
                "cannot deserialize a text value".to_string(),
            )),
            DecodedValue::Bytes(_) => Err(SchemaError::SchemaMismatch(
                "cannot deserialize raw bytes without a schema".to_string(),
            )),
        }
    }

    pub fn to_json(&self) -> Result<serde_json::Value, SchemaError> {
        match self {
            DecodedValue::Structured(value) => serde_json::Value::try_from(value.clone())
                .map_err(|e| SchemaError::SchemaMismatch(e.to_string())),
            DecodedValue::Text(text) => Ok(serde_json::Value::String(text.clone())),
            DecodedValue::Bytes(bytes) => Ok(serde_json::Value::from(bytes.to_vec())),
        }
    }
}
