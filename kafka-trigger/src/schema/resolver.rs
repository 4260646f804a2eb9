use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use apache_avro::types::Value as AvroValue;
use apache_avro::Schema;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::framing::unframe;
use super::{DecodedValue, DecodingMode, SchemaError, SchemaKey, SchemaRef, SchemaSource};
use crate::metrics_const::SCHEMA_COMPILES_COUNTER;

/// A parsed writer schema, ready to decode Avro binary datums.
#[derive(Debug)]
pub struct AvroDecoder {
    key: SchemaKey,
    schema: Schema,
}

impl AvroDecoder {
    pub fn compile(key: SchemaKey, schema_text: &str) -> Result<Self, SchemaError> {
        let schema = Schema::parse_str(schema_text)
            .map_err(|e| SchemaError::InvalidSchema(format!("{key}: {e}")))?;
        Ok(Self { key, schema })
    }

    pub fn key(&self) -> &SchemaKey {
        &self.key
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Decode a schema-registry framed value. The framing id is not checked
    /// against this decoder's key.
    pub fn decode(&self, framed: &[u8]) -> Result<AvroValue, SchemaError> {
        let (_, body) = unframe(framed)?;
        self.decode_datum(body)
    }

    /// Decode a bare Avro binary datum, which must be consumed exactly and
    /// produce a value that validates against the schema.
    pub fn decode_datum(&self, body: &[u8]) -> Result<AvroValue, SchemaError> {
        let mut reader = body;
        let value = apache_avro::from_avro_datum(&self.schema, &mut reader, None)
            .map_err(|e| SchemaError::SchemaMismatch(e.to_string()))?;
        if !reader.is_empty() {
            return Err(SchemaError::SchemaMismatch(format!(
                "{} trailing bytes after datum",
                reader.len()
            )));
        }
        // a body cut short can leave fields unset instead of failing the read
        if !value.validate(&self.schema) {
            return Err(SchemaError::SchemaMismatch(format!(
                "decoded value does not validate against {}",
                self.key
            )));
        }
        Ok(value)
    }
}

/// Caches one compiled decoder per schema key for the resolver's lifetime.
///
/// Concurrent first resolutions of a key share a single `OnceCell`, so the
/// source is queried and the schema compiled once while the other callers
/// wait. A failed compile leaves the cell empty and the next call retries.
pub struct SchemaResolver {
    source: Option<Arc<dyn SchemaSource>>,
    decoders: DashMap<SchemaKey, Arc<OnceCell<Arc<AvroDecoder>>>>,
    compiles: AtomicUsize,
}

impl Default for SchemaResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaResolver {
    /// A resolver for static schemas only; registry ids resolve to
    /// `UnknownSchemaId`.
    pub fn new() -> Self {
        Self {
            source: None,
            decoders: DashMap::new(),
            compiles: AtomicUsize::new(0),
        }
    }

    pub fn with_source(source: Arc<dyn SchemaSource>) -> Self {
        Self {
            source: Some(source),
            ..Self::new()
        }
    }

    pub async fn resolve(&self, key: &SchemaKey) -> Result<Arc<AvroDecoder>, SchemaError> {
        // Clone the cell out so the map shard lock is not held across the await
        let cell = self.decoders.entry(key.clone()).or_default().clone();
        cell.get_or_try_init(|| self.compile(key)).await.cloned()
    }

    async fn compile(&self, key: &SchemaKey) -> Result<Arc<AvroDecoder>, SchemaError> {
        let text = match key {
            SchemaKey::Static(text) => text.to_string(),
            SchemaKey::Id(id) => match &self.source {
                Some(source) => source.fetch_schema(*id).await?,
                None => return Err(SchemaError::UnknownSchemaId(*id)),
            },
        };

        let decoder = AvroDecoder::compile(key.clone(), &text)?;
        self.compiles.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(SCHEMA_COMPILES_COUNTER).increment(1);
        info!(schema = %key, "Compiled Avro schema");

        Ok(Arc::new(decoder))
    }

    /// Number of schemas compiled so far.
    pub fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::Relaxed)
    }

    pub fn cached_decoders(&self) -> usize {
        self.decoders
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    /// Decode one record value according to a binding's decoding mode. A null
    /// value decodes to empty text or bytes for the raw modes.
    pub async fn decode(
        &self,
        mode: &DecodingMode,
        value: Option<&Bytes>,
    ) -> Result<DecodedValue, SchemaError> {
        match mode {
            DecodingMode::RawBytes => Ok(DecodedValue::Bytes(value.cloned().unwrap_or_default())),
            DecodingMode::RawString => {
                let Some(value) = value else {
                    return Ok(DecodedValue::Text(String::new()));
                };
                std::str::from_utf8(value)
                    .map(|text| DecodedValue::Text(text.to_string()))
                    .map_err(|e| SchemaError::SchemaMismatch(format!("value is not UTF-8: {e}")))
            }
            DecodingMode::Structured(schema) => {
                let Some(value) = value else {
                    return Err(SchemaError::SchemaMismatch(
                        "record has a null value".to_string(),
                    ));
                };
                let (id, body) = unframe(value)?;
                let key = match schema {
                    SchemaRef::Static(text) => SchemaKey::Static(text.clone()),
                    SchemaRef::Registry => SchemaKey::Id(id),
                };
                debug!(schema = %key, framing_id = id, "Decoding structured value");

                let decoder = self.resolve(&key).await?;
                decoder.decode_datum(body).map(DecodedValue::Structured)
            }
        }
    }
}
