use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use super::framing::unframe;
use super::{SchemaError, SchemaKey, SchemaRef, SchemaResolver};

/// Typed Avro deserialization for handlers that receive raw bytes and decode
/// them themselves. Shares the resolver's decoder cache.
pub struct AvroDeserializer<T> {
    resolver: Arc<SchemaResolver>,
    schema: SchemaRef,
    _target: PhantomData<fn() -> T>,
}

impl<T> Clone for AvroDeserializer<T> {
    fn clone(&self) -> Self {
        Self {
            resolver: self.resolver.clone(),
            schema: self.schema.clone(),
            _target: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> AvroDeserializer<T> {
    pub fn new(resolver: Arc<SchemaResolver>, schema: SchemaRef) -> Self {
        Self {
            resolver,
            schema,
            _target: PhantomData,
        }
    }

    pub fn with_static_schema(resolver: Arc<SchemaResolver>, schema_text: &str) -> Self {
        Self::new(resolver, SchemaRef::Static(Arc::from(schema_text)))
    }

    pub async fn deserialize(&self, framed: &[u8]) -> Result<T, SchemaError> {
        let (id, body) = unframe(framed)?;
        let key = match &self.schema {
            SchemaRef::Static(text) => SchemaKey::Static(text.clone()),
            SchemaRef::Registry => SchemaKey::Id(id),
        };

        let value = self.resolver.resolve(&key).await?.decode_datum(body)?;
        apache_avro::from_value::<T>(&value).map_err(|e| SchemaError::SchemaMismatch(e.to_string()))
    }
}
