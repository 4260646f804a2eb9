use async_trait::async_trait;
use dashmap::DashMap;

use super::SchemaError;

/// Looks up writer schema text by registry id.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    /// Returns `UnknownSchemaId` when the id is not registered.
    async fn fetch_schema(&self, id: u32) -> Result<String, SchemaError>;
}

/// In-process schema registry.
#[derive(Debug, Default)]
pub struct LocalSchemaRegistry {
    schemas: DashMap<u32, String>,
}

impl LocalSchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(self, id: u32, schema_text: impl Into<String>) -> Self {
        self.register(id, schema_text);
        self
    }

    /// Registering an id again replaces its text for resolvers that have not
    /// compiled it yet.
    pub fn register(&self, id: u32, schema_text: impl Into<String>) {
        self.schemas.insert(id, schema_text.into());
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

#[async_trait]
impl SchemaSource for LocalSchemaRegistry {
    async fn fetch_schema(&self, id: u32) -> Result<String, SchemaError> {
        self.schemas
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(SchemaError::UnknownSchemaId(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_registered_and_unknown_ids() {
        let registry = LocalSchemaRegistry::new().with_schema(1, "\"string\"");

        assert_eq!(registry.fetch_schema(1).await.unwrap(), "\"string\"");
        assert_eq!(
            registry.fetch_schema(2).await,
            Err(SchemaError::UnknownSchemaId(2))
        );
        assert_eq!(registry.len(), 1);
    }
}
