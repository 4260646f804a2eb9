use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

use crate::types::Partition;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OffsetStoreError {
    /// Worth retrying
    #[error("offset store unavailable: {0}")]
    Unavailable(String),
}

/// Durable committed offsets per (group, partition).
#[async_trait]
pub trait OffsetStore: Send + Sync {
    async fn load(&self, group: &str, partition: &Partition)
        -> Result<Option<i64>, OffsetStoreError>;

    /// Write `new` only if the stored value is still `expected`. Returns
    /// `false` when another writer got there first.
    async fn compare_and_set(
        &self,
        group: &str,
        partition: &Partition,
        expected: Option<i64>,
        new: i64,
    ) -> Result<bool, OffsetStoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryOffsetStore {
    offsets: DashMap<(String, Partition), i64>,
    failing_writes: AtomicU32,
}

impl InMemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` writes fail with `Unavailable`.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    pub fn get(&self, group: &str, partition: &Partition) -> Option<i64> {
        self.offsets
            .get(&(group.to_string(), partition.clone()))
            .map(|entry| *entry.value())
    }
}

#[async_trait]
impl OffsetStore for InMemoryOffsetStore {
    async fn load(
        &self,
        group: &str,
        partition: &Partition,
    ) -> Result<Option<i64>, OffsetStoreError> {
        Ok(self.get(group, partition))
    }

    async fn compare_and_set(
        &self,
        group: &str,
        partition: &Partition,
        expected: Option<i64>,
        new: i64,
    ) -> Result<bool, OffsetStoreError> {
        if self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(OffsetStoreError::Unavailable(
                "injected write failure".to_string(),
            ));
        }

        match self.offsets.entry((group.to_string(), partition.clone())) {
            Entry::Occupied(mut entry) if Some(*entry.get()) == expected => {
                entry.insert(new);
                Ok(true)
            }
            Entry::Vacant(entry) if expected.is_none() => {
                entry.insert(new);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
