//! Partition ownership ledger.
//!
//! The single source of truth for which member of a group owns a partition,
//! and under which generation. Claims never overwrite another member's entry:
//! a claim on a partition someone else holds is an `OwnershipConflict`, which
//! means revoke-before-assign was violated.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{error, warn};

use super::CoordinatorError;
use crate::metrics_const::OWNED_PARTITIONS_GAUGE;
use crate::types::Partition;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub member_id: String,
    pub generation: u64,
}

#[derive(Debug, Default)]
pub struct OwnershipLedger {
    owners: DashMap<(String, Partition), Owner>,
}

impl OwnershipLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `member_id` as owner. Re-claiming an owned partition only moves
    /// it to the new generation.
    pub fn claim(
        &self,
        group: &str,
        partition: &Partition,
        member_id: &str,
        generation: u64,
    ) -> Result<(), CoordinatorError> {
        match self.owners.entry((group.to_string(), partition.clone())) {
            Entry::Occupied(mut entry) => {
                if entry.get().member_id != member_id {
                    let owner = entry.get().member_id.clone();
                    error!(
                        group,
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        owner = owner.as_str(),
                        claimant = member_id,
                        "Partition claimed while owned by another member"
                    );
                    return Err(CoordinatorError::OwnershipConflict {
                        partition: partition.clone(),
                        owner,
                    });
                }
                entry.get_mut().generation = generation;
            }
            Entry::Vacant(entry) => {
                entry.insert(Owner {
                    member_id: member_id.to_string(),
                    generation,
                });
            }
        }
        self.update_gauge(group);
        Ok(())
    }

    /// Drop ownership if `member_id` holds it. Returns whether anything changed.
    pub fn release(&self, group: &str, partition: &Partition, member_id: &str) -> bool {
        let removed = self
            .owners
            .remove_if(&(group.to_string(), partition.clone()), |_, owner| {
                owner.member_id == member_id
            })
            .is_some();
        if !removed {
            warn!(
                group,
                topic = partition.topic(),
                partition = partition.partition_number(),
                member_id,
                "Release of a partition the member does not own"
            );
        }
        self.update_gauge(group);
        removed
    }

    /// Drop every partition `member_id` owns in `group`.
    pub fn release_member(&self, group: &str, member_id: &str) -> Vec<Partition> {
        let mut released = Vec::new();
        self.owners.retain(|(owner_group, partition), owner| {
            if owner_group == group && owner.member_id == member_id {
                released.push(partition.clone());
                false
            } else {
                true
            }
        });
        self.update_gauge(group);
        released.sort();
        released
    }

    pub fn owner(&self, group: &str, partition: &Partition) -> Option<Owner> {
        self.owners
            .get(&(group.to_string(), partition.clone()))
            .map(|entry| entry.value().clone())
    }

    pub fn is_owner(&self, group: &str, partition: &Partition, member_id: &str) -> bool {
        self.owner(group, partition)
            .is_some_and(|owner| owner.member_id == member_id)
    }

    pub fn owned_by(&self, group: &str, member_id: &str) -> Vec<Partition> {
        let mut owned: Vec<Partition> = self
            .owners
            .iter()
            .filter(|entry| entry.key().0 == group && entry.value().member_id == member_id)
            .map(|entry| entry.key().1.clone())
            .collect();
        owned.sort();
        owned
    }

    pub fn owned_count(&self, group: &str) -> usize {
        self.owners.iter().filter(|entry| entry.key().0 == group).count()
    }

    fn update_gauge(&self, group: &str) {
        metrics::gauge!(OWNED_PARTITIONS_GAUGE, "group" => group.to_string())
            .set(self.owned_count(group) as f64);
    }
}
