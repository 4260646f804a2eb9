//! Consumer group membership, partition assignment and offset commits.

pub mod assignor;
pub mod group;
pub mod offsets;
pub mod ownership;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::backoff::BackoffPolicy;
use crate::types::{Partition, PartitionAssignment};

pub use assignor::AssignmentStrategy;
pub use group::{GroupCoordinator, MemberCommitter, MemberHandle};
pub use offsets::{InMemoryOffsetStore, OffsetStore, OffsetStoreError};
pub use ownership::{Owner, OwnershipLedger};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("commit of offset {offset} for {partition} failed: {reason}")]
    CommitFailed {
        partition: Partition,
        offset: i64,
        reason: String,
    },

    #[error("member {member_id} is not part of group {group}")]
    UnknownMember { group: String, member_id: String },

    #[error("topic {0} is not known to the coordinator")]
    UnknownTopic(String),

    #[error("{partition} is already owned by member {owner}")]
    OwnershipConflict { partition: Partition, owner: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    Joining,
    Stable,
    Rebalancing,
    Left,
}

/// Handed to a member with a revocation; the coordinator does not assign the
/// revoked partitions elsewhere until this is acknowledged or the rebalance
/// timeout passes.
#[derive(Debug)]
pub struct RevocationAck(oneshot::Sender<()>);

impl RevocationAck {
    pub(crate) fn new(sender: oneshot::Sender<()>) -> Self {
        Self(sender)
    }

    /// Confirm that fetchers for the revoked partitions are stopped and their
    /// processed work committed.
    pub fn ack(self) {
        if self.0.send(()).is_err() {
            tracing::debug!("Revocation acknowledged after the coordinator stopped waiting");
        }
    }
}

#[derive(Debug)]
pub enum MemberEvent {
    /// Partitions newly owned by the member, with their committed offsets.
    Assigned {
        generation: u64,
        partitions: Vec<PartitionAssignment>,
    },
    /// Partitions the member must stop consuming before acknowledging.
    Revoked {
        generation: u64,
        partitions: Vec<Partition>,
        ack: RevocationAck,
    },
    /// The member was removed from the group (missed heartbeats or did not
    /// acknowledge a revocation in time). All its partitions are gone.
    Fenced { reason: String },
}

/// Commits processed offsets on behalf of one group member.
#[async_trait]
pub trait OffsetCommitter: Send + Sync {
    async fn commit(&self, partition: &Partition, offset: i64) -> Result<(), CoordinatorError>;
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub strategy: AssignmentStrategy,
    pub session_timeout: Duration,
    pub rebalance_timeout: Duration,
    pub commit_backoff: BackoffPolicy,
    pub commit_max_attempts: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            strategy: AssignmentStrategy::RoundRobin,
            session_timeout: Duration::from_secs(10),
            rebalance_timeout: Duration::from_secs(30),
            commit_backoff: BackoffPolicy::new(
                Duration::from_millis(50),
                2.0,
                Duration::from_secs(2),
            ),
            commit_max_attempts: 5,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_strategy(mut self, strategy: AssignmentStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_session_timeout(mut self, session_timeout: Duration) -> Self {
        self.session_timeout = session_timeout;
        self
    }

    pub fn with_rebalance_timeout(mut self, rebalance_timeout: Duration) -> Self {
        self.rebalance_timeout = rebalance_timeout;
        self
    }

    pub fn with_commit_backoff(mut self, commit_backoff: BackoffPolicy) -> Self {
        self.commit_backoff = commit_backoff;
        self
    }

    pub fn with_commit_max_attempts(mut self, commit_max_attempts: u32) -> Self {
        self.commit_max_attempts = commit_max_attempts.max(1);
        self
    }

    /// How often the reaper looks for members past their session timeout.
    pub fn reaper_interval(&self) -> Duration {
        (self.session_timeout / 4).max(Duration::from_millis(5))
    }
}
