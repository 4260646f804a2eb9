use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::{counter, gauge};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::assignor::{Assignment, Subscriptions};
use super::offsets::{OffsetStore, OffsetStoreError};
use super::ownership::OwnershipLedger;
use super::{
    CoordinatorConfig, CoordinatorError, MemberEvent, MemberState, OffsetCommitter,
    RevocationAck,
};
use crate::metrics_const::{
    COMMITS_COUNTER, COMMIT_FAILURES_COUNTER, GROUP_MEMBERS_GAUGE, HALTED_PARTITIONS_GAUGE,
    MEMBERS_FENCED_COUNTER, REBALANCES_COUNTER,
};
use crate::types::{Partition, PartitionAssignment};

struct MemberEntry {
    topics: BTreeSet<String>,
    state: MemberState,
    assignment: BTreeSet<Partition>,
    events: mpsc::UnboundedSender<MemberEvent>,
}

#[derive(Default)]
struct GroupState {
    generation: u64,
    members: BTreeMap<String, MemberEntry>,
}

enum CommitOutcome {
    Committed,
    /// The stored offset is already at or past the requested one
    Stale(i64),
    /// Another writer moved the stored offset between load and write
    Raced,
}

/// A joined member's identity and event stream.
pub struct MemberHandle {
    group: String,
    member_id: String,
    events: mpsc::UnboundedReceiver<MemberEvent>,
}

impl MemberHandle {
    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    pub async fn next_event(&mut self) -> Option<MemberEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<MemberEvent> {
        self.events.try_recv().ok()
    }
}

/// In-process group coordinator.
///
/// Membership and assignment changes run one at a time under `groups`,
/// including the wait for revocation acknowledgements. Commits and heartbeats
/// never take that lock: commits only consult the ownership ledger, so a
/// member draining its revoked partitions can still commit while the
/// rebalance waits for it.
///
/// Halted partitions are left out of every assignment of their group until
/// `resume` is called for them.
pub struct GroupCoordinator {
    config: CoordinatorConfig,
    store: Arc<dyn OffsetStore>,
    topics: DashMap<String, i32>,
    groups: Mutex<HashMap<String, GroupState>>,
    ledger: OwnershipLedger,
    heartbeats: DashMap<(String, String), Instant>,
    commit_locks: DashMap<(String, Partition), Arc<Mutex<()>>>,
    halted: DashMap<(String, Partition), String>,
}

impl GroupCoordinator {
    pub fn new(config: CoordinatorConfig, store: Arc<dyn OffsetStore>) -> Self {
        Self {
            config,
            store,
            topics: DashMap::new(),
            groups: Mutex::new(HashMap::new()),
            ledger: OwnershipLedger::new(),
            heartbeats: DashMap::new(),
            commit_locks: DashMap::new(),
            halted: DashMap::new(),
        }
    }

    pub fn with_topic(self, topic: impl Into<String>, partitions: i32) -> Self {
        self.register_topic(topic, partitions);
        self
    }

    /// Make a topic with `partitions` partitions available to subscribers.
    /// Groups already subscribed pick up a change on their next rebalance.
    pub fn register_topic(&self, topic: impl Into<String>, partitions: i32) {
        let topic = topic.into();
        info!(topic = topic.as_str(), partitions, "Registered topic");
        self.topics.insert(topic, partitions.max(0));
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn ledger(&self) -> &OwnershipLedger {
        &self.ledger
    }

    pub async fn join(
        &self,
        group: &str,
        topics: &[String],
    ) -> Result<MemberHandle, CoordinatorError> {
        if let Some(unknown) = topics.iter().find(|t| !self.topics.contains_key(*t)) {
            return Err(CoordinatorError::UnknownTopic(unknown.clone()));
        }

        let member_id = format!("{group}-{}", Uuid::now_v7());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut groups = self.groups.lock().await;
        let state = groups.entry(group.to_string()).or_default();
        state.members.insert(
            member_id.clone(),
            MemberEntry {
                topics: topics.iter().cloned().collect(),
                state: MemberState::Joining,
                assignment: BTreeSet::new(),
                events: events_tx,
            },
        );
        self.heartbeats
            .insert((group.to_string(), member_id.clone()), Instant::now());
        info!(
            group,
            member_id = member_id.as_str(),
            topics = ?topics,
            "Member joining group"
        );

        self.rebalance(group, state, "join").await;
        Self::teardown_if_empty(&mut groups, group);

        Ok(MemberHandle {
            group: group.to_string(),
            member_id,
            events: events_rx,
        })
    }

    /// Remove a member that stopped its fetchers and committed its work, and
    /// hand its partitions to the rest of the group.
    pub async fn leave(&self, group: &str, member_id: &str) -> Result<(), CoordinatorError> {
        let mut groups = self.groups.lock().await;
        let state = groups
            .get_mut(group)
            .ok_or_else(|| unknown_member(group, member_id))?;
        if state.members.remove(member_id).is_none() {
            return Err(unknown_member(group, member_id));
        }

        self.heartbeats
            .remove(&(group.to_string(), member_id.to_string()));
        let released = self.ledger.release_member(group, member_id);
        info!(
            group,
            member_id,
            released = released.len(),
            "Member left group"
        );

        if !state.members.is_empty() {
            self.rebalance(group, state, "leave").await;
        }
        Self::teardown_if_empty(&mut groups, group);
        Ok(())
    }

    pub fn heartbeat(&self, group: &str, member_id: &str) -> Result<(), CoordinatorError> {
        match self
            .heartbeats
            .get_mut(&(group.to_string(), member_id.to_string()))
        {
            Some(mut last_seen) => {
                *last_seen = Instant::now();
                Ok(())
            }
            None => Err(unknown_member(group, member_id)),
        }
    }

    /// Fence every member whose last heartbeat is older than the session
    /// timeout. Returns how many were removed.
    pub async fn reap_expired(&self) -> usize {
        let session_timeout = self.config.session_timeout;
        let expired: Vec<(String, String)> = self
            .heartbeats
            .iter()
            .filter(|entry| entry.value().elapsed() > session_timeout)
            .map(|entry| entry.key().clone())
            .collect();
        if expired.is_empty() {
            return 0;
        }

        let mut reaped = 0;
        let mut groups = self.groups.lock().await;
        for (group, member_id) in expired {
            // it may have heartbeated while we waited for the lock
            let still_expired = self
                .heartbeats
                .get(&(group.clone(), member_id.clone()))
                .is_some_and(|last_seen| last_seen.elapsed() > session_timeout);
            if !still_expired {
                continue;
            }
            let Some(state) = groups.get_mut(&group) else {
                self.heartbeats.remove(&(group, member_id));
                continue;
            };

            self.remove_fenced(&group, state, &member_id, "session timeout");
            reaped += 1;
            if !state.members.is_empty() {
                self.rebalance(&group, state, "timeout").await;
            }
            Self::teardown_if_empty(&mut groups, &group);
        }
        reaped
    }

    /// Run `reap_expired` every `reaper_interval` until `shutdown` fires.
    pub fn spawn_reaper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(coordinator.config.reaper_interval());
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = coordinator.reap_expired().await;
                        if reaped > 0 {
                            warn!(reaped, "Removed members past their session timeout");
                        }
                    }
                }
            }
            debug!("Group reaper stopped");
        })
    }

    /// Commit `offset` as the last processed record of `partition`. Offsets at
    /// or below the stored one are accepted as no-ops. Commits for one
    /// partition are applied in call order.
    pub async fn commit(
        &self,
        group: &str,
        member_id: &str,
        partition: &Partition,
        offset: i64,
    ) -> Result<(), CoordinatorError> {
        if !self.ledger.is_owner(group, partition, member_id) {
            counter!(COMMIT_FAILURES_COUNTER, "reason" => "not_owner").increment(1);
            warn!(
                group,
                member_id,
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset,
                "Rejected commit from a member that does not own the partition"
            );
            return Err(CoordinatorError::CommitFailed {
                partition: partition.clone(),
                offset,
                reason: format!("member {member_id} does not own the partition"),
            });
        }

        let lock = self
            .commit_locks
            .entry((group.to_string(), partition.clone()))
            .or_default()
            .clone();
        let _ordered = lock.lock().await;

        let mut failures = 0;
        loop {
            match self.try_commit(group, partition, offset).await {
                Ok(CommitOutcome::Committed) => {
                    counter!(COMMITS_COUNTER).increment(1);
                    debug!(
                        group,
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        offset,
                        "Committed offset"
                    );
                    return Ok(());
                }
                Ok(CommitOutcome::Stale(current)) => {
                    debug!(
                        group,
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        offset,
                        current,
                        "Commit at or below stored offset ignored"
                    );
                    return Ok(());
                }
                Ok(CommitOutcome::Raced) => continue,
                Err(e) => {
                    failures += 1;
                    if failures >= self.config.commit_max_attempts {
                        counter!(COMMIT_FAILURES_COUNTER, "reason" => "store").increment(1);
                        error!(
                            group,
                            topic = partition.topic(),
                            partition = partition.partition_number(),
                            offset,
                            attempts = failures,
                            error = ?e,
                            "Offset commit failed"
                        );
                        return Err(CoordinatorError::CommitFailed {
                            partition: partition.clone(),
                            offset,
                            reason: e.to_string(),
                        });
                    }

                    let delay = self.config.commit_backoff.delay_for(failures - 1);
                    warn!(
                        group,
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = ?e,
                        "Offset commit failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn try_commit(
        &self,
        group: &str,
        partition: &Partition,
        offset: i64,
    ) -> Result<CommitOutcome, OffsetStoreError> {
        let current = self.store.load(group, partition).await?;
        if let Some(current) = current.filter(|current| offset <= *current) {
            return Ok(CommitOutcome::Stale(current));
        }
        if self
            .store
            .compare_and_set(group, partition, current, offset)
            .await?
        {
            Ok(CommitOutcome::Committed)
        } else {
            Ok(CommitOutcome::Raced)
        }
    }

    /// Keep `partition` away from every member of `group` until it is resumed.
    /// The current owner keeps it, idle, until the next rebalance revokes it.
    pub fn halt(&self, group: &str, partition: &Partition, reason: impl Into<String>) {
        let reason = reason.into();
        error!(
            group,
            topic = partition.topic(),
            partition = partition.partition_number(),
            reason = reason.as_str(),
            "Partition halted until resumed"
        );
        self.halted
            .insert((group.to_string(), partition.clone()), reason);
        self.update_halted_gauge(group);
    }

    /// Lift a halt and rebalance the group so the partition gets an owner
    /// again. Returns false if the partition was not halted.
    pub async fn resume(&self, group: &str, partition: &Partition) -> bool {
        if self
            .halted
            .remove(&(group.to_string(), partition.clone()))
            .is_none()
        {
            return false;
        }
        self.update_halted_gauge(group);
        info!(
            group,
            topic = partition.topic(),
            partition = partition.partition_number(),
            "Partition resumed"
        );

        let mut groups = self.groups.lock().await;
        if let Some(state) = groups.get_mut(group) {
            if !state.members.is_empty() {
                self.rebalance(group, state, "resume").await;
            }
        }
        true
    }

    /// Halted partitions of `group` with the reason each was halted.
    pub fn halted(&self, group: &str) -> BTreeMap<Partition, String> {
        self.halted
            .iter()
            .filter(|entry| entry.key().0 == group)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect()
    }

    fn update_halted_gauge(&self, group: &str) {
        let count = self.halted.iter().filter(|entry| entry.key().0 == group).count();
        gauge!(HALTED_PARTITIONS_GAUGE, "group" => group.to_string()).set(count as f64);
    }

    pub async fn committed_offset(
        &self,
        group: &str,
        partition: &Partition,
    ) -> Result<Option<i64>, OffsetStoreError> {
        self.store.load(group, partition).await
    }

    /// `Left` for members that are not (or no longer) in the group.
    pub async fn member_state(&self, group: &str, member_id: &str) -> MemberState {
        self.groups
            .lock()
            .await
            .get(group)
            .and_then(|state| state.members.get(member_id))
            .map(|member| member.state)
            .unwrap_or(MemberState::Left)
    }

    pub async fn generation(&self, group: &str) -> Option<u64> {
        self.groups
            .lock()
            .await
            .get(group)
            .map(|state| state.generation)
    }

    pub async fn members(&self, group: &str) -> Vec<String> {
        self.groups
            .lock()
            .await
            .get(group)
            .map(|state| state.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn assignment(&self, group: &str, member_id: &str) -> Vec<Partition> {
        self.ledger.owned_by(group, member_id)
    }

    pub fn committer(self: &Arc<Self>, handle: &MemberHandle) -> MemberCommitter {
        MemberCommitter {
            coordinator: Arc::clone(self),
            group: handle.group.clone(),
            member_id: handle.member_id.clone(),
        }
    }

    fn compute_assignment(&self, group: &str, state: &GroupState) -> Assignment {
        let subscriptions: Subscriptions = state
            .members
            .iter()
            .map(|(member_id, member)| (member_id.clone(), member.topics.clone()))
            .collect();
        let topic_partitions: BTreeMap<String, i32> = subscriptions
            .values()
            .flatten()
            .filter_map(|topic| {
                self.topics
                    .get(topic)
                    .map(|count| (topic.clone(), *count.value()))
            })
            .collect();

        let mut assignment = self.config.strategy.assign(&subscriptions, &topic_partitions);
        for partitions in assignment.values_mut() {
            partitions.retain(|partition| {
                !self
                    .halted
                    .contains_key(&(group.to_string(), partition.clone()))
            });
        }
        assignment
    }

    /// Revoke-before-assign. Nothing is claimed for the new generation until
    /// every member losing partitions has acknowledged or been fenced.
    async fn rebalance(&self, group: &str, state: &mut GroupState, reason: &'static str) {
        let started = Instant::now();
        state.generation += 1;
        let generation = state.generation;
        for member in state.members.values_mut() {
            if member.state != MemberState::Joining {
                member.state = MemberState::Rebalancing;
            }
        }
        info!(
            group,
            generation,
            reason,
            members = state.members.len(),
            "Rebalance started"
        );

        let target = loop {
            let target = self.compute_assignment(group, state);
            let fenced = self.revoke(group, state, &target, generation).await;
            if fenced.is_empty() {
                break target;
            }
            for member_id in fenced {
                self.remove_fenced(
                    group,
                    state,
                    &member_id,
                    "revocation not acknowledged within the rebalance timeout",
                );
            }
        };

        for (member_id, member) in state.members.iter_mut() {
            let wanted = target.get(member_id).cloned().unwrap_or_default();
            let mut owned = BTreeSet::new();
            let mut added = Vec::new();

            for partition in wanted {
                if self
                    .ledger
                    .claim(group, &partition, member_id, generation)
                    .is_err()
                {
                    // logged by the ledger; the partition stays with its owner
                    continue;
                }
                if !member.assignment.contains(&partition) {
                    let committed = self.load_committed(group, &partition).await;
                    added.push(PartitionAssignment::new(partition.clone(), committed));
                }
                owned.insert(partition);
            }
            member.assignment = owned;

            if !added.is_empty() || member.state == MemberState::Joining {
                let event = MemberEvent::Assigned {
                    generation,
                    partitions: added,
                };
                if member.events.send(event).is_err() {
                    warn!(group, member_id = member_id.as_str(), "Member event channel closed");
                }
            }
            member.state = MemberState::Stable;
        }

        counter!(REBALANCES_COUNTER, "reason" => reason).increment(1);
        gauge!(GROUP_MEMBERS_GAUGE, "group" => group.to_string())
            .set(state.members.len() as f64);
        info!(
            group,
            generation,
            members = state.members.len(),
            owned = self.ledger.owned_count(group),
            duration_ms = started.elapsed().as_millis() as u64,
            "Rebalance completed"
        );
    }

    /// Send revocations and wait for the acknowledgements. Returns the members
    /// that did not acknowledge in time.
    async fn revoke(
        &self,
        group: &str,
        state: &mut GroupState,
        target: &Assignment,
        generation: u64,
    ) -> Vec<String> {
        let mut pending = Vec::new();
        for (member_id, member) in state.members.iter() {
            let revoked: Vec<Partition> = member
                .assignment
                .iter()
                .filter(|p| !target.get(member_id).is_some_and(|keep| keep.contains(*p)))
                .cloned()
                .collect();
            if revoked.is_empty() {
                continue;
            }

            info!(
                group,
                member_id = member_id.as_str(),
                generation,
                revoked = revoked.len(),
                "Revoking partitions"
            );
            let (ack_tx, ack_rx) = oneshot::channel();
            let event = MemberEvent::Revoked {
                generation,
                partitions: revoked.clone(),
                ack: RevocationAck::new(ack_tx),
            };
            // on failure the ack sender is dropped with the event, so the wait
            // below ends immediately
            if member.events.send(event).is_err() {
                warn!(group, member_id = member_id.as_str(), "Member event channel closed");
            }
            pending.push((member_id.clone(), revoked, ack_rx));
        }

        let deadline = Instant::now() + self.config.rebalance_timeout;
        let mut fenced = Vec::new();
        for (member_id, revoked, ack_rx) in pending {
            let acknowledged = matches!(
                tokio::time::timeout_at(deadline, ack_rx).await,
                Ok(Ok(()))
            );
            if let Some(member) = state.members.get_mut(&member_id) {
                for partition in &revoked {
                    member.assignment.remove(partition);
                }
            }

            if acknowledged {
                for partition in &revoked {
                    self.ledger.release(group, partition, &member_id);
                }
                debug!(group, member_id = member_id.as_str(), "Revocation acknowledged");
            } else {
                warn!(
                    group,
                    member_id = member_id.as_str(),
                    timeout_ms = self.config.rebalance_timeout.as_millis() as u64,
                    "Member did not acknowledge revocation, fencing"
                );
                fenced.push(member_id);
            }
        }
        fenced
    }

    fn remove_fenced(&self, group: &str, state: &mut GroupState, member_id: &str, reason: &str) {
        if let Some(member) = state.members.remove(member_id) {
            let event = MemberEvent::Fenced {
                reason: reason.to_string(),
            };
            if member.events.send(event).is_err() {
                debug!(group, member_id, "Fenced member is already gone");
            }
        }
        self.heartbeats
            .remove(&(group.to_string(), member_id.to_string()));
        let released = self.ledger.release_member(group, member_id);

        counter!(MEMBERS_FENCED_COUNTER).increment(1);
        warn!(
            group,
            member_id,
            reason,
            released = released.len(),
            "Fenced group member"
        );
    }

    async fn load_committed(&self, group: &str, partition: &Partition) -> Option<i64> {
        let mut failures = 0;
        loop {
            match self.store.load(group, partition).await {
                Ok(committed) => return committed,
                Err(e) => {
                    failures += 1;
                    if failures >= self.config.commit_max_attempts {
                        error!(
                            group,
                            topic = partition.topic(),
                            partition = partition.partition_number(),
                            error = ?e,
                            "Could not load committed offset, assigning without one"
                        );
                        return None;
                    }
                    tokio::time::sleep(self.config.commit_backoff.delay_for(failures - 1)).await;
                }
            }
        }
    }

    fn teardown_if_empty(groups: &mut HashMap<String, GroupState>, group: &str) {
        if groups.get(group).is_some_and(|state| state.members.is_empty()) {
            groups.remove(group);
            gauge!(GROUP_MEMBERS_GAUGE, "group" => group.to_string()).set(0.0);
            info!(group, "Group is empty, membership torn down");
        }
    }
}

fn unknown_member(group: &str, member_id: &str) -> CoordinatorError {
    CoordinatorError::UnknownMember {
        group: group.to_string(),
        member_id: member_id.to_string(),
    }
}

/// `OffsetCommitter` bound to one member of one group.
#[derive(Clone)]
pub struct MemberCommitter {
    coordinator: Arc<GroupCoordinator>,
    group: String,
    member_id: String,
}

impl MemberCommitter {
    pub fn member_id(&self) -> &str {
        &self.member_id
    }
}

#[async_trait]
impl OffsetCommitter for MemberCommitter {
    async fn commit(&self, partition: &Partition, offset: i64) -> Result<(), CoordinatorError> {
        self.coordinator
            .commit(&self.group, &self.member_id, partition, offset)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::coordinator::InMemoryOffsetStore;
    use std::time::Duration;

    fn config() -> CoordinatorConfig {
        CoordinatorConfig::default()
            .with_rebalance_timeout(Duration::from_millis(200))
            .with_session_timeout(Duration::from_millis(100))
            .with_commit_backoff(
                BackoffPolicy::new(Duration::from_millis(1), 2.0, Duration::from_millis(2))
                    .without_jitter(),
            )
            .with_commit_max_attempts(3)
    }

    fn coordinator(store: Arc<InMemoryOffsetStore>) -> Arc<GroupCoordinator> {
        Arc::new(GroupCoordinator::new(config(), store).with_topic("users", 4))
    }

    fn topics() -> Vec<String> {
        vec!["users".to_string()]
    }

    async fn expect_assigned(handle: &mut MemberHandle) -> Vec<PartitionAssignment> {
        match tokio::time::timeout(Duration::from_secs(1), handle.next_event()).await {
            Ok(Some(MemberEvent::Assigned { partitions, .. })) => partitions,
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    async fn expect_revoked(handle: &mut MemberHandle) -> (Vec<Partition>, RevocationAck) {
        match tokio::time::timeout(Duration::from_secs(1), handle.next_event()).await {
            Ok(Some(MemberEvent::Revoked {
                partitions, ack, ..
            })) => (partitions, ack),
            other => panic!("expected revocation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_first_member_gets_every_partition() {
        let coordinator = coordinator(Arc::new(InMemoryOffsetStore::new()));
        let mut a = coordinator.join("azfunc", &topics()).await.unwrap();

        let assigned = expect_assigned(&mut a).await;
        assert_eq!(assigned.len(), 4);
        assert!(assigned.iter().all(|p| p.committed_offset().is_none()));
        assert_eq!(coordinator.assignment("azfunc", a.member_id()).len(), 4);
        assert_eq!(
            coordinator.member_state("azfunc", a.member_id()).await,
            MemberState::Stable
        );
        assert_eq!(coordinator.generation("azfunc").await, Some(1));
    }

    #[tokio::test]
    async fn test_revoke_completes_before_assign() {
        let coordinator = coordinator(Arc::new(InMemoryOffsetStore::new()));
        let mut a = coordinator.join("azfunc", &topics()).await.unwrap();
        expect_assigned(&mut a).await;

        let joining = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.join("azfunc", &topics()).await })
        };

        let (revoked, ack) = expect_revoked(&mut a).await;
        assert_eq!(revoked.len(), 2);
        // the joiner cannot own anything while the revocation is outstanding
        for partition in &revoked {
            assert!(coordinator
                .ledger()
                .is_owner("azfunc", partition, a.member_id()));
        }
        assert!(!joining.is_finished());

        ack.ack();
        let mut b = joining.await.unwrap().unwrap();
        let assigned = expect_assigned(&mut b).await;
        let assigned: Vec<Partition> = assigned.iter().map(|p| p.partition().clone()).collect();
        assert_eq!(assigned, revoked);

        let mut owned_a = coordinator.assignment("azfunc", a.member_id());
        let owned_b = coordinator.assignment("azfunc", b.member_id());
        assert_eq!(owned_a.len() + owned_b.len(), 4);
        owned_a.retain(|p| owned_b.contains(p));
        assert!(owned_a.is_empty());
    }

    #[tokio::test]
    async fn test_unacknowledged_revocation_fences_member() {
        let store = Arc::new(InMemoryOffsetStore::new());
        let coordinator = coordinator(store.clone());
        let mut a = coordinator.join("azfunc", &topics()).await.unwrap();
        expect_assigned(&mut a).await;

        let mut b = coordinator.join("azfunc", &topics()).await.unwrap();

        // a held on to its ack past the rebalance timeout
        let (_revoked, _ack) = expect_revoked(&mut a).await;
        match a.next_event().await {
            Some(MemberEvent::Fenced { reason }) => assert!(reason.contains("rebalance timeout")),
            other => panic!("expected fencing, got {other:?}"),
        }

        assert_eq!(expect_assigned(&mut b).await.len(), 4);
        assert_eq!(
            coordinator.member_state("azfunc", a.member_id()).await,
            MemberState::Left
        );

        let result = coordinator
            .commit("azfunc", a.member_id(), &Partition::new("users", 0), 10)
            .await;
        assert!(matches!(result, Err(CoordinatorError::CommitFailed { .. })));
        assert_eq!(store.get("azfunc", &Partition::new("users", 0)), None);
    }

    #[tokio::test]
    async fn test_commit_is_monotonic() {
        let store = Arc::new(InMemoryOffsetStore::new());
        let coordinator = coordinator(store.clone());
        let a = coordinator.join("azfunc", &topics()).await.unwrap();
        let partition = Partition::new("users", 1);
        let committer = coordinator.committer(&a);

        committer.commit(&partition, 5).await.unwrap();
        committer.commit(&partition, 3).await.unwrap();
        assert_eq!(store.get("azfunc", &partition), Some(5));
        committer.commit(&partition, 5).await.unwrap();
        committer.commit(&partition, 9).await.unwrap();
        assert_eq!(store.get("azfunc", &partition), Some(9));
    }

    #[tokio::test]
    async fn test_commit_by_non_owner_fails() {
        let coordinator = coordinator(Arc::new(InMemoryOffsetStore::new()));
        coordinator.join("azfunc", &topics()).await.unwrap();

        let result = coordinator
            .commit("azfunc", "stranger", &Partition::new("users", 0), 1)
            .await;
        assert!(matches!(result, Err(CoordinatorError::CommitFailed { offset: 1, .. })));
    }

    #[tokio::test]
    async fn test_commit_retries_transient_store_failures() {
        let store = Arc::new(InMemoryOffsetStore::new());
        let coordinator = coordinator(store.clone());
        let a = coordinator.join("azfunc", &topics()).await.unwrap();
        let partition = Partition::new("users", 2);

        store.fail_next_writes(2);
        coordinator
            .commit("azfunc", a.member_id(), &partition, 12)
            .await
            .unwrap();
        assert_eq!(store.get("azfunc", &partition), Some(12));

        store.fail_next_writes(10);
        let result = coordinator
            .commit("azfunc", a.member_id(), &partition, 13)
            .await;
        assert!(matches!(result, Err(CoordinatorError::CommitFailed { offset: 13, .. })));
        assert_eq!(store.get("azfunc", &partition), Some(12));
    }

    #[tokio::test]
    async fn test_leave_hands_partitions_over_and_rejoin_resumes() {
        let store = Arc::new(InMemoryOffsetStore::new());
        let coordinator = coordinator(store.clone());
        let mut a = coordinator.join("azfunc", &topics()).await.unwrap();
        expect_assigned(&mut a).await;
        coordinator
            .commit("azfunc", a.member_id(), &Partition::new("users", 0), 12)
            .await
            .unwrap();

        let acker = tokio::spawn(async move {
            let (_, ack) = expect_revoked(&mut a).await;
            ack.ack();
            a
        });
        let mut b = coordinator.join("azfunc", &topics()).await.unwrap();
        let a = acker.await.unwrap();
        expect_assigned(&mut b).await;

        coordinator.leave("azfunc", a.member_id()).await.unwrap();
        let resumed = expect_assigned(&mut b).await;
        let p0 = resumed
            .iter()
            .find(|p| p.partition_number() == 0)
            .expect("partition 0 moves to b");
        assert_eq!(p0.committed_offset(), Some(12));
        assert_eq!(p0.start_offset(0), 13);
        assert_eq!(coordinator.assignment("azfunc", b.member_id()).len(), 4);

        coordinator.leave("azfunc", b.member_id()).await.unwrap();
        assert_eq!(coordinator.generation("azfunc").await, None);
        assert_eq!(coordinator.ledger().owned_count("azfunc"), 0);
        // offsets outlive the membership
        assert_eq!(store.get("azfunc", &Partition::new("users", 0)), Some(12));

        assert_eq!(
            coordinator.leave("azfunc", b.member_id()).await,
            Err(CoordinatorError::UnknownMember {
                group: "azfunc".to_string(),
                member_id: b.member_id().to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_halted_partition_is_not_reassigned_until_resumed() {
        let coordinator = coordinator(Arc::new(InMemoryOffsetStore::new()));
        let halted = Partition::new("users", 1);
        let mut a = coordinator.join("azfunc", &topics()).await.unwrap();
        expect_assigned(&mut a).await;

        coordinator.halt("azfunc", &halted, "delivery failed");
        assert_eq!(
            coordinator.halted("azfunc").get(&halted).map(String::as_str),
            Some("delivery failed")
        );
        // still owned, idle, until the next rebalance
        assert!(coordinator.ledger().is_owner("azfunc", &halted, a.member_id()));

        let acker = tokio::spawn(async move {
            let (revoked, ack) = expect_revoked(&mut a).await;
            ack.ack();
            (a, revoked)
        });
        let mut b = coordinator.join("azfunc", &topics()).await.unwrap();
        let (a, revoked) = acker.await.unwrap();
        assert!(revoked.contains(&halted));

        let assigned = expect_assigned(&mut b).await;
        assert!(assigned.iter().all(|p| p.partition() != &halted));
        assert!(coordinator.ledger().owner("azfunc", &halted).is_none());
        assert_eq!(coordinator.ledger().owned_count("azfunc"), 3);

        assert!(coordinator.resume("azfunc", &halted).await);
        assert!(coordinator.halted("azfunc").is_empty());
        let owner = coordinator
            .ledger()
            .owner("azfunc", &halted)
            .expect("resumed partition has an owner");
        assert!(owner.member_id == a.member_id() || owner.member_id == b.member_id());
        assert_eq!(coordinator.ledger().owned_count("azfunc"), 4);

        assert!(!coordinator.resume("azfunc", &halted).await);
    }

    #[tokio::test]
    async fn test_reaper_expires_silent_members() {
        let coordinator = coordinator(Arc::new(InMemoryOffsetStore::new()));
        let shutdown = CancellationToken::new();
        let reaper = coordinator.spawn_reaper(shutdown.clone());

        let mut a = coordinator.join("azfunc", &topics()).await.unwrap();
        expect_assigned(&mut a).await;

        // a never heartbeats
        match tokio::time::timeout(Duration::from_secs(2), a.next_event()).await {
            Ok(Some(MemberEvent::Fenced { reason })) => assert_eq!(reason, "session timeout"),
            other => panic!("expected fencing, got {other:?}"),
        }
        assert!(coordinator.heartbeat("azfunc", a.member_id()).is_err());
        assert_eq!(coordinator.ledger().owned_count("azfunc"), 0);

        shutdown.cancel();
        reaper.await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeats_keep_member_alive() {
        let coordinator = coordinator(Arc::new(InMemoryOffsetStore::new()));
        let a = coordinator.join("azfunc", &topics()).await.unwrap();

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            coordinator.heartbeat("azfunc", a.member_id()).unwrap();
            assert_eq!(coordinator.reap_expired().await, 0);
        }
        assert_eq!(coordinator.members("azfunc").await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_topic_and_member() {
        let coordinator = coordinator(Arc::new(InMemoryOffsetStore::new()));

        assert_eq!(
            coordinator
                .join("azfunc", &["PAGEVIEWS_FEMALE".to_string()])
                .await
                .err(),
            Some(CoordinatorError::UnknownTopic("PAGEVIEWS_FEMALE".to_string()))
        );
        assert!(matches!(
            coordinator.heartbeat("azfunc", "nobody"),
            Err(CoordinatorError::UnknownMember { .. })
        ));
    }
}
