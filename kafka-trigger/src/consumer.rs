//! One consumer group member per trigger binding.
//!
//! The consumer turns membership events into dispatch loops: an assignment
//! spawns a loop per partition, a revocation stops those loops (each finishes
//! and commits its in-flight batch) before the revocation is acknowledged. That
//! ordering is what keeps two members from fetching the same partition.
//!
//! A loop halted by a fetch or delivery failure halts its partition for the
//! whole group: the coordinator keeps it out of later assignments until it is
//! resumed. A loop halted by a failed commit only idles; whoever owns the
//! partition next starts again from the committed offset.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordinator::{GroupCoordinator, MemberEvent, MemberHandle, OffsetCommitter};
use crate::dispatch::{
    DeliveryConfig, DispatchLoop, PartitionOutcome, PartitionReport, TriggerBinding,
};
use crate::error::TriggerError;
use crate::fetcher::{Connector, FetchConfig, PartitionFetcher};
use crate::schema::SchemaResolver;
use crate::types::{Partition, PartitionAssignment};

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub heartbeat_interval: Duration,
    pub fetch: FetchConfig,
    pub delivery: DeliveryConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(3),
            fetch: FetchConfig::default(),
            delivery: DeliveryConfig::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn with_heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    pub fn with_fetch(mut self, fetch: FetchConfig) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryConfig) -> Self {
        self.delivery = delivery;
        self
    }
}

struct PartitionWorker {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl PartitionWorker {
    async fn shutdown(self, partition: Partition) {
        self.stop.cancel();
        if let Err(e) = self.handle.await {
            warn!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                error = %e,
                "Dispatch loop panicked during shutdown"
            );
        }
    }
}

enum Exit {
    Shutdown,
    Fenced,
}

pub struct TriggerConsumer {
    binding: Arc<TriggerBinding>,
    coordinator: Arc<GroupCoordinator>,
    resolver: Arc<SchemaResolver>,
    connector: Arc<dyn Connector>,
    config: ConsumerConfig,
    reports: mpsc::UnboundedSender<PartitionReport>,
    workers: HashMap<Partition, PartitionWorker>,
}

impl TriggerConsumer {
    pub fn new(
        binding: Arc<TriggerBinding>,
        coordinator: Arc<GroupCoordinator>,
        resolver: Arc<SchemaResolver>,
        connector: Arc<dyn Connector>,
        config: ConsumerConfig,
        reports: mpsc::UnboundedSender<PartitionReport>,
    ) -> Self {
        Self {
            binding,
            coordinator,
            resolver,
            connector,
            config,
            reports,
            workers: HashMap::new(),
        }
    }

    pub fn binding(&self) -> &TriggerBinding {
        &self.binding
    }

    /// Join the binding's group and deliver until `shutdown` fires. A fenced
    /// member stops its loops and joins again under a new member id.
    pub async fn run(mut self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let topics = vec![self.binding.topic().to_string()];
        loop {
            let mut member = self
                .coordinator
                .join(self.binding.group(), &topics)
                .await
                .with_context(|| format!("binding {} could not join its group", self.binding.name()))?;
            info!(
                binding = self.binding.name(),
                group = self.binding.group(),
                member_id = member.member_id(),
                "Consumer joined group"
            );
            let committer: Arc<dyn OffsetCommitter> = Arc::new(self.coordinator.committer(&member));

            match self.consume(&mut member, committer, &shutdown).await {
                Exit::Shutdown => {
                    self.stop_all().await;
                    self.leave(&mut member).await?;
                    return Ok(());
                }
                Exit::Fenced => {
                    self.stop_all().await;
                    if shutdown.is_cancelled() {
                        return Ok(());
                    }
                    warn!(
                        binding = self.binding.name(),
                        group = self.binding.group(),
                        "Rejoining group after being fenced"
                    );
                }
            }
        }
    }

    async fn consume(
        &mut self,
        member: &mut MemberHandle,
        committer: Arc<dyn OffsetCommitter>,
        shutdown: &CancellationToken,
    ) -> Exit {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Exit::Shutdown,
                event = member.next_event() => match event {
                    Some(MemberEvent::Assigned { generation, partitions }) => {
                        debug!(
                            binding = self.binding.name(),
                            generation,
                            assigned = partitions.len(),
                            "Partitions assigned"
                        );
                        for assignment in partitions {
                            self.start_worker(assignment, committer.clone());
                        }
                    }
                    Some(MemberEvent::Revoked { generation, partitions, ack }) => {
                        debug!(
                            binding = self.binding.name(),
                            generation,
                            revoked = partitions.len(),
                            "Partitions revoked"
                        );
                        self.stop_workers(&partitions).await;
                        ack.ack();
                    }
                    Some(MemberEvent::Fenced { reason }) => {
                        warn!(
                            binding = self.binding.name(),
                            member_id = member.member_id(),
                            reason = reason.as_str(),
                            "Consumer was fenced"
                        );
                        return Exit::Fenced;
                    }
                    None => {
                        error!(binding = self.binding.name(), "Member event stream closed");
                        return Exit::Fenced;
                    }
                },
                _ = heartbeat.tick() => {
                    if let Err(e) = self.coordinator.heartbeat(member.group(), member.member_id()) {
                        // the fencing event follows
                        warn!(binding = self.binding.name(), error = %e, "Heartbeat rejected");
                    }
                }
            }
        }
    }

    fn start_worker(&mut self, assignment: PartitionAssignment, committer: Arc<dyn OffsetCommitter>) {
        let partition = assignment.partition().clone();
        let start = assignment.start_offset(self.config.fetch.default_start_offset);
        if self.workers.contains_key(&partition) {
            warn!(
                binding = self.binding.name(),
                topic = partition.topic(),
                partition = partition.partition_number(),
                "Partition assigned twice, keeping the running dispatch loop"
            );
            return;
        }

        let fetcher = PartitionFetcher::start(
            partition.clone(),
            start,
            self.connector.clone(),
            self.config.fetch.clone(),
        );
        let dispatch = DispatchLoop::new(
            self.binding.clone(),
            fetcher,
            self.resolver.clone(),
            committer,
            self.config.delivery.clone(),
        );

        let stop = CancellationToken::new();
        let token = stop.clone();
        let reports = self.reports.clone();
        let coordinator = self.coordinator.clone();
        let group = self.binding.group().to_string();
        let handle = tokio::spawn(async move {
            let report = dispatch.run(token.clone()).await;
            let halted = report.is_halted();
            if let PartitionOutcome::Halted(
                e @ (TriggerError::Fetch(_) | TriggerError::Delivery(_)),
            ) = &report.outcome
            {
                coordinator.halt(&group, &report.partition, e.to_string());
            }
            if reports.send(report).is_err() {
                debug!("Partition report dropped, nobody is listening");
            }
            if halted {
                // keep the partition idle until it is revoked
                token.cancelled().await;
            }
        });
        self.workers.insert(partition, PartitionWorker { stop, handle });
    }

    async fn stop_workers(&mut self, partitions: &[Partition]) {
        let stopping: Vec<_> = partitions
            .iter()
            .filter_map(|partition| {
                self.workers
                    .remove(partition)
                    .map(|worker| worker.shutdown(partition.clone()))
            })
            .collect();
        join_all(stopping).await;
    }

    async fn stop_all(&mut self) {
        let stopping: Vec<_> = self
            .workers
            .drain()
            .map(|(partition, worker)| worker.shutdown(partition))
            .collect();
        if !stopping.is_empty() {
            info!(
                binding = self.binding.name(),
                workers = stopping.len(),
                "Stopping dispatch loops"
            );
        }
        join_all(stopping).await;
    }

    /// Leave the group while still answering revocations. A rebalance started
    /// by another member can be waiting on us, and it holds the membership
    /// lock our leave needs.
    async fn leave(&self, member: &mut MemberHandle) -> anyhow::Result<()> {
        let group = member.group().to_string();
        let member_id = member.member_id().to_string();
        let leaving = self.coordinator.leave(&group, &member_id);
        tokio::pin!(leaving);
        loop {
            tokio::select! {
                result = &mut leaving => {
                    result.with_context(|| format!("binding {} could not leave its group", self.binding.name()))?;
                    info!(
                        binding = self.binding.name(),
                        group = self.binding.group(),
                        "Consumer left group"
                    );
                    return Ok(());
                }
                Some(event) = member.next_event() => {
                    if let MemberEvent::Revoked { ack, .. } = event {
                        // nothing runs any more
                        ack.ack();
                    }
                }
            }
        }
    }
}
