use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::consumer::{ConsumerConfig, TriggerConsumer};
use crate::coordinator::GroupCoordinator;
use crate::dispatch::{PartitionOutcome, PartitionReport, TriggerBinding};
use crate::error::TriggerError;
use crate::fetcher::Connector;
use crate::schema::SchemaResolver;
use crate::types::Partition;

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub consumer: ConsumerConfig,
    /// Upper bound for draining consumers once shutdown starts
    pub shutdown_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            consumer: ConsumerConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl HostConfig {
    pub fn with_consumer(mut self, consumer: ConsumerConfig) -> Self {
        self.consumer = consumer;
        self
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }
}

/// Owns the shared runtime pieces and runs one consumer per registered
/// binding.
pub struct TriggerHost {
    coordinator: Arc<GroupCoordinator>,
    resolver: Arc<SchemaResolver>,
    connector: Arc<dyn Connector>,
    config: HostConfig,
    bindings: BTreeMap<String, Arc<TriggerBinding>>,
}

impl TriggerHost {
    pub fn new(
        coordinator: Arc<GroupCoordinator>,
        resolver: Arc<SchemaResolver>,
        connector: Arc<dyn Connector>,
        config: HostConfig,
    ) -> Self {
        Self {
            coordinator,
            resolver,
            connector,
            config,
            bindings: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, binding: TriggerBinding) -> Result<(), TriggerError> {
        if self.bindings.contains_key(binding.name()) {
            return Err(TriggerError::DuplicateBinding(binding.name().to_string()));
        }
        info!(
            binding = binding.name(),
            topic = binding.topic(),
            group = binding.group(),
            mode = ?binding.mode(),
            style = ?binding.style(),
            "Registered trigger binding"
        );
        self.bindings
            .insert(binding.name().to_string(), Arc::new(binding));
        Ok(())
    }

    pub fn bindings(&self) -> impl Iterator<Item = &TriggerBinding> {
        self.bindings.values().map(Arc::as_ref)
    }

    pub fn coordinator(&self) -> &Arc<GroupCoordinator> {
        &self.coordinator
    }

    pub fn resolver(&self) -> &Arc<SchemaResolver> {
        &self.resolver
    }

    /// Spawn the membership reaper and one consumer task per binding.
    pub fn start(self) -> RunningHost {
        let shutdown = CancellationToken::new();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let reaper = self.coordinator.spawn_reaper(shutdown.child_token());

        let consumers = self
            .bindings
            .into_values()
            .map(|binding| {
                let name = binding.name().to_string();
                let consumer = TriggerConsumer::new(
                    binding,
                    self.coordinator.clone(),
                    self.resolver.clone(),
                    self.connector.clone(),
                    self.config.consumer.clone(),
                    reports_tx.clone(),
                );
                let handle = tokio::spawn(consumer.run(shutdown.child_token()));
                (name, handle)
            })
            .collect::<Vec<_>>();
        info!(consumers = consumers.len(), "Trigger host started");

        RunningHost {
            shutdown,
            consumers,
            reaper,
            reports: reports_rx,
            halted: BTreeMap::new(),
            shutdown_timeout: self.config.shutdown_timeout,
        }
    }

    /// Run until `signal` resolves, then shut down gracefully.
    pub async fn run_until(self, signal: impl Future<Output = ()>) -> anyhow::Result<()> {
        let mut running = self.start();
        tokio::pin!(signal);
        loop {
            tokio::select! {
                _ = &mut signal => break,
                Some(report) = running.reports.recv() => running.record(&report),
            }
        }
        info!("Shutdown requested");
        running.shutdown().await
    }
}

/// A started host. Collects partition reports until shut down.
pub struct RunningHost {
    shutdown: CancellationToken,
    consumers: Vec<(String, JoinHandle<anyhow::Result<()>>)>,
    reaper: JoinHandle<()>,
    reports: mpsc::UnboundedReceiver<PartitionReport>,
    halted: BTreeMap<(String, Partition), String>,
    shutdown_timeout: Duration,
}

impl RunningHost {
    /// Wait for the next report from a dispatch loop.
    pub async fn next_report(&mut self) -> Option<PartitionReport> {
        let report = self.reports.recv().await?;
        self.record(&report);
        Some(report)
    }

    /// Partitions halted so far, with the error that halted them.
    pub fn halted(&self) -> &BTreeMap<(String, Partition), String> {
        &self.halted
    }

    fn record(&mut self, report: &PartitionReport) {
        match &report.outcome {
            PartitionOutcome::Stopped => debug!(
                binding = report.binding.as_str(),
                partition = %report.partition,
                committed = report.committed,
                "Dispatch loop finished"
            ),
            PartitionOutcome::Halted(e) => {
                error!(
                    binding = report.binding.as_str(),
                    partition = %report.partition,
                    committed = report.committed,
                    error = %e,
                    "Partition halted"
                );
                self.halted
                    .insert((report.binding.clone(), report.partition.clone()), e.to_string());
            }
        }
    }

    /// Stop fetching, let in-flight handler calls finish and commit, then
    /// leave every group.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        self.shutdown.cancel();

        let consumers = std::mem::take(&mut self.consumers);
        let names: Vec<String> = consumers.iter().map(|(name, _)| name.clone()).collect();
        let results = tokio::time::timeout(
            self.shutdown_timeout,
            join_all(consumers.into_iter().map(|(_, handle)| handle)),
        )
        .await
        .context("consumers did not stop within the shutdown timeout")?;

        let mut failed = 0;
        for (name, result) in names.iter().zip(results) {
            match result {
                Ok(Ok(())) => debug!(binding = name.as_str(), "Consumer stopped"),
                Ok(Err(e)) => {
                    failed += 1;
                    error!(binding = name.as_str(), error = ?e, "Consumer failed");
                }
                Err(e) => {
                    failed += 1;
                    error!(binding = name.as_str(), error = %e, "Consumer task panicked");
                }
            }
        }

        if let Err(e) = (&mut self.reaper).await {
            warn!(error = %e, "Group reaper panicked");
        }
        while let Ok(report) = self.reports.try_recv() {
            self.record(&report);
        }

        info!(
            halted = self.halted.len(),
            failed_consumers = failed,
            "Trigger host stopped"
        );
        if failed > 0 {
            anyhow::bail!("{failed} consumer(s) failed");
        }
        Ok(())
    }
}
