use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use kafka_trigger::{
    GroupCoordinator, InMemoryOffsetStore, SchemaResolver, TcpConnector, TriggerHost,
};
use trigger_samples::{config::Config, samples};

fn log_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy()
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG overrides the default INFO level
    let log_layer = tracing_subscriber::fmt::layer().with_filter(log_filter());
    tracing_subscriber::registry().with(log_layer).init();

    info!("Starting trigger samples");

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;
    info!("Configuration loaded: {:?}", config);

    let coordinator = GroupCoordinator::new(
        config.coordinator_config(),
        Arc::new(InMemoryOffsetStore::new()),
    );
    for (topic, partitions) in config.topic_partitions()? {
        coordinator.register_topic(topic, partitions);
    }

    let resolver = Arc::new(SchemaResolver::new());
    let connector = Arc::new(TcpConnector::from_host_list(&config.kafka_hosts));
    let mut host = TriggerHost::new(
        Arc::new(coordinator),
        resolver.clone(),
        connector,
        config.host_config(),
    );
    for binding in samples::bindings(&resolver) {
        host.register(binding)
            .context("Failed to register sample binding")?;
    }

    host.run_until(shutdown_signal()).await
}
