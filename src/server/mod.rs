//! Server module for Runbus
//!
//! Builds brokers and workers from configuration and runs the worker
//! process.
//!
//! # Module Structure
//!
//! - `config`: Configuration structures
//! - `loader`: Configuration loading from files and environment

pub mod config;
mod loader;

use anyhow::Result;
use runbus_bus::{InMemoryBroker, MessagingTemplate, RedisTemplate};
use runbus_core::worker::plans::default_context;
use runbus_core::{format_error_for_cli, PlanWorker};
use runbus_service::{BridgeHandle, WorkerBridge};
use std::sync::Arc;
use tracing::{info, warn};

use self::config::{AppConfig, BrokerConfig, BrokerKind};

pub use loader::load_config;

/// Broker selected by configuration.
#[derive(Debug, Clone)]
pub enum Broker {
    /// Shared in-process broker
    Memory(InMemoryBroker),
    /// Redis at the given URL
    Redis(String),
}

impl Broker {
    pub fn from_config(config: &BrokerConfig) -> Self {
        match config.kind {
            BrokerKind::Memory => Broker::Memory(InMemoryBroker::new()),
            BrokerKind::Redis => Broker::Redis(config.url.clone()),
        }
    }

    /// A new, disconnected connection to the broker.
    pub fn template(&self) -> runbus_core::Result<Arc<dyn MessagingTemplate>> {
        Ok(match self {
            Broker::Memory(broker) => Arc::new(broker.template()),
            Broker::Redis(url) => Arc::new(RedisTemplate::new(url)?),
        })
    }
}

/// Start a worker and its bridge on `broker`.
pub async fn start_worker(
    broker: &Broker,
    config: &AppConfig,
) -> runbus_core::Result<BridgeHandle> {
    let worker = Arc::new(PlanWorker::new(
        Arc::new(default_context()),
        config.worker.to_worker_config(),
    ));
    WorkerBridge::new(worker, broker.template()?).start().await
}

/// Run the worker until Ctrl+C or SIGTERM.
pub async fn run(config: AppConfig) -> Result<()> {
    let broker = Broker::from_config(&config.broker);
    if let Broker::Memory(_) = broker {
        warn!("Using the in-memory broker; only this process can reach the worker");
    }

    let bridge = match start_worker(&broker, &config).await {
        Ok(bridge) => bridge,
        Err(e) => {
            eprintln!("{}", format_error_for_cli(&e));
            return Ok(());
        }
    };
    info!(
        "Runbus worker v{} ready on {:?} broker",
        env!("CARGO_PKG_VERSION"),
        config.broker.kind
    );

    wait_for_shutdown_signal().await;
    bridge.stop().await?;
    info!("Runbus worker stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
