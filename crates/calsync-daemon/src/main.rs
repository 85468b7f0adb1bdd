//! calsync Daemon - Background synchronization service
//!
//! This binary runs as a user service and handles:
//! - Loading and validating the YAML configuration
//! - Opening the SQLite state store
//! - Scheduling source passes and on-demand triggers
//! - Serving pushed agent batches to relayed sources
//! - Graceful shutdown on SIGTERM/SIGINT
//!
//! # Architecture
//!
//! The daemon is the composition root: it wires the state store, the
//! keyring credential provider and the agent channel's feed into a
//! `SyncController`, then hands the controller to a `SyncScheduler` whose
//! run loop lasts until a `CancellationToken` is triggered by a signal.

mod credentials;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use calsync_cache::{DatabasePool, SqliteStateStore};
use calsync_core::config::{Config, LoggingConfig};
use calsync_core::ports::{ICredentialProvider, IEventFeed, ISyncStateStore, ProviderRegistry};
use calsync_relay::AgentChannel;
use calsync_sync::{SyncController, SyncScheduler};

use crate::credentials::KeyringCredentialProvider;

// ============================================================================
// DaemonService
// ============================================================================

/// Main daemon service that wires the controller and runs the scheduler
struct DaemonService {
    /// Application configuration loaded from YAML
    config: Config,
    /// SQLite state store shared by the controller and the agent channel
    store: Arc<SqliteStateStore>,
    /// Receives agent pushes for relayed sources
    channel: Arc<AgentChannel>,
    /// Token for signalling graceful shutdown to all async tasks
    shutdown: CancellationToken,
}

impl DaemonService {
    /// Validates the configuration and opens the state database
    async fn new(config: Config, shutdown: CancellationToken) -> Result<Self> {
        let problems = config.validate();
        if !problems.is_empty() {
            for problem in &problems {
                error!(%problem, "Invalid configuration");
            }
            anyhow::bail!("configuration has {} invalid field(s)", problems.len());
        }

        let db_pool = DatabasePool::new(&config.storage.database)
            .await
            .context("Failed to open state database")?;
        let store = Arc::new(SqliteStateStore::new(db_pool.pool().clone()));
        let channel = Arc::new(AgentChannel::new(
            Arc::clone(&store) as Arc<dyn ISyncStateStore>,
            &config.relay,
        ));

        Ok(Self {
            config,
            store,
            channel,
            shutdown,
        })
    }

    /// Runs the scheduler until shutdown
    async fn run(&self) -> Result<()> {
        let sync_config = self
            .store
            .get_configuration()
            .await
            .context("Failed to read sync configuration")?;
        info!(
            sources = sync_config.sources.len(),
            enabled = sync_config.enabled_sources().count(),
            agents = sync_config.agents.len(),
            destination = sync_config.destination.is_some(),
            "Loaded sync configuration"
        );
        if sync_config.destination.is_none() {
            warn!("No destination configured; passes fail until one is set");
        }
        self.report_agents().await;

        // No provider adapters ship with the daemon; relayed sources still sync
        let controller = SyncController::new(
            Arc::clone(&self.store) as Arc<dyn ISyncStateStore>,
            ProviderRegistry::new(),
            Arc::new(KeyringCredentialProvider::new()) as Arc<dyn ICredentialProvider>,
            &self.config,
        )
        .with_feed(Arc::new(self.channel.feed()) as Arc<dyn IEventFeed>)
        .with_shutdown(self.shutdown.child_token());

        let scheduler = SyncScheduler::new(Arc::new(controller), &self.config).with_health_probe();
        scheduler.run(self.shutdown.clone()).await;

        info!("Scheduler stopped");
        Ok(())
    }

    async fn report_agents(&self) {
        match self.channel.agent_health(chrono::Utc::now()).await {
            Ok(health) => {
                for agent in health.iter().filter(|a| a.is_stale()) {
                    warn!(
                        agent = %agent.agent_id,
                        name = %agent.name,
                        source = %agent.source_id,
                        "Agent has not checked in recently"
                    );
                }
            }
            Err(e) => warn!(error = %e, "Failed to read agent registrations"),
        }
    }
}

// ============================================================================
// Logging
// ============================================================================

/// `RUST_LOG` wins over the configured level
fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = env_filter(&logging.level);
    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

// ============================================================================
// Graceful shutdown signal handler
// ============================================================================

/// Waits for SIGTERM or SIGINT and triggers the cancellation token
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }

    token.cancel();
}

// ============================================================================
// Main entry point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = Config::default_path();
    let config = Config::load_or_default(&config_path);
    init_tracing(&config.logging);

    info!(config_path = %config_path.display(), "calsync daemon starting (calsyncd)");

    let shutdown_token = CancellationToken::new();

    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        shutdown_signal(signal_token).await;
    });

    let service = DaemonService::new(config, shutdown_token.clone()).await?;
    let result = service.run().await;

    match &result {
        Ok(()) => info!("calsync daemon shut down gracefully"),
        Err(e) => error!(error = %e, "calsync daemon exiting with error"),
    }

    result
}

// ============================================================================
// Tests
// ============================================================================
