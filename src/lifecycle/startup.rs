//! Startup orchestration.
//!
//! # Responsibilities
//! - Load and validate configuration
//! - Initialize logging and metrics, then the secure configuration
//! - Start the container and the config reload task
//! - Run the ordered shutdown once a signal arrives
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - The listener starts last (traffic only when ready)
//! - Reloads replace the handshake template only; listener settings need a restart

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::config::loader::{load_config, ConfigError};
use crate::config::watcher::ConfigWatcher;
use crate::config::TransportConfig;
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::signals::wait_for_signal;
use crate::net::configuration::Role;
use crate::net::connection::CloseReason;
use crate::net::container::{ContainerError, SecureConnectionContainer};
use crate::net::engine::PacketEngine;
use crate::net::tls::CredentialError;
use crate::observability::{logging, metrics};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to initialise logging: {0}")]
    Logging(#[from] tracing_subscriber::util::TryInitError),

    #[error("Failed to start metrics exporter: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("Invalid listen address `{0}`")]
    InvalidAddress(String),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error("Signal handling failed: {0}")]
    Signal(#[from] std::io::Error),
}

/// Run a secure transport server from the configuration file at `config_path`
/// until SIGINT or SIGTERM.
pub async fn run(config_path: &Path, engine: Arc<dyn PacketEngine>) -> Result<(), StartupError> {
    let config = load_config(config_path)?;
    logging::init_logging(&config.observability.log_level, config.observability.log_format)?;

    tracing::info!(
        address = %config.listener.address,
        port = config.listener.port,
        max_connections = config.listener.max_connections,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let configuration = Arc::new(config.tls.to_configuration(Role::Server)?);
    let address: IpAddr = config
        .listener
        .address
        .parse()
        .map_err(|_| StartupError::InvalidAddress(config.listener.address.clone()))?;
    let container = SecureConnectionContainer::create_with_limit(
        address,
        config.listener.port,
        config.listener.max_connections,
        configuration,
        engine,
        true,
    )
    .await?;

    let shutdown = Shutdown::new();
    let (watcher, updates) = ConfigWatcher::new(config_path);
    let _watcher = match watcher.run() {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            tracing::warn!(error = %err, "Config watcher unavailable, hot reload disabled");
            None
        }
    };
    let reload = tokio::spawn(apply_reloads(
        container.clone(),
        updates,
        shutdown.subscribe(),
    ));

    wait_for_signal().await?;

    shutdown.trigger();
    container.stop().await;
    container.close_connections(CloseReason::ServerShutdown).await;
    if let Err(err) = reload.await {
        tracing::debug!(error = %err, "Reload task ended abnormally");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn apply_reloads(
    container: SecureConnectionContainer,
    mut updates: mpsc::UnboundedReceiver<TransportConfig>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let update = tokio::select! {
            _ = shutdown.recv() => break,
            update = updates.recv() => update,
        };
        let Some(update) = update else {
            break;
        };
        match update.tls.to_configuration(Role::Server) {
            Ok(configuration) => container.replace_configuration(Arc::new(configuration)),
            Err(err) => tracing::error!(
                error = %err,
                "Reloaded TLS settings rejected. Keeping current configuration."
            ),
        }
    }
}
