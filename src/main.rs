//! Commit Coordinator - two-phase commit across independently-owned data stores
//!
//! Serves the orchestrator API, finishes transactions a previous run left
//! unfinished, and keeps sweeping the log for stalled ones.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio::time::Duration;
use tracing::{error, info, warn};

use commit_coordinator::api::{self, AppState};
use commit_coordinator::config::{LogBackend, Settings};
use commit_coordinator::coordination::{Coordinator, RecoveryManager};
use commit_coordinator::metrics::MetricsServer;
use commit_coordinator::orchestrator::Orchestrator;
use commit_coordinator::participant::{ParticipantRegistry, RetryPolicy};
use commit_coordinator::txlog::{MemoryTransactionLog, PgTransactionLog, TransactionLog};

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Commit Coordinator v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} participant(s)",
        settings.enabled_participants().len()
    );

    // Initialize the transaction log
    let log: Arc<dyn TransactionLog> = match settings.database.backend {
        LogBackend::Postgres => {
            let log = PgTransactionLog::new(&settings.database).await?;
            log.run_migrations().await?;
            info!("Transaction log ready (postgres)");
            Arc::new(log)
        }
        LogBackend::Memory => {
            warn!("Using in-memory transaction log; nothing survives a restart");
            Arc::new(MemoryTransactionLog::new())
        }
    };

    // Connect participants
    let registry = Arc::new(ParticipantRegistry::from_config(settings.enabled_participants()).await?);
    info!("Participants registered: {:?}", registry.ids());

    let coordinator = Coordinator::new(
        log.clone(),
        registry.clone(),
        RetryPolicy::from(&settings.retry),
        settings.coordinator.clone(),
    );
    let recovery = Arc::new(RecoveryManager::new(
        coordinator.clone(),
        settings.recovery.clone(),
    ));

    // Finish whatever the previous run left behind before taking new work
    let report = recovery.recover_all().await?;
    if report.errors > 0 {
        warn!("Startup recovery left {} transaction(s) unresolved", report.errors);
    }

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = AppState::new(Orchestrator::new(coordinator.clone()));
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start recovery sweeps
    let recovery_handle = if settings.recovery.enabled {
        let recovery = recovery.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = recovery.run().await {
                error!("Recovery manager error: {}", e);
            }
        }))
    } else {
        None
    };

    // Health check loop
    let health_handle = tokio::spawn({
        let registry = registry.clone();
        let log = log.clone();
        async move {
            loop {
                tokio::time::sleep(HEALTH_CHECK_INTERVAL).await;

                for (participant, healthy) in registry.health_check().await {
                    if !healthy {
                        warn!("Participant {} health check failed", participant);
                    }
                }

                if let Err(e) = log.health_check().await {
                    warn!("Transaction log health check failed: {}", e);
                }
            }
        }
    });

    info!("Commit Coordinator is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    recovery.stop().await;

    // Abort background tasks
    api_handle.abort();
    health_handle.abort();
    if let Some(h) = recovery_handle {
        h.abort();
    }
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Commit Coordinator stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,commit_coordinator=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
