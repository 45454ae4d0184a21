//! NLU Manager - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use nlu_manager::{
    BotRegistry, ModelRepository, NluService, QueueOptions, RemoteEngine, StateManager,
    TrainSessionStore, TrainingQueue, api, config::ServerConfig, metrics,
    queue::{FileJobStore, FileLeaseLock},
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "nlu-manager")]
#[command(about = "Multi-tenant NLU training orchestrator and model server", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override API port
    #[arg(long)]
    port: Option<u16>,

    /// Override engine worker URL
    #[arg(long)]
    engine_url: Option<String>,

    /// Override model directory
    #[arg(long)]
    model_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
    }

    tracing::info!("Starting NLU Manager");

    // Load configuration
    let mut config = ServerConfig::load(cli.config)?;

    // CLI overrides
    if let Some(port) = cli.port {
        config.api_port = port;
    }
    if let Some(engine_url) = cli.engine_url {
        config.engine_url = engine_url;
    }
    if let Some(model_dir) = cli.model_dir {
        config.model_dir = model_dir;
    }

    config.validate()?;

    tracing::info!(
        api_port = config.api_port,
        model_dir = ?config.model_dir,
        state_file = ?config.state_file,
        engine_url = %config.engine_url,
        max_training_per_node = config.max_training_per_node,
        clustered = config.cluster.is_some(),
        "Configuration loaded"
    );

    // Setup metrics
    let prometheus_handle = metrics::setup_metrics()?;

    let engine = Arc::new(
        RemoteEngine::connect(&config.engine_url, config.training_poll_interval())
            .await
            .context("Failed to reach the engine worker")?,
    );

    let repository = Arc::new(ModelRepository::new(config.model_dir.clone()));
    repository.init().await?;

    let sessions = Arc::new(TrainSessionStore::new(
        config.released_session_capacity,
        config.released_session_ttl(),
    ));
    let service = Arc::new(NluService::new(
        engine,
        repository,
        sessions,
        config.batch_size,
    ));

    let queue = Arc::new(build_queue(&config));
    queue.initialize();
    let event_logger = queue.spawn_event_logger();

    let registry = Arc::new(BotRegistry::new(
        service.clone(),
        queue.clone(),
        config.training_poll_interval(),
    ));

    let state_manager = Arc::new(StateManager::new(
        config.state_file.clone(),
        registry.clone(),
    ));

    // Seed bots from config, then restore the saved ones
    for bot_config in std::mem::take(&mut config.bots) {
        let bot_id = bot_config.bot_id.clone();
        if let Err(e) = registry.mount(bot_config).await {
            tracing::error!(error = %e, bot_id = %bot_id, "Failed to mount seeded bot");
        }
    }
    if config.auto_restore_on_restart {
        tracing::info!("Auto-restore enabled, restoring bots from state");
        state_manager.restore().await?;
    }

    // Setup API
    let app_state = api::AppState {
        service,
        registry: registry.clone(),
        state_manager: state_manager.clone(),
        prometheus_handle,
        auth_token: config.auth_token.as_deref().map(Arc::from),
    };

    let app = api::create_router(app_state);

    let addr = format!("{}:{}", config.host, config.api_port);
    tracing::info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind API server")?;

    // Graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    tracing::info!("Shutting down...");

    // Cooperatively cancel running trainings
    queue.teardown().await;
    event_logger.abort();

    // Save final state
    tracing::info!("Saving final state");
    state_manager.save().await?;

    tracing::info!("Shutdown complete");

    Ok(())
}

fn build_queue(config: &ServerConfig) -> TrainingQueue {
    let mut options = QueueOptions {
        max_training: config.max_training_per_node,
        interval: config.queue_interval(),
        ..Default::default()
    };

    match &config.cluster {
        Some(cluster) => {
            let lease = Duration::from_secs(cluster.lock_lease_secs);
            options.node_id = cluster.node_id.clone();
            // Renew well before the lease runs out
            options.watch_interval = (lease / 3).max(Duration::from_millis(100));

            tracing::info!(
                node_id = %cluster.node_id,
                shared_dir = ?cluster.shared_dir,
                "Cluster mode enabled"
            );

            TrainingQueue::new(
                Arc::new(FileJobStore::new(cluster.jobs_dir())),
                Arc::new(FileLeaseLock::new(
                    cluster.locks_dir(),
                    cluster.node_id.clone(),
                    lease,
                )),
                options,
            )
        }
        None => TrainingQueue::in_memory(options),
    }
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
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
