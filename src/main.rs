//! Model Gateway - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use model_gateway::{
    GatewayConfig, ModelRegistry, TokenStore, api,
    auth::ApiKeys,
    gpu, metrics,
    models::served::{self, ServedDeps},
    system::SystemMonitor,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "model-gateway")]
#[command(about = "On-demand model lifecycle gateway", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override API port
    #[arg(long)]
    port: Option<u16>,

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

    tracing::info!("Starting Model Gateway");

    // Load configuration
    let mut config = GatewayConfig::load(cli.config)?;

    // CLI overrides
    if let Some(port) = cli.port {
        config.api_port = port;
    }

    config.validate()?;

    tracing::info!(
        api_port = config.api_port,
        model_cache_dir = %config.model_cache_dir.display(),
        models = config.models.len(),
        lazy_load_models = config.lazy_load_models,
        "Configuration loaded"
    );

    // Setup metrics
    let prometheus_handle = metrics::setup_metrics()?;

    // Credential: config/env first, persisted store second
    let token_store = Arc::new(TokenStore::new(&config.model_cache_dir));
    let hf_token = match config.huggingface_token.clone() {
        Some(token) => Some(token),
        None => token_store
            .load()
            .await
            .context("Failed to read persisted Hugging Face token")?,
    };

    // Initialize registry
    let deps = ServedDeps::system(
        config.retry.clone(),
        config.device_policy.clone(),
        config.server_log_dir.clone(),
    );
    let registry = Arc::new(ModelRegistry::new(&config.model_cache_dir, None));
    registry
        .configure(
            hf_token,
            &config.model_cache_dir,
            served::catalog(&config.models, &deps),
        )
        .await
        .context("Failed to configure model registry")?;

    let detected = gpu::get_or_init();
    tracing::info!(gpu_count = detected.count(), indices = ?detected.indices(), "GPU detection complete");

    if !config.lazy_load_models {
        tracing::info!("Eager loading enabled, loading every model");
        for key in registry.keys().await {
            if let Err(e) = registry.ensure_loaded(&key, None).await {
                tracing::error!(model = %key, error = %e, "Failed to load model at startup");
            }
        }
    }

    // Setup API
    let api_keys = ApiKeys::new(config.openai_api_keys.clone());
    if api_keys.is_open() {
        tracing::warn!("No OpenAI API keys configured, /v1 routes are unauthenticated");
    }
    let app_state = api::AppState {
        registry: registry.clone(),
        token_store,
        gpu_detector: deps.gpu_detector.clone(),
        system_sampler: SystemMonitor::new().into_sampler(),
        api_keys: Arc::new(api_keys),
        prometheus_handle,
    };

    let app = api::create_router(app_state);

    let addr = format!("{}:{}", config.api_host, config.api_port);
    tracing::info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind API server on {}", addr))?;

    // Graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    tracing::info!("Shutting down...");

    tracing::info!("Unloading all models");
    registry.shutdown().await;

    tracing::info!("Shutdown complete");

    Ok(())
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
