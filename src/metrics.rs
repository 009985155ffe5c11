//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::time::Duration;

/// Setup Prometheus metrics exporter
/// Returns a handle that can be used to retrieve metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

/// Record a load attempt and its duration
pub fn record_model_load(model: &str, outcome: &'static str, elapsed: Duration) {
    metrics::counter!("gateway_model_loads_total",
        "model" => model.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!("gateway_model_load_duration_seconds",
        "model" => model.to_string()
    )
    .record(elapsed.as_secs_f64());
    if outcome == "success" {
        metrics::gauge!("gateway_models_loaded").increment(1.0);
    }
}

/// Record an explicit artifact download
pub fn record_model_download(model: &str, outcome: &'static str) {
    metrics::counter!("gateway_model_downloads_total",
        "model" => model.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record an unload of a loaded model
pub fn record_model_unload(model: &str) {
    metrics::counter!("gateway_model_unloads_total",
        "model" => model.to_string()
    )
    .increment(1);
    metrics::gauge!("gateway_models_loaded").decrement(1.0);
}

/// Record a retried artifact fetch
pub fn record_fetch_retry(repo: &str) {
    metrics::counter!("gateway_fetch_retries_total",
        "repo" => repo.to_string()
    )
    .increment(1);
}
