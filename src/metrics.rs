//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Setup Prometheus metrics exporter
/// Returns a handle that can be used to retrieve metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

/// Record a training admitted by the queue or started by the server
pub fn record_training_started(language: &str) {
    metrics::counter!("nlu_manager_trainings_started_total",
        "language" => language.to_string()
    )
    .increment(1);
}

/// Record a training outcome (`done`, `canceled`, `errored`)
pub fn record_training_finished(language: &str, outcome: &'static str) {
    metrics::counter!("nlu_manager_trainings_finished_total",
        "language" => language.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a training request satisfied by an already persisted model
pub fn record_cache_hit(language: &str) {
    metrics::counter!("nlu_manager_training_cache_hits_total",
        "language" => language.to_string()
    )
    .increment(1);
}

/// Record a served prediction
pub fn record_prediction(language: &str, ms: f64) {
    metrics::counter!("nlu_manager_predictions_total",
        "language" => language.to_string()
    )
    .increment(1);
    metrics::histogram!("nlu_manager_prediction_duration_ms").record(ms);
}

/// Record a candidate language that could not serve a prediction
pub fn record_prediction_fallback(language: &str) {
    metrics::counter!("nlu_manager_prediction_fallbacks_total",
        "language" => language.to_string()
    )
    .increment(1);
}

/// Update queue gauges
pub fn update_queue_sizes(pending: usize, active: usize) {
    metrics::gauge!("nlu_manager_pending_trainings").set(pending as f64);
    metrics::gauge!("nlu_manager_active_trainings").set(active as f64);
}

/// Update mounted bot count gauge
pub fn update_bot_count(count: usize) {
    metrics::gauge!("nlu_manager_bots_count").set(count as f64);
}
