//! Prometheus metrics registration and export.
//!
//! Defines the metrics recorded by ml-forge and the functions that register
//! and export them.

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all ml-forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Finished runs, labeled by terminal status.
pub static RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Wall-clock run duration in seconds.
pub static RUN_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Runs currently executing.
pub static ACTIVE_RUNS: OnceLock<Gauge> = OnceLock::new();

/// Phase handler duration in seconds, labeled by phase.
pub static PHASE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Errors recorded in run state, labeled by phase and error type.
pub static PHASE_ERRORS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Sandbox executions, labeled by outcome (`success` or an error kind).
pub static SANDBOX_EXECUTIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Sandbox execution duration in seconds.
pub static SANDBOX_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Total LLM API requests, labeled by model and status.
pub static LLM_REQUESTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// LLM API request latency in seconds, labeled by model.
pub static LLM_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Total tokens used, labeled by model and type (input/output).
pub static LLM_TOKENS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Critic verdicts, labeled by verdict.
pub static CRITIC_VERDICTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls build fresh metrics but leave the
/// first registration in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let runs_total = CounterVec::new(
        Opts::new("ml_forge_runs_total", "Total number of finished runs"),
        &["status"],
    )?;

    let run_duration = Histogram::with_opts(
        HistogramOpts::new("ml_forge_run_duration_seconds", "Run duration in seconds")
            .buckets(vec![30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 3600.0]),
    )?;

    let active_runs = Gauge::new("ml_forge_active_runs", "Number of runs currently executing")?;

    let phase_duration = HistogramVec::new(
        HistogramOpts::new(
            "ml_forge_phase_duration_seconds",
            "Phase handler duration in seconds",
        )
        .buckets(vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        &["phase"],
    )?;

    let phase_errors_total = CounterVec::new(
        Opts::new("ml_forge_phase_errors_total", "Errors recorded by phases"),
        &["phase", "error_type"],
    )?;

    let sandbox_executions_total = CounterVec::new(
        Opts::new("ml_forge_sandbox_executions_total", "Total sandbox executions"),
        &["outcome"],
    )?;

    let sandbox_duration = Histogram::with_opts(
        HistogramOpts::new(
            "ml_forge_sandbox_duration_seconds",
            "Sandbox execution duration in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
    )?;

    let llm_requests_total = CounterVec::new(
        Opts::new("ml_forge_llm_requests_total", "Total LLM API requests"),
        &["model", "status"],
    )?;

    let llm_latency = HistogramVec::new(
        HistogramOpts::new(
            "ml_forge_llm_latency_seconds",
            "LLM API request latency in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
        &["model"],
    )?;

    let llm_tokens_total = CounterVec::new(
        Opts::new("ml_forge_llm_tokens_total", "Total tokens used"),
        &["model", "type"],
    )?;

    let critic_verdicts_total = CounterVec::new(
        Opts::new("ml_forge_critic_verdicts_total", "Critic verdicts by outcome"),
        &["verdict"],
    )?;

    registry.register(Box::new(runs_total.clone()))?;
    registry.register(Box::new(run_duration.clone()))?;
    registry.register(Box::new(active_runs.clone()))?;
    registry.register(Box::new(phase_duration.clone()))?;
    registry.register(Box::new(phase_errors_total.clone()))?;
    registry.register(Box::new(sandbox_executions_total.clone()))?;
    registry.register(Box::new(sandbox_duration.clone()))?;
    registry.register(Box::new(llm_requests_total.clone()))?;
    registry.register(Box::new(llm_latency.clone()))?;
    registry.register(Box::new(llm_tokens_total.clone()))?;
    registry.register(Box::new(critic_verdicts_total.clone()))?;

    // Set fails when already initialized; the first registration wins.
    let _ = REGISTRY.set(registry);
    let _ = RUNS_TOTAL.set(runs_total);
    let _ = RUN_DURATION.set(run_duration);
    let _ = ACTIVE_RUNS.set(active_runs);
    let _ = PHASE_DURATION.set(phase_duration);
    let _ = PHASE_ERRORS_TOTAL.set(phase_errors_total);
    let _ = SANDBOX_EXECUTIONS_TOTAL.set(sandbox_executions_total);
    let _ = SANDBOX_DURATION.set(sandbox_duration);
    let _ = LLM_REQUESTS_TOTAL.set(llm_requests_total);
    let _ = LLM_LATENCY.set(llm_latency);
    let _ = LLM_TOKENS_TOTAL.set(llm_tokens_total);
    let _ = CRITIC_VERDICTS_TOTAL.set(critic_verdicts_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead when the registry is not initialized or
/// encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(runs) = RUNS_TOTAL.get() {
            runs.with_label_values(&["completed"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.is_empty());
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("ml_forge_runs_total"));
    }
}
