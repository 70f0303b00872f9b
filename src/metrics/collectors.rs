//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op for metrics that were never initialized, so
//! library code can record unconditionally.

use super::prometheus::{
    ACTIVE_RUNS, CRITIC_VERDICTS_TOTAL, LLM_LATENCY, LLM_REQUESTS_TOTAL, LLM_TOKENS_TOTAL,
    PHASE_DURATION, PHASE_ERRORS_TOTAL, RUNS_TOTAL, RUN_DURATION, SANDBOX_DURATION,
    SANDBOX_EXECUTIONS_TOTAL,
};

/// Metrics collector for recording ml-forge operational metrics.
///
/// ```ignore
/// use ml_forge::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics()?;
/// let collector = MetricsCollector::new();
/// collector.record_phase("model_trainer", 42.0);
/// collector.record_llm_request("claude-sonnet-4-5-20250929", true, 2.5, 1000, 500);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a finished run with its terminal status.
    pub fn record_run(&self, status: &str, duration_secs: f64) {
        if let Some(runs_total) = RUNS_TOTAL.get() {
            runs_total.with_label_values(&[status]).inc();
        }

        if let Some(run_duration) = RUN_DURATION.get() {
            run_duration.observe(duration_secs);
        }

        tracing::trace!(
            status = status,
            duration_secs = duration_secs,
            "Recorded run metric"
        );
    }

    /// Record one phase handler invocation.
    pub fn record_phase(&self, phase: &str, duration_secs: f64) {
        if let Some(phase_duration) = PHASE_DURATION.get() {
            phase_duration
                .with_label_values(&[phase])
                .observe(duration_secs);
        }

        tracing::trace!(
            phase = phase,
            duration_secs = duration_secs,
            "Recorded phase metric"
        );
    }

    pub fn record_phase_error(&self, phase: &str, error_type: &str) {
        if let Some(errors) = PHASE_ERRORS_TOTAL.get() {
            errors.with_label_values(&[phase, error_type]).inc();
        }

        tracing::trace!(phase = phase, error_type = error_type, "Recorded phase error");
    }

    /// Record a sandbox execution.
    ///
    /// `outcome` is `"success"` or the error kind of a failed execution.
    pub fn record_sandbox(&self, outcome: &str, duration_secs: f64) {
        if let Some(executions) = SANDBOX_EXECUTIONS_TOTAL.get() {
            executions.with_label_values(&[outcome]).inc();
        }

        if let Some(duration) = SANDBOX_DURATION.get() {
            duration.observe(duration_secs);
        }

        tracing::trace!(
            outcome = outcome,
            duration_secs = duration_secs,
            "Recorded sandbox metric"
        );
    }

    /// Record an LLM API request.
    pub fn record_llm_request(
        &self,
        model: &str,
        success: bool,
        latency_secs: f64,
        input_tokens: u64,
        output_tokens: u64,
    ) {
        let status = if success { "success" } else { "failure" };

        if let Some(llm_requests) = LLM_REQUESTS_TOTAL.get() {
            llm_requests.with_label_values(&[model, status]).inc();
        }

        if let Some(llm_latency) = LLM_LATENCY.get() {
            llm_latency
                .with_label_values(&[model])
                .observe(latency_secs);
        }

        if let Some(llm_tokens) = LLM_TOKENS_TOTAL.get() {
            llm_tokens
                .with_label_values(&[model, "input"])
                .inc_by(input_tokens as f64);
            llm_tokens
                .with_label_values(&[model, "output"])
                .inc_by(output_tokens as f64);
        }

        tracing::trace!(
            model = model,
            status = status,
            latency_secs = latency_secs,
            input_tokens = input_tokens,
            output_tokens = output_tokens,
            "Recorded LLM request metric"
        );
    }

    pub fn record_verdict(&self, verdict: &str) {
        if let Some(verdicts) = CRITIC_VERDICTS_TOTAL.get() {
            verdicts.with_label_values(&[verdict]).inc();
        }

        tracing::trace!(verdict = verdict, "Recorded critic verdict");
    }

    pub fn inc_active_runs(&self) {
        if let Some(active) = ACTIVE_RUNS.get() {
            active.inc();
        }
    }

    pub fn dec_active_runs(&self) {
        if let Some(active) = ACTIVE_RUNS.get() {
            active.dec();
        }
    }
}
