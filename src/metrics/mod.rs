//! Prometheus-based monitoring.
//!
//! Records run, phase, sandbox and LLM metrics. Recording is a no-op until
//! [`init_metrics`] has been called.
//!
//! ```ignore
//! use ml_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics()?;
//! MetricsCollector::new().record_run("completed", 312.0);
//! println!("{}", export_metrics());
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_RUNS, CRITIC_VERDICTS_TOTAL, LLM_LATENCY, LLM_REQUESTS_TOTAL, LLM_TOKENS_TOTAL,
    PHASE_DURATION, PHASE_ERRORS_TOTAL, REGISTRY, RUNS_TOTAL, RUN_DURATION, SANDBOX_DURATION,
    SANDBOX_EXECUTIONS_TOTAL,
};
