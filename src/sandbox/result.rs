//! Execution requests and results for the sandbox.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default wall-clock limit for a single sandbox call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Classification of a failed sandbox call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Code rejected by static validation; no process was started.
    ValidationError,
    /// Wall-clock deadline exceeded; the process was killed.
    TimeoutError,
    /// Process exited with a non-zero status.
    ExecutionError,
    /// The interpreter could not be started or its output collected.
    LaunchError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::TimeoutError => "TimeoutError",
            ErrorKind::ExecutionError => "ExecutionError",
            ErrorKind::LaunchError => "LaunchError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to run one block of code.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub code: String,
    pub working_dir: PathBuf,
    pub timeout: Duration,
    pub extra_env: HashMap<String, String>,
}

impl ExecutionRequest {
    /// Creates a request with the default timeout and no extra environment.
    pub fn new(code: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            code: code.into(),
            working_dir: working_dir.into(),
            timeout: DEFAULT_TIMEOUT,
            extra_env: HashMap::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.insert(key.into(), value.into());
        self
    }
}

/// Immutable outcome of a single sandbox call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub elapsed_secs: f64,
    /// Coarse failure class, `None` on success.
    pub error_kind: Option<ErrorKind>,
    /// Exception name for runtime failures (e.g. `KeyError`), otherwise the
    /// kind's name.
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    /// Advisory validation warnings (unrecognized imports).
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ExecutionResult {
    pub fn success(stdout: String, stderr: String, elapsed_secs: f64) -> Self {
        Self {
            success: true,
            stdout,
            stderr,
            elapsed_secs,
            error_kind: None,
            error_type: None,
            error_message: None,
            warnings: Vec::new(),
        }
    }

    /// A failed result with no captured output.
    pub fn failure(kind: ErrorKind, message: impl Into<String>, elapsed_secs: f64) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            elapsed_secs,
            error_kind: Some(kind),
            error_type: Some(kind.as_str().to_string()),
            error_message: Some(message.into()),
            warnings: Vec::new(),
        }
    }

    /// A non-zero exit, classified from the captured error stream.
    pub fn exited(stdout: String, stderr: String, elapsed_secs: f64) -> Self {
        Self {
            success: false,
            error_kind: Some(ErrorKind::ExecutionError),
            error_type: Some(classify_stderr(&stderr)),
            error_message: Some(stderr.clone()),
            stdout,
            stderr,
            elapsed_secs,
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn failed(&self) -> bool {
        !self.success
    }

    /// Error type for recording in a phase error, falling back to the kind.
    pub fn error_type_or_default(&self) -> String {
        self.error_type
            .clone()
            .or_else(|| self.error_kind.map(|k| k.as_str().to_string()))
            .unwrap_or_else(|| ErrorKind::ExecutionError.as_str().to_string())
    }

    /// One-line summary for logging.
    pub fn summary(&self) -> String {
        let status = if self.success {
            "OK".to_string()
        } else {
            format!("FAIL ({})", self.error_type.as_deref().unwrap_or("unknown"))
        };
        format!(
            "[{}] {:.2}s | stdout={} chars",
            status,
            self.elapsed_secs,
            self.stdout.len()
        )
    }
}

/// Extracts the exception name from the last line of a traceback.
///
/// `ValueError: bad input` yields `ValueError`; output without a `:` on its
/// last line yields `RuntimeError`.
pub fn classify_stderr(stderr: &str) -> String {
    stderr
        .trim()
        .lines()
        .last()
        .and_then(|line| line.split_once(':'))
        .map(|(name, _)| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "RuntimeError".to_string())
}
