//! Execution sandbox for generated code.
//!
//! Every call goes through the same pipeline:
//!
//! 1. **Static validation** ([`validator`]) rejects code with syntax errors,
//!    denied calls, attribute accesses, imports or reflective dunders. A
//!    rejected call never starts a process.
//! 2. **Isolated execution** ([`subprocess`]) writes the code to a file in
//!    the caller's working directory and runs a fresh interpreter there with
//!    an explicit environment.
//! 3. **Timeout enforcement** kills the process once the deadline passes.
//! 4. **Result classification** turns a non-zero exit into an error type
//!    taken from the last line of standard error.
//!
//! The sandbox never retries. Repair-and-retry is a caller policy.
//!
//! # Example
//!
//! ```ignore
//! use ml_forge::sandbox::{CodeSandbox, ExecutionRequest, SubprocessSandbox};
//!
//! let sandbox = SubprocessSandbox::default();
//! let result = sandbox
//!     .execute(ExecutionRequest::new("print(1 + 1)", "/tmp/run-1"))
//!     .await;
//! assert_eq!(result.stdout.trim(), "2");
//! ```

pub mod lexer;
pub mod result;
pub mod subprocess;
pub mod validator;

use async_trait::async_trait;

pub use result::{classify_stderr, ErrorKind, ExecutionRequest, ExecutionResult, DEFAULT_TIMEOUT};
pub use subprocess::{SandboxConfig, SubprocessSandbox, CODE_FILE_NAME};
pub use validator::{validate_code, ValidationReport};

/// An environment that runs untrusted code and reports the outcome.
///
/// Implementations must not return errors for failed executions; every
/// failure is reported inside the [`ExecutionResult`].
#[async_trait]
pub trait CodeSandbox: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> ExecutionResult;
}
