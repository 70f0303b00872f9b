//! Subprocess-backed sandbox.
//!
//! Each call validates the code, writes it to a transient file in the
//! caller's working directory and runs a fresh interpreter on that file with
//! an explicit environment. The interpreter leads its own process group.
//! One `tokio::time::timeout` covers the wait and both output readers; on
//! expiry the whole group is killed and the child reaped before the result
//! is returned.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::result::{ErrorKind, ExecutionRequest, ExecutionResult};
use super::validator::validate_code;
use super::CodeSandbox;
use crate::config::Settings;
use crate::error::SandboxError;
use crate::metrics::MetricsCollector;

/// Name of the transient source file written into the working directory.
pub const CODE_FILE_NAME: &str = "_sandbox_exec.py";

/// Host variables forwarded to the interpreter when set.
const DEFAULT_PASSTHROUGH: &[&str] = &["PATH", "LANG", "LC_ALL", "VIRTUAL_ENV", "PYTHONPATH", "TMPDIR"];

/// Configuration for [`SubprocessSandbox`].
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Interpreter executable.
    pub python_path: String,
    /// Address-space limit applied with `ulimit -v`, if any.
    pub memory_limit_mb: Option<u64>,
    /// Host environment variables copied into the child environment.
    pub passthrough_env: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            python_path: "python3".to_string(),
            memory_limit_mb: None,
            passthrough_env: DEFAULT_PASSTHROUGH.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl SandboxConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interpreter and memory limit from the process settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::default()
            .with_python_path(&settings.sandbox_python)
            .with_memory_limit_mb(settings.sandbox_memory_limit_mb)
    }

    pub fn with_python_path(mut self, path: impl Into<String>) -> Self {
        self.python_path = path.into();
        self
    }

    pub fn with_memory_limit_mb(mut self, limit: u64) -> Self {
        self.memory_limit_mb = Some(limit);
        self
    }

    pub fn with_passthrough_env(mut self, keys: Vec<String>) -> Self {
        self.passthrough_env = keys;
        self
    }
}

/// Runs generated Python in a child interpreter process.
#[derive(Debug, Default)]
pub struct SubprocessSandbox {
    config: SandboxConfig,
    spawned: AtomicUsize,
    metrics: MetricsCollector,
}

impl SubprocessSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            spawned: AtomicUsize::new(0),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Number of interpreter processes started so far.
    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Environment handed to the child: passthrough keys, interpreter flags,
    /// then caller-supplied entries.
    fn build_env(&self, working_dir: &Path, extra: &HashMap<String, String>) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = self
            .config
            .passthrough_env
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|v| (key.clone(), v)))
            .collect();
        env.insert("HOME".to_string(), working_dir.display().to_string());
        env.insert("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string());
        env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
        env.insert("MPLBACKEND".to_string(), "Agg".to_string());
        env.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    fn build_command(&self, code_file: &Path, working_dir: &Path) -> Command {
        let mut command = match self.config.memory_limit_mb {
            // Arguments are positional parameters of the shell, never
            // interpolated into the script.
            Some(limit_mb) if cfg!(unix) => {
                let mut cmd = Command::new("/bin/sh");
                cmd.arg("-c")
                    .arg("ulimit -v \"$1\" && exec \"$2\" \"$3\"")
                    .arg("sandbox")
                    .arg((limit_mb * 1024).to_string())
                    .arg(&self.config.python_path)
                    .arg(code_file);
                cmd
            }
            _ => {
                let mut cmd = Command::new(&self.config.python_path);
                cmd.arg(code_file);
                cmd
            }
        };
        command
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // descendants share the group so a timeout can reach all of them
        #[cfg(unix)]
        command.process_group(0);
        command
    }

    async fn run_process(
        &self,
        request: &ExecutionRequest,
        code_file: &Path,
    ) -> Result<ExecutionResult, SandboxError> {
        let mut command = self.build_command(code_file, &request.working_dir);
        command
            .env_clear()
            .envs(self.build_env(&request.working_dir, &request.extra_env));

        let start = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|e| SandboxError::Spawn(format!("{}: {}", self.config.python_path, e)))?;
        self.spawned.fetch_add(1, Ordering::SeqCst);

        let mut stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Spawn("stdout not captured".to_string()))?;
        let mut stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Spawn("stderr not captured".to_string()))?;

        let mut stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stdout_pipe.read_to_end(&mut buf).await.map(|_| buf)
        });
        let mut stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stderr_pipe.read_to_end(&mut buf).await.map(|_| buf)
        });

        // the child may exit while a forked descendant still holds the
        // pipes, so the readers run under the same deadline as the wait
        let pid = child.id();
        let finished = tokio::time::timeout(request.timeout, async {
            let status = child.wait().await?;
            let stdout = collect_output(&mut stdout_task).await?;
            let stderr = collect_output(&mut stderr_task).await?;
            Ok::<_, SandboxError>((status, stdout, stderr))
        })
        .await;

        match finished {
            Ok(outcome) => {
                let (status, stdout, stderr) = outcome?;
                let elapsed = start.elapsed().as_secs_f64();

                if status.success() {
                    info!(elapsed_secs = elapsed, "Sandbox execution succeeded");
                    Ok(ExecutionResult::success(stdout, stderr, elapsed))
                } else {
                    let result = ExecutionResult::exited(stdout, stderr, elapsed);
                    warn!(
                        error_type = result.error_type.as_deref().unwrap_or("unknown"),
                        exit_code = status.code().unwrap_or(-1),
                        elapsed_secs = elapsed,
                        "Sandbox execution failed"
                    );
                    Ok(result)
                }
            }
            Err(_) => {
                if let Some(pid) = pid {
                    kill_process_group(pid).await;
                }
                // kill() also waits for the child to exit
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "Sandbox process already exited");
                }
                stdout_task.abort();
                stderr_task.abort();

                let secs = request.timeout.as_secs_f64();
                warn!(timeout_secs = secs, "Sandbox execution timed out");
                Ok(ExecutionResult::failure(
                    ErrorKind::TimeoutError,
                    format!("Execution exceeded {}s timeout", format_secs(secs)),
                    secs,
                ))
            }
        }
    }
}

#[async_trait]
impl CodeSandbox for SubprocessSandbox {
    async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let result = self.validate_and_run(request).await;
        let outcome = match result.error_kind {
            Some(kind) => kind.as_str(),
            None => "success",
        };
        self.metrics.record_sandbox(outcome, result.elapsed_secs);
        result
    }
}

impl SubprocessSandbox {
    async fn validate_and_run(&self, request: ExecutionRequest) -> ExecutionResult {
        let report = validate_code(&request.code);
        if let Some(error) = report.error {
            warn!(error = %error, "Code validation failed");
            return ExecutionResult::failure(ErrorKind::ValidationError, error, 0.0);
        }
        if !report.warnings.is_empty() {
            info!(warnings = ?report.warnings, "Code validation warnings");
        }

        if let Err(e) = tokio::fs::create_dir_all(&request.working_dir).await {
            return ExecutionResult::failure(
                ErrorKind::LaunchError,
                format!("Failed to prepare working directory: {}", e),
                0.0,
            )
            .with_warnings(report.warnings);
        }

        let code_file: PathBuf = request.working_dir.join(CODE_FILE_NAME);
        if let Err(e) = tokio::fs::write(&code_file, &request.code).await {
            return ExecutionResult::failure(
                ErrorKind::LaunchError,
                format!("Failed to write code file: {}", e),
                0.0,
            )
            .with_warnings(report.warnings);
        }

        debug!(
            working_dir = %request.working_dir.display(),
            timeout_secs = request.timeout.as_secs_f64(),
            "Running sandboxed code"
        );

        let result = match self.run_process(&request, &code_file).await {
            Ok(result) => result,
            Err(e) => ExecutionResult::failure(ErrorKind::LaunchError, e.to_string(), 0.0),
        };

        if let Err(e) = tokio::fs::remove_file(&code_file).await {
            debug!(error = %e, "Code file already removed");
        }

        result.with_warnings(report.warnings)
    }
}

async fn collect_output(
    task: &mut tokio::task::JoinHandle<std::io::Result<Vec<u8>>>,
) -> Result<String, SandboxError> {
    let bytes = task
        .await
        .map_err(|e| SandboxError::Spawn(format!("output reader failed: {}", e)))??;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Kills every process in the sandbox's process group.
#[cfg(unix)]
async fn kill_process_group(pgid: u32) {
    let status = Command::new("kill")
        .args(["-s", "KILL", "--", &format!("-{}", pgid)])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = status {
        warn!(pgid, error = %e, "Failed to kill sandbox process group");
    }
}

#[cfg(not(unix))]
async fn kill_process_group(_pgid: u32) {}

fn format_secs(secs: f64) -> String {
    if secs.fract() == 0.0 {
        format!("{}", secs as u64)
    } else {
        format!("{:.1}", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_import_socket_rejected_without_spawn() {
        let dir = TempDir::new().unwrap();
        let sandbox = SubprocessSandbox::default();

        let result = sandbox
            .execute(ExecutionRequest::new("import socket", dir.path()))
            .await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::ValidationError));
        assert_eq!(result.error_message.as_deref(), Some("Forbidden import: socket"));
        assert_eq!(sandbox.spawn_count(), 0);
        assert!(!dir.path().join(CODE_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn test_every_denied_construct_rejected_without_spawn() {
        use crate::sandbox::validator::{FORBIDDEN_ATTRIBUTES, FORBIDDEN_CALLS, FORBIDDEN_IMPORTS};

        let dir = TempDir::new().unwrap();
        let sandbox = SubprocessSandbox::default();

        let samples = FORBIDDEN_IMPORTS
            .iter()
            .map(|m| format!("import {}", m))
            .chain(FORBIDDEN_CALLS.iter().map(|c| format!("{}('x')", c)))
            .chain(FORBIDDEN_ATTRIBUTES.iter().map(|a| format!("obj.{}", a)))
            .chain(std::iter::once("obj.__subclasses__".to_string()));

        for code in samples {
            let result = sandbox.execute(ExecutionRequest::new(code.clone(), dir.path())).await;
            assert_eq!(
                result.error_kind,
                Some(ErrorKind::ValidationError),
                "not rejected: {}",
                code
            );
        }
        assert_eq!(sandbox.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_launch_error() {
        let dir = TempDir::new().unwrap();
        let sandbox = SubprocessSandbox::new(
            SandboxConfig::new().with_python_path("/nonexistent/python-interpreter"),
        );

        let result = sandbox.execute(ExecutionRequest::new("x = 1", dir.path())).await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::LaunchError));
        assert!(!dir.path().join(CODE_FILE_NAME).exists());
    }

    #[test]
    fn test_build_env_is_explicit() {
        std::env::set_var("ML_FORGE_SECRET_FOR_TEST", "leak");
        let sandbox = SubprocessSandbox::default();
        let mut extra = HashMap::new();
        extra.insert("RANDOM_SEED".to_string(), "7".to_string());

        let env = sandbox.build_env(Path::new("/tmp/work"), &extra);

        assert!(!env.contains_key("ML_FORGE_SECRET_FOR_TEST"));
        assert_eq!(env.get("PYTHONDONTWRITEBYTECODE").map(String::as_str), Some("1"));
        assert_eq!(env.get("PYTHONUNBUFFERED").map(String::as_str), Some("1"));
        assert_eq!(env.get("RANDOM_SEED").map(String::as_str), Some("7"));
        assert_eq!(env.get("HOME").map(String::as_str), Some("/tmp/work"));
    }

    #[test]
    fn test_format_secs() {
        assert_eq!(format_secs(60.0), "60");
        assert_eq!(format_secs(1.5), "1.5");
    }

    #[tokio::test]
    async fn test_successful_run_leaves_outputs() {
        if !python_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let sandbox = SubprocessSandbox::default();
        let code = "import json\nwith open('out.json', 'w') as f:\n    f.write(json.dumps({'ok': True}))\nprint(json.dumps({'rows': 10}))\n";

        let result = sandbox.execute(ExecutionRequest::new(code, dir.path())).await;

        assert!(result.success, "{:?}", result);
        assert_eq!(result.stdout.trim(), "{\"rows\": 10}");
        assert!(dir.path().join("out.json").exists());
        assert!(!dir.path().join(CODE_FILE_NAME).exists());
        assert_eq!(sandbox.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_runtime_error_classified() {
        if !python_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let sandbox = SubprocessSandbox::default();

        let result = sandbox
            .execute(ExecutionRequest::new("x = 1 / 0\n", dir.path()))
            .await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::ExecutionError));
        assert_eq!(result.error_type.as_deref(), Some("ZeroDivisionError"));
        assert!(result.stderr.contains("division by zero"));
    }

    #[tokio::test]
    async fn test_extra_env_visible_to_code() {
        if !python_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let sandbox = SubprocessSandbox::default();
        let request = ExecutionRequest::new("import os\nprint(os.environ['RUN_TAG'])\n", dir.path())
            .with_env("RUN_TAG", "abc");

        let result = sandbox.execute(request).await;

        assert!(result.success, "{:?}", result);
        assert_eq!(result.stdout.trim(), "abc");
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        if !python_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let sandbox = SubprocessSandbox::default();
        let code = "import os, time\nwith open('pid.txt', 'w') as f:\n    f.write(str(os.getpid()))\ntime.sleep(30)\n";
        let request = ExecutionRequest::new(code, dir.path()).with_timeout(Duration::from_secs(2));

        let started = Instant::now();
        let result = sandbox.execute(request).await;
        let waited = started.elapsed();

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::TimeoutError));
        assert_eq!(result.error_message.as_deref(), Some("Execution exceeded 2s timeout"));
        assert!((result.elapsed_secs - 2.0).abs() < f64::EPSILON);
        assert!(waited < Duration::from_secs(10), "took {:?}", waited);

        #[cfg(target_os = "linux")]
        {
            let pid = std::fs::read_to_string(dir.path().join("pid.txt")).unwrap();
            assert!(!Path::new(&format!("/proc/{}", pid.trim())).exists());
        }
    }

    #[cfg(target_os = "linux")]
    fn process_alive(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            // zombies wait for a reaper but no longer run
            Ok(stat) => !stat.rsplit(')').next().is_some_and(|rest| rest.trim_start().starts_with('Z')),
            Err(_) => false,
        }
    }

    #[tokio::test]
    async fn test_timeout_covers_forked_descendants() {
        if !python_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let sandbox = SubprocessSandbox::default();
        let code = "import os, time\nif os.fork() == 0:\n    with open('child.txt', 'w') as f:\n        f.write(str(os.getpid()))\n    time.sleep(12)\nelse:\n    print('parent done')\n";
        let request = ExecutionRequest::new(code, dir.path()).with_timeout(Duration::from_secs(2));

        let started = Instant::now();
        let result = sandbox.execute(request).await;
        let waited = started.elapsed();

        assert!(!result.success, "{:?}", result);
        assert_eq!(result.error_kind, Some(ErrorKind::TimeoutError));
        assert!(waited < Duration::from_secs(8), "took {:?}", waited);

        #[cfg(target_os = "linux")]
        {
            let pid = std::fs::read_to_string(dir.path().join("child.txt")).unwrap();
            let mut alive = process_alive(pid.trim());
            for _ in 0..20 {
                if !alive {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
                alive = process_alive(pid.trim());
            }
            assert!(!alive, "forked descendant {} survived the timeout", pid.trim());
        }
    }
}
