//! CLI command definitions for ml-forge.

use anyhow::Context as _;
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Settings;
use crate::executor::{ArtifactStore, RunExecutor, RunSnapshot};
use crate::graph::{to_mermaid, Collaborators, WorkflowGraph};
use crate::llm::build_client;
use crate::metrics::{export_metrics, init_metrics};
use crate::phases::default_handlers;
use crate::sandbox::{validate_code, CodeSandbox, ExecutionRequest, SandboxConfig, SubprocessSandbox};
use crate::state::DataSourceRef;

/// Autonomous ML pipeline: dataset and objective in, trained model out.
#[derive(Parser)]
#[command(name = "ml-forge")]
#[command(about = "Turn a dataset and an objective into a trained, reviewed model")]
#[command(version)]
#[command(
    long_about = "ml-forge profiles a dataset, engineers features, plots, trains and evaluates models with generated Python, and loops back when a review finds the result lacking.\n\nExample usage:\n  ml-forge run --data ./churn.csv --objective \"predict churn\" --max-loops 2"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error). Overrides LOG_LEVEL.
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the pipeline on a dataset and wait for it to finish.
    Run(RunArgs),

    /// Show the saved status of a run.
    Status(RunIdArgs),

    /// List runs found in artifact storage.
    #[command(alias = "ls")]
    List,

    /// Statically validate a Python file without running it.
    Validate(FileArgs),

    /// Run a Python file through the sandbox.
    Exec(ExecArgs),

    /// Print the workflow graph as a Mermaid diagram.
    Graph,

    /// Continue a run from its last checkpoint.
    Resume(RunIdArgs),
}

/// Arguments for `ml-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Dataset to analyze (csv, parquet or json).
    #[arg(short, long)]
    pub data: PathBuf,

    /// What the model should do, in plain language.
    #[arg(short, long)]
    pub objective: String,

    /// Maximum number of review loop-backs (defaults to MAX_LOOPS).
    #[arg(long)]
    pub max_loops: Option<u32>,

    /// Run id to use instead of a generated one.
    #[arg(long)]
    pub run_id: Option<String>,

    /// Print Prometheus metrics after the run.
    #[arg(long)]
    pub metrics: bool,
}

/// Arguments naming one run.
#[derive(Parser, Debug)]
pub struct RunIdArgs {
    pub run_id: String,
}

/// Arguments naming one Python file.
#[derive(Parser, Debug)]
pub struct FileArgs {
    pub file: PathBuf,
}

/// Arguments for `ml-forge exec`.
#[derive(Parser, Debug)]
pub struct ExecArgs {
    pub file: PathBuf,

    /// Working directory for the interpreter (defaults to the current one).
    #[arg(short, long)]
    pub workdir: Option<PathBuf>,

    /// Timeout in seconds (defaults to SANDBOX_TIMEOUT_SEC).
    #[arg(short, long)]
    pub timeout: Option<u64>,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For more control over logging initialization, use `parse_cli()` and
/// `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_pipeline_command(args).await,
        Commands::Status(args) => run_status_command(args).await,
        Commands::List => run_list_command().await,
        Commands::Validate(args) => run_validate_command(args).await,
        Commands::Exec(args) => run_exec_command(args).await,
        Commands::Graph => {
            println!("{}", to_mermaid());
            Ok(())
        }
        Commands::Resume(args) => run_resume_command(args).await,
    }
}

fn load_settings() -> anyhow::Result<Settings> {
    let settings = Settings::from_env().context("Invalid configuration")?;
    settings.validate().context("Invalid configuration")?;
    Ok(settings)
}

async fn build_executor(settings: &Settings) -> anyhow::Result<RunExecutor> {
    let client = build_client(settings)?;
    let sandbox = Arc::new(SubprocessSandbox::new(SandboxConfig::from_settings(settings)));
    let graph = WorkflowGraph::new(Collaborators::new(client, sandbox)).with_handlers(default_handlers());
    Ok(RunExecutor::from_settings(settings, graph).await?)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json_output = serde_json::to_string_pretty(value)
        .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
    println!("{}", json_output);
    Ok(())
}

fn print_outcome(snapshot: &RunSnapshot, artifacts: &ArtifactStore) -> anyhow::Result<()> {
    print_json(snapshot)?;
    println!();
    println!("Run {}: {}", snapshot.run_id, snapshot.status);
    println!("  Loops:     {}/{}", snapshot.loop_count, snapshot.max_loops);
    println!("  Errors:    {}", snapshot.errors.len());
    println!("  Artifacts: {}", artifacts.run_path(&snapshot.run_id)?.display());
    Ok(())
}

async fn run_pipeline_command(args: RunArgs) -> anyhow::Result<()> {
    if args.metrics {
        init_metrics().context("Failed to register metrics")?;
    }
    let settings = load_settings()?;
    let data_source = DataSourceRef::local(&args.data)
        .with_context(|| format!("Cannot read dataset {}", args.data.display()))?;
    let executor = build_executor(&settings).await?;

    info!(data = %data_source.location, objective = %args.objective, "Starting run");
    let snapshot = executor
        .run_to_completion(data_source, args.objective, args.run_id, args.max_loops)
        .await?;
    print_outcome(&snapshot, executor.artifacts())?;

    if args.metrics {
        println!();
        print!("{}", export_metrics());
    }
    Ok(())
}

async fn run_resume_command(args: RunIdArgs) -> anyhow::Result<()> {
    let settings = load_settings()?;
    let executor = build_executor(&settings).await?;
    let snapshot = executor.resume(&args.run_id).await?.wait().await?;
    print_outcome(&snapshot, executor.artifacts())
}

async fn run_status_command(args: RunIdArgs) -> anyhow::Result<()> {
    let settings = load_settings()?;
    let artifacts = ArtifactStore::new(&settings.artifact_path);
    match artifacts.load_metadata(&args.run_id).await? {
        Some(snapshot) => print_json(&snapshot),
        None => Err(anyhow::anyhow!("Run '{}' not found", args.run_id)),
    }
}

#[derive(Debug, Serialize)]
struct ListEntry {
    run_id: String,
    status: String,
    objective: String,
    loop_count: u32,
    errors: usize,
    artifacts: Vec<String>,
}

async fn run_list_command() -> anyhow::Result<()> {
    let settings = load_settings()?;
    let artifacts = ArtifactStore::new(&settings.artifact_path);

    let mut entries = Vec::new();
    for run_id in artifacts.list_runs().await? {
        let Some(snapshot) = artifacts.load_metadata(&run_id).await? else {
            continue;
        };
        let files = artifacts
            .list_artifacts(&run_id)
            .await?
            .into_iter()
            .map(|p| p.display().to_string())
            .collect();
        entries.push(ListEntry {
            run_id: snapshot.run_id,
            status: snapshot.status.to_string(),
            objective: snapshot.objective,
            loop_count: snapshot.loop_count,
            errors: snapshot.errors.len(),
            artifacts: files,
        });
    }
    print_json(&entries)
}

async fn run_validate_command(args: FileArgs) -> anyhow::Result<()> {
    let code = tokio::fs::read_to_string(&args.file)
        .await
        .with_context(|| format!("Cannot read {}", args.file.display()))?;
    let report = validate_code(&code);
    for warning in &report.warnings {
        warn!(file = %args.file.display(), "{}", warning);
    }
    print_json(&report)?;
    match report.error {
        Some(error) => Err(anyhow::anyhow!("Validation failed: {}", error)),
        None => Ok(()),
    }
}

async fn run_exec_command(args: ExecArgs) -> anyhow::Result<()> {
    let settings = load_settings()?;
    let code = tokio::fs::read_to_string(&args.file)
        .await
        .with_context(|| format!("Cannot read {}", args.file.display()))?;
    let workdir = match args.workdir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let timeout = args
        .timeout
        .map(std::time::Duration::from_secs)
        .unwrap_or(settings.sandbox_timeout);

    let sandbox = SubprocessSandbox::new(SandboxConfig::from_settings(&settings));
    let result = sandbox
        .execute(ExecutionRequest::new(code, workdir).with_timeout(timeout))
        .await;
    print_json(&result)?;
    if result.success {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "{}: {}",
            result.error_type.as_deref().unwrap_or("ExecutionError"),
            result.error_message.as_deref().unwrap_or("unknown error")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command() {
        let args = vec![
            "ml-forge", "run", "--data", "churn.csv", "--objective", "predict churn",
            "--max-loops", "2", "--metrics",
        ];
        let cli = Cli::try_parse_from(args).expect("should parse");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.data, PathBuf::from("churn.csv"));
                assert_eq!(args.objective, "predict churn");
                assert_eq!(args.max_loops, Some(2));
                assert!(args.run_id.is_none());
                assert!(args.metrics);
            }
            _ => panic!("Expected Run command"),
        }
        assert!(cli.log_level.is_none());
    }

    #[test]
    fn test_run_requires_objective() {
        assert!(Cli::try_parse_from(["ml-forge", "run", "--data", "x.csv"]).is_err());
    }

    #[test]
    fn test_status_and_resume() {
        let cli = Cli::try_parse_from(["ml-forge", "status", "run-42", "-l", "debug"]).expect("should parse");
        assert!(matches!(cli.command, Commands::Status(ref a) if a.run_id == "run-42"));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));

        let cli = Cli::try_parse_from(["ml-forge", "resume", "run-42"]).expect("should parse");
        assert!(matches!(cli.command, Commands::Resume(ref a) if a.run_id == "run-42"));
    }

    #[test]
    fn test_exec_and_aliases() {
        let cli = Cli::try_parse_from(["ml-forge", "exec", "job.py", "--timeout", "5"]).expect("should parse");
        match cli.command {
            Commands::Exec(args) => {
                assert_eq!(args.file, PathBuf::from("job.py"));
                assert_eq!(args.timeout, Some(5));
                assert!(args.workdir.is_none());
            }
            _ => panic!("Expected Exec command"),
        }
        assert!(matches!(Cli::try_parse_from(["ml-forge", "ls"]).unwrap().command, Commands::List));
        assert!(matches!(Cli::try_parse_from(["ml-forge", "graph"]).unwrap().command, Commands::Graph));
    }

    #[tokio::test]
    async fn test_validate_command() {
        let dir = tempfile::TempDir::new().unwrap();
        let ok = dir.path().join("ok.py");
        std::fs::write(&ok, "import pandas as pd\nprint(pd.__name__)\n").unwrap();
        assert!(run_validate_command(FileArgs { file: ok }).await.is_ok());

        let bad = dir.path().join("bad.py");
        std::fs::write(&bad, "from os import system\nsystem('ls')\n").unwrap();
        let err = run_validate_command(FileArgs { file: bad }).await.unwrap_err();
        assert!(err.to_string().starts_with("Validation failed"));
    }
}
