//! Helpers shared by the code-running phases.

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tera::Context;
use tracing::warn;

use super::prompts::{render, CODE_REPAIR, SYSTEM_ML_ENGINEER};
use super::scripts::Script;
use crate::error::GraphError;
use crate::graph::Collaborators;
use crate::sandbox::ExecutionResult;
use crate::state::{PhaseError, RunState, Verdict};
use crate::utils::{clean_code_block, parse_last_json_line};

/// Temperature for first-pass code generation.
pub const CODE_TEMPERATURE: f64 = 0.4;
/// Temperature for repair attempts and structured reviews.
pub const REPAIR_TEMPERATURE: f64 = 0.3;
/// Temperature for free-text analysis.
pub const ANALYSIS_TEMPERATURE: f64 = 0.5;

/// Line filters applied to generated code before it is wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeFilter {
    None,
    Visualization,
    Training,
    Evaluation,
}

type Rule = (Regex, &'static str);

fn compile(rules: &[(&str, &'static str)]) -> Vec<Rule> {
    rules
        .iter()
        .map(|(pattern, note)| (Regex::new(pattern).expect("valid regex"), *note))
        .collect()
}

const READ_DATA: (&str, &str) = (r"pd\.read_(csv|parquet|json|excel|feather)\s*\(", "data already loaded");
const SHOW: (&str, &str) = (r"plt\.show\s*\(", "no display");
const MAKEDIRS: (&str, &str) = (r"os\.makedirs\s*\(", "dirs already created");

impl CodeFilter {
    fn rules(&self) -> &'static [Rule] {
        static VISUALIZATION: OnceLock<Vec<Rule>> = OnceLock::new();
        static TRAINING: OnceLock<Vec<Rule>> = OnceLock::new();
        static EVALUATION: OnceLock<Vec<Rule>> = OnceLock::new();

        match self {
            CodeFilter::None => &[],
            CodeFilter::Visualization => VISUALIZATION.get_or_init(|| {
                compile(&[
                    READ_DATA,
                    SHOW,
                    MAKEDIRS,
                    (r"sns\.set_(theme|style)\s*\(|plt\.style\.use\s*\(", "theme already set"),
                    (r"\.set_facecolor\s*\(", "theme handles colors"),
                ])
            }),
            CodeFilter::Training => TRAINING.get_or_init(|| {
                compile(&[
                    READ_DATA,
                    (r"^[^#]*train_test_split\(", "already split"),
                    (r"os\.(makedirs|mkdir|path\.join)\s*\(", "env handles dirs"),
                    (r"(Path\(|pathlib).*mkdir|mkdir.*(Path\(|pathlib)", "env handles dirs"),
                ])
            }),
            CodeFilter::Evaluation => EVALUATION.get_or_init(|| {
                compile(&[
                    READ_DATA,
                    (r"joblib\.load\s*\(", "model already loaded"),
                    SHOW,
                    MAKEDIRS,
                ])
            }),
        }
    }

    /// Replaces offending lines with `pass`, keeping their indentation so
    /// enclosing blocks stay valid.
    pub fn apply(&self, code: &str) -> String {
        let rules = self.rules();
        if rules.is_empty() {
            return code.to_string();
        }
        code.lines()
            .map(|line| {
                let stripped = line.trim();
                match rules.iter().find(|(re, _)| re.is_match(stripped)) {
                    Some((_, note)) => {
                        let indent = &line[..line.len() - line.trim_start().len()];
                        format!("{}pass  # removed ({}): {}", indent, note, stripped)
                    }
                    None => line.to_string(),
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Generated code and the sandbox outcome of its last run.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub code: String,
    pub result: ExecutionResult,
    pub repaired: bool,
}

impl Attempt {
    /// The JSON object printed last, or an empty object.
    pub fn payload(&self) -> Value {
        parse_last_json_line(&self.result.stdout).unwrap_or_else(|| Value::Object(Default::default()))
    }

    /// Stdout lines that are not JSON.
    pub fn narration(&self) -> String {
        self.result
            .stdout
            .lines()
            .filter(|l| !l.trim_start().starts_with('{'))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Asks the client for code and cleans it up.
pub async fn generate_code(
    ctx: &Collaborators,
    prompt: &str,
    temperature: f64,
    filter: CodeFilter,
) -> Result<String, GraphError> {
    let raw = ctx
        .client
        .generate(prompt, Some(SYSTEM_ML_ENGINEER), temperature)
        .await?;
    Ok(filter.apply(&clean_code_block(&raw)))
}

/// Runs `code` in `script`; on failure asks for one repair using the
/// captured stderr and runs the repaired code.
///
/// `what` names the code in the repair prompt ("training code"); `reminder`
/// restates what the preamble already provides.
pub async fn run_with_repair(
    ctx: &Collaborators,
    state: &RunState,
    script: Script,
    code: String,
    filter: CodeFilter,
    what: &str,
    reminder: &str,
) -> Result<Attempt, GraphError> {
    let result = ctx.sandbox.execute(script.request(state, &code)).await;
    if result.success {
        return Ok(Attempt {
            code,
            result,
            repaired: false,
        });
    }

    warn!(
        run_id = %state.run_id,
        script = ?script,
        error_type = result.error_type.as_deref().unwrap_or("unknown"),
        "Generated code failed, requesting a fix"
    );

    let mut context = Context::new();
    context.insert("what", what);
    context.insert("code", &code);
    context.insert("stderr", error_text(&result));
    context.insert("reminder", reminder);
    let prompt = render(CODE_REPAIR, &context)?;

    let code = generate_code(ctx, &prompt, REPAIR_TEMPERATURE, filter).await?;
    let result = ctx.sandbox.execute(script.request(state, &code)).await;
    Ok(Attempt {
        code,
        result,
        repaired: true,
    })
}

/// The most useful failure text of a result.
pub fn error_text(result: &ExecutionResult) -> &str {
    if !result.stderr.trim().is_empty() {
        &result.stderr
    } else {
        result.error_message.as_deref().unwrap_or("unknown error")
    }
}

/// A recoverable error for code that still failed after its repair.
pub fn failed_after_retry(phase: &str, label: &str, result: &ExecutionResult) -> PhaseError {
    PhaseError::new(
        phase,
        result.error_type.as_deref().unwrap_or("ExecutionError"),
        format!(
            "{} failed after retry: {}",
            label,
            result.error_message.as_deref().unwrap_or("unknown error")
        ),
        true,
    )
}

/// Feedback from the latest review when it asked for `verdict`.
pub fn critic_feedback(state: &RunState, verdict: Verdict, focus: &str) -> String {
    match state.latest_decision() {
        Some(d) if d.verdict == verdict => format!(
            "PREVIOUS CRITIC FEEDBACK (iteration {}):\nConcerns: {}\nRecommendations: {}\nAddress these issues in your {}.",
            d.iteration,
            serde_json::to_string(&d.concerns).unwrap_or_default(),
            serde_json::to_string(&d.recommendations).unwrap_or_default(),
            focus
        ),
        _ => String::new(),
    }
}

/// Reads a number, accepting numeric strings.
pub fn as_f64(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn f64_or_zero(payload: &Value, key: &str) -> f64 {
    as_f64(payload.get(key)).unwrap_or(0.0)
}

/// Reads a string-to-number object, dropping non-numeric entries.
pub fn float_map(value: Option<&Value>) -> BTreeMap<String, f64> {
    value
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| as_f64(Some(v)).map(|n| (k.clone(), n)))
                .collect()
        })
        .unwrap_or_default()
}

pub fn float_list(value: Option<&Value>) -> Vec<f64> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(|v| as_f64(Some(v))).collect())
        .unwrap_or_default()
}

pub fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn u64_list(value: Option<&Value>) -> Vec<u64> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_u64).collect())
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted collaborators for handler tests.

    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::error::LlmError;
    use crate::graph::Collaborators;
    use crate::llm::{CodeGenClient, TokenUsage};
    use crate::sandbox::{CodeSandbox, ExecutionRequest, ExecutionResult};
    use crate::state::{DataFormat, DataSourceRef, RunState};
    use std::sync::Arc;

    /// Replays canned responses in order; errors once they run out.
    #[derive(Default)]
    pub struct ScriptedClient {
        responses: Mutex<Vec<String>>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        pub fn new(responses: &[&str]) -> Self {
            Self {
                responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CodeGenClient for ScriptedClient {
        async fn generate(&self, prompt: &str, _: Option<&str>, _: f64) -> Result<String, LlmError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(LlmError::EmptyResponse);
            }
            Ok(responses.remove(0))
        }

        fn usage(&self) -> TokenUsage {
            TokenUsage::default()
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    /// Returns canned results in order and records every request.
    #[derive(Default)]
    pub struct ScriptedSandbox {
        results: Mutex<Vec<ExecutionResult>>,
        pub requests: Mutex<Vec<ExecutionRequest>>,
    }

    impl ScriptedSandbox {
        pub fn new(results: Vec<ExecutionResult>) -> Self {
            Self {
                results: Mutex::new(results),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CodeSandbox for ScriptedSandbox {
        async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
            self.requests.lock().unwrap().push(request);
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                return ExecutionResult::success(String::new(), String::new(), 0.0);
            }
            results.remove(0)
        }
    }

    pub fn ok(stdout: &str) -> ExecutionResult {
        ExecutionResult::success(stdout.to_string(), String::new(), 0.1)
    }

    pub fn crashed(stderr: &str) -> ExecutionResult {
        ExecutionResult::exited(String::new(), stderr.to_string(), 0.1)
    }

    pub fn collaborators(
        client: Arc<ScriptedClient>,
        sandbox: Arc<ScriptedSandbox>,
    ) -> Collaborators {
        Collaborators::new(client, sandbox)
    }

    pub fn state() -> RunState {
        RunState::new(
            "run-1",
            "predict churn",
            DataSourceRef::new("/data/churn.csv", DataFormat::Csv, 2048),
            "/tmp/run-1",
            3,
        )
    }
}
