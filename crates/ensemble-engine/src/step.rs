//! Workflow step contract

use async_trait::async_trait;
use serde_json::Value;

use crate::context::WorkflowContext;
use crate::definition::StepConfig;
use crate::template;

/// Step failures, by error category
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// Step config failed validation
    #[error("configuration error: {0}")]
    Config(String),

    /// A required input is missing (always fatal to the step)
    #[error("missing required input: {0}")]
    Contract(String),

    /// A required template reference did not resolve
    #[error("template error: {0}")]
    Template(String),

    /// The step exceeded its declared timeout
    #[error("step timed out after {0} ms")]
    Timeout(u64),

    /// A persona reported failure
    #[error("persona failure: {0}")]
    Persona(String),

    /// Repository mutation failed
    #[error("mutation error: {0}")]
    Mutation(String),

    /// Transport-level failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Output could not be parsed into the expected shape
    #[error("parse error: {0}")]
    Parse(String),

    /// Review coordination contract violated
    #[error("coordination error: {0}")]
    Coordination(String),

    /// Anything else
    #[error("{0}")]
    Other(String),
}

/// Exactly one result per execution
#[derive(Debug)]
pub enum StepResult {
    /// The step finished; `outputs` lands in the context's step outputs
    Success { outputs: Value },
    /// The step failed; aborts the workflow unless `abort_on_failure: false`
    Failure { error: StepError },
    /// The step's condition gated it off
    Skipped { reason: String },
}

impl StepResult {
    pub fn success(outputs: Value) -> Self {
        StepResult::Success { outputs }
    }

    pub fn failure(error: StepError) -> Self {
        StepResult::Failure { error }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepResult::Success { .. })
    }
}

/// A registered step type.
///
/// Implementations are stateless singletons; per-run state lives in the
/// [`WorkflowContext`] and per-use parameters in the [`StepConfig`].
#[async_trait]
pub trait WorkflowStep: Send + Sync {
    /// Check the step's config before the workflow starts executing it.
    /// Validation failures fail the workflow at this step.
    fn validate_config(&self, config: &StepConfig) -> Result<(), StepError>;

    /// Whether the step should run, given its condition. The default
    /// evaluates `condition` against the context; composite steps may
    /// override.
    fn should_execute(&self, ctx: &WorkflowContext, config: &StepConfig) -> bool {
        match &config.condition {
            Some(condition) => template::evaluate_condition(ctx, condition),
            None => true,
        }
    }

    /// Run the step once. Retries and timeouts are the engine's job.
    async fn execute(&self, ctx: &mut WorkflowContext, config: &StepConfig) -> StepResult;

    /// Best-effort cleanup after a workflow failure
    async fn cleanup(&self, _ctx: &mut WorkflowContext, _config: &StepConfig) {}
}

/// Fetch a required string parameter from a step config, resolved through
/// the template engine.
pub fn required_str(
    ctx: &WorkflowContext,
    config: &StepConfig,
    key: &str,
) -> Result<String, StepError> {
    match optional_str(ctx, config, key) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(StepError::Contract(format!(
            "step {:?} requires config key {key:?}",
            config.name
        ))),
    }
}

/// Fetch an optional string parameter, resolved through the template engine
pub fn optional_str(ctx: &WorkflowContext, config: &StepConfig, key: &str) -> Option<String> {
    let raw = config.config.get(key)?;
    let resolved = template::resolve_json(ctx, raw);
    match resolved {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(
            serde_json::to_string(&other)
                .unwrap_or_default()
                .trim_matches('"')
                .to_string(),
        ),
    }
}

/// Fetch an optional boolean parameter, tolerating string forms
pub fn optional_bool(ctx: &WorkflowContext, config: &StepConfig, key: &str) -> Option<bool> {
    let raw = config.config.get(key)?;
    match template::resolve_json(ctx, raw) {
        Value::Bool(b) => Some(b),
        Value::String(s) => match s.as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
