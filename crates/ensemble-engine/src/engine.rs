//! Workflow execution
//!
//! Drives one workflow definition over one context: condition gate, config
//! validation, retry with exponential backoff (1 s base, 5 s cap), optional
//! per-step timeout, output aliasing, and the abort-on-failure contract.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ensemble_core::dashboard::DashboardClient;
use ensemble_transport::StreamTransport;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::context::WorkflowContext;
use crate::definition::{StepConfig, WorkflowDefinition};
use crate::registry::StepRegistry;
use crate::step::{StepError, StepResult};

/// Shared services every step can reach
pub struct EngineServices {
    pub transport: Arc<dyn StreamTransport>,
    pub dashboard: Option<Arc<dyn DashboardClient>>,
    pub request_stream: String,
    pub response_stream: String,
    /// Repo mutation policy knobs (see `ensemble-repo`)
    pub allow_workspace_git: bool,
    pub blocked_exts: Vec<String>,
    pub write_diagnostics: bool,
    /// Base directory sub-workflow paths resolve against
    pub workflows_dir: PathBuf,
}

impl EngineServices {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        Self {
            transport,
            dashboard: None,
            request_stream: "ensemble:requests".to_string(),
            response_stream: "ensemble:events".to_string(),
            allow_workspace_git: false,
            blocked_exts: Vec::new(),
            write_diagnostics: true,
            workflows_dir: PathBuf::from("workflows"),
        }
    }

    pub fn with_dashboard(mut self, dashboard: Arc<dyn DashboardClient>) -> Self {
        self.dashboard = Some(dashboard);
        self
    }

    pub fn with_streams(
        mut self,
        request_stream: impl Into<String>,
        response_stream: impl Into<String>,
    ) -> Self {
        self.request_stream = request_stream.into();
        self.response_stream = response_stream.into();
        self
    }

    pub fn with_workflows_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workflows_dir = dir.into();
        self
    }
}

/// Runtime inputs for one workflow run
#[derive(Debug, Clone)]
pub struct RunInputs {
    pub workflow_id: String,
    pub project_id: String,
    pub repo_root: PathBuf,
    pub branch: String,
    pub initial_variables: HashMap<String, Value>,
}

impl RunInputs {
    pub fn new(
        project_id: impl Into<String>,
        repo_root: impl Into<PathBuf>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id: Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            repo_root: repo_root.into(),
            branch: branch.into(),
            initial_variables: HashMap::new(),
        }
    }

    pub fn with_workflow_id(mut self, id: impl Into<String>) -> Self {
        self.workflow_id = id.into();
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.initial_variables.insert(name.into(), value);
        self
    }
}

/// Report of one finished run
#[derive(Debug)]
pub struct WorkflowRunResult {
    pub success: bool,
    pub failed_step: Option<String>,
    pub error: Option<String>,
    pub completed_steps: Vec<String>,
    pub skipped_steps: Vec<String>,
    /// Steps that failed but carried `abort_on_failure: false`
    pub tolerated_failures: Vec<String>,
    pub duration: Duration,
    pub final_context: WorkflowContext,
}

/// Backoff before retry `attempt` (1-based retry count): 1 s, 2 s, 4 s,
/// then capped at 5 s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(3);
    Duration::from_secs((1u64 << exp).min(5))
}

/// Executes workflow definitions
pub struct WorkflowEngine {
    registry: Arc<StepRegistry>,
    services: Arc<EngineServices>,
}

impl WorkflowEngine {
    pub fn new(registry: Arc<StepRegistry>, services: Arc<EngineServices>) -> Self {
        Self { registry, services }
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    /// Run `definition` to completion or first aborting failure.
    #[instrument(skip(self, definition, inputs), fields(workflow = %definition.name, workflow_id = %inputs.workflow_id))]
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        inputs: RunInputs,
    ) -> WorkflowRunResult {
        let started = Instant::now();
        let mut ctx = WorkflowContext::new(
            inputs.workflow_id.clone(),
            inputs.project_id.clone(),
            inputs.repo_root.clone(),
            inputs.branch.clone(),
        );
        for (name, value) in inputs.initial_variables {
            ctx.set_variable(name, value);
        }

        let mut completed_steps = Vec::new();
        let mut skipped_steps = Vec::new();
        let mut tolerated_failures = Vec::new();

        info!(steps = definition.steps.len(), "workflow starting");

        for step_config in &definition.steps {
            let step_name = step_config.name.clone();

            let Some(step) = self.registry.get(&step_config.step_type) else {
                error!(step = %step_name, step_type = %step_config.step_type, "unknown step type");
                return self.failed(
                    ctx,
                    started,
                    step_name,
                    StepError::Config(format!("unknown step type {:?}", step_config.step_type)),
                    completed_steps,
                    skipped_steps,
                    tolerated_failures,
                );
            };

            if !step.should_execute(&ctx, step_config) {
                debug!(step = %step_name, "condition false, skipping");
                skipped_steps.push(step_name);
                continue;
            }

            if let Err(error) = step.validate_config(step_config) {
                error!(step = %step_name, %error, "step config invalid");
                return self.failed(
                    ctx,
                    started,
                    step_name,
                    error,
                    completed_steps,
                    skipped_steps,
                    tolerated_failures,
                );
            }

            match self.run_step(&mut ctx, step.as_ref(), step_config).await {
                StepResult::Success { outputs } => {
                    apply_output_aliases(&mut ctx, step_config, &outputs);
                    ctx.set_step_output(step_name.clone(), outputs);
                    completed_steps.push(step_name);
                }
                StepResult::Skipped { reason } => {
                    debug!(step = %step_name, reason, "step skipped itself");
                    skipped_steps.push(step_name);
                }
                StepResult::Failure { error } => {
                    if step_config.abort_on_failure {
                        error!(step = %step_name, %error, "step failed, aborting workflow");
                        step.cleanup(&mut ctx, step_config).await;
                        return self.failed(
                            ctx,
                            started,
                            step_name,
                            error,
                            completed_steps,
                            skipped_steps,
                            tolerated_failures,
                        );
                    }
                    warn!(step = %step_name, %error, "step failed, continuing (abort_on_failure = false)");
                    tolerated_failures.push(step_name);
                }
            }
        }

        let duration = started.elapsed();
        info!(
            completed = completed_steps.len(),
            skipped = skipped_steps.len(),
            ?duration,
            "workflow finished"
        );
        WorkflowRunResult {
            success: true,
            failed_step: None,
            error: None,
            completed_steps,
            skipped_steps,
            tolerated_failures,
            duration,
            final_context: ctx,
        }
    }

    /// One step with retries and timeout
    async fn run_step(
        &self,
        ctx: &mut WorkflowContext,
        step: &dyn crate::step::WorkflowStep,
        config: &StepConfig,
    ) -> StepResult {
        let attempts = 1 + config.max_retries.unwrap_or(0);

        for attempt in 1..=attempts {
            let result = match config.timeout_ms {
                Some(timeout_ms) => {
                    match tokio::time::timeout(
                        Duration::from_millis(timeout_ms),
                        step.execute(ctx, config),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => StepResult::failure(StepError::Timeout(timeout_ms)),
                    }
                }
                None => step.execute(ctx, config).await,
            };

            match &result {
                StepResult::Failure { error } if attempt < attempts => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        step = %config.name,
                        attempt,
                        max_attempts = attempts,
                        %error,
                        ?delay,
                        "step attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                _ => return result,
            }
        }

        // The loop always returns; retries exhausted end in the last failure.
        unreachable!("retry loop must return a result")
    }

    #[allow(clippy::too_many_arguments)]
    fn failed(
        &self,
        ctx: WorkflowContext,
        started: Instant,
        failed_step: String,
        error: StepError,
        completed_steps: Vec<String>,
        skipped_steps: Vec<String>,
        tolerated_failures: Vec<String>,
    ) -> WorkflowRunResult {
        WorkflowRunResult {
            success: false,
            failed_step: Some(failed_step),
            error: Some(error.to_string()),
            completed_steps,
            skipped_steps,
            tolerated_failures,
            duration: started.elapsed(),
            final_context: ctx,
        }
    }
}

/// Copy declared output aliases into variables: `alias -> source` takes
/// `outputs[source]` (dot paths allowed) into the variable `alias`.
fn apply_output_aliases(ctx: &mut WorkflowContext, config: &StepConfig, outputs: &Value) {
    for (alias, source) in &config.outputs {
        let mut value = Some(outputs);
        for segment in source.split('.') {
            value = value.and_then(|v| v.get(segment));
        }
        ctx.set_variable(alias.clone(), value.cloned().unwrap_or(Value::Null));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::WorkflowStep;
    use async_trait::async_trait;
    use ensemble_transport::MemoryTransport;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn services() -> Arc<EngineServices> {
        Arc::new(EngineServices::new(Arc::new(MemoryTransport::new())))
    }

    /// Step that records outputs from its config
    struct EchoStep;

    #[async_trait]
    impl WorkflowStep for EchoStep {
        fn validate_config(&self, _config: &StepConfig) -> Result<(), StepError> {
            Ok(())
        }

        async fn execute(&self, _ctx: &mut WorkflowContext, config: &StepConfig) -> StepResult {
            StepResult::success(config.config.clone())
        }
    }

    /// Step that fails a configured number of times before succeeding
    struct FlakyStep {
        failures: AtomicU32,
    }

    #[async_trait]
    impl WorkflowStep for FlakyStep {
        fn validate_config(&self, _config: &StepConfig) -> Result<(), StepError> {
            Ok(())
        }

        async fn execute(&self, _ctx: &mut WorkflowContext, _config: &StepConfig) -> StepResult {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then(|| n - 1)
            })
            .is_ok()
            {
                StepResult::failure(StepError::Other("flaky".to_string()))
            } else {
                StepResult::success(json!({"recovered": true}))
            }
        }
    }

    /// Step that never finishes
    struct HangingStep;

    #[async_trait]
    impl WorkflowStep for HangingStep {
        fn validate_config(&self, _config: &StepConfig) -> Result<(), StepError> {
            Ok(())
        }

        async fn execute(&self, _ctx: &mut WorkflowContext, _config: &StepConfig) -> StepResult {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            StepResult::success(json!({}))
        }
    }

    fn engine_with(steps: Vec<(&str, Arc<dyn WorkflowStep>)>) -> WorkflowEngine {
        let mut registry = StepRegistry::new();
        for (name, step) in steps {
            registry.register(name, step);
        }
        WorkflowEngine::new(Arc::new(registry), services())
    }

    fn inputs() -> RunInputs {
        RunInputs::new("p-1", "/tmp/repo", "main")
    }

    #[tokio::test]
    async fn test_steps_run_in_order_with_outputs() {
        let engine = engine_with(vec![("echo", Arc::new(EchoStep))]);
        let definition = WorkflowDefinition {
            name: "wf".to_string(),
            version: "1".to_string(),
            steps: vec![
                StepConfig::new("first", "echo").with_config(json!({"n": 1})),
                StepConfig::new("second", "echo").with_config(json!({"n": 2})),
            ],
        };

        let result = engine.run(&definition, inputs()).await;
        assert!(result.success);
        assert_eq!(result.completed_steps, vec!["first", "second"]);
        assert_eq!(
            result.final_context.get_step_output("second"),
            Some(&json!({"n": 2}))
        );
    }

    #[tokio::test]
    async fn test_condition_skips_step() {
        let engine = engine_with(vec![("echo", Arc::new(EchoStep))]);
        let definition = WorkflowDefinition {
            name: "wf".to_string(),
            version: "1".to_string(),
            steps: vec![
                StepConfig::new("gated", "echo").with_condition("missing_flag"),
                StepConfig::new("runs", "echo"),
            ],
        };

        let result = engine.run(&definition, inputs()).await;
        assert!(result.success);
        assert_eq!(result.skipped_steps, vec!["gated"]);
        assert_eq!(result.completed_steps, vec!["runs"]);
    }

    #[tokio::test]
    async fn test_failure_aborts_and_reports_step() {
        struct FailStep;
        #[async_trait]
        impl WorkflowStep for FailStep {
            fn validate_config(&self, _c: &StepConfig) -> Result<(), StepError> {
                Ok(())
            }
            async fn execute(&self, _ctx: &mut WorkflowContext, _c: &StepConfig) -> StepResult {
                StepResult::failure(StepError::Contract("task description absent".to_string()))
            }
        }

        let engine = engine_with(vec![
            ("fail", Arc::new(FailStep) as Arc<dyn WorkflowStep>),
            ("echo", Arc::new(EchoStep) as Arc<dyn WorkflowStep>),
        ]);
        let definition = WorkflowDefinition {
            name: "wf".to_string(),
            version: "1".to_string(),
            steps: vec![
                StepConfig::new("breaks", "fail"),
                StepConfig::new("never", "echo"),
            ],
        };

        let result = engine.run(&definition, inputs()).await;
        assert!(!result.success);
        assert_eq!(result.failed_step.as_deref(), Some("breaks"));
        assert!(result.error.as_deref().unwrap().contains("task description absent"));
        assert!(result.completed_steps.is_empty());
    }

    #[tokio::test]
    async fn test_tolerated_failure_continues() {
        struct FailStep;
        #[async_trait]
        impl WorkflowStep for FailStep {
            fn validate_config(&self, _c: &StepConfig) -> Result<(), StepError> {
                Ok(())
            }
            async fn execute(&self, _ctx: &mut WorkflowContext, _c: &StepConfig) -> StepResult {
                StepResult::failure(StepError::Other("optional".to_string()))
            }
        }

        let engine = engine_with(vec![
            ("fail", Arc::new(FailStep) as Arc<dyn WorkflowStep>),
            ("echo", Arc::new(EchoStep) as Arc<dyn WorkflowStep>),
        ]);
        let mut optional = StepConfig::new("optional", "fail");
        optional.abort_on_failure = false;
        let definition = WorkflowDefinition {
            name: "wf".to_string(),
            version: "1".to_string(),
            steps: vec![optional, StepConfig::new("after", "echo")],
        };

        let result = engine.run(&definition, inputs()).await;
        assert!(result.success);
        assert_eq!(result.tolerated_failures, vec!["optional"]);
        assert_eq!(result.completed_steps, vec!["after"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_backoff_then_succeed() {
        let engine = engine_with(vec![(
            "flaky",
            Arc::new(FlakyStep {
                failures: AtomicU32::new(2),
            }) as Arc<dyn WorkflowStep>,
        )]);
        let mut step = StepConfig::new("flaky", "flaky");
        step.max_retries = Some(3);
        let definition = WorkflowDefinition {
            name: "wf".to_string(),
            version: "1".to_string(),
            steps: vec![step],
        };

        let result = engine.run(&definition, inputs()).await;
        assert!(result.success);
        assert_eq!(
            result.final_context.get_step_output("flaky"),
            Some(&json!({"recovered": true}))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_step() {
        let engine = engine_with(vec![("hang", Arc::new(HangingStep) as Arc<dyn WorkflowStep>)]);
        let mut step = StepConfig::new("hangs", "hang");
        step.timeout_ms = Some(50);
        let definition = WorkflowDefinition {
            name: "wf".to_string(),
            version: "1".to_string(),
            steps: vec![step],
        };

        let result = engine.run(&definition, inputs()).await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_output_aliases_set_variables() {
        let engine = engine_with(vec![("echo", Arc::new(EchoStep))]);
        let mut step =
            StepConfig::new("scan", "echo").with_config(json!({"stats": {"files": 12}}));
        step.outputs
            .insert("file_count".to_string(), "stats.files".to_string());
        let definition = WorkflowDefinition {
            name: "wf".to_string(),
            version: "1".to_string(),
            steps: vec![step],
        };

        let result = engine.run(&definition, inputs()).await;
        assert_eq!(
            result.final_context.get_variable("file_count"),
            Some(&json!(12))
        );
    }

    #[test]
    fn test_backoff_shape() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(4), Duration::from_secs(5));
        assert_eq!(backoff_delay(10), Duration::from_secs(5));
    }
}
