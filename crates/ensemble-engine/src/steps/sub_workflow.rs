//! SubWorkflowStep: run a child workflow definition

use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::context::{
    WorkflowContext, VAR_PROJECT_ID, VAR_REPO_REMOTE, VAR_SKIP_GIT, VAR_SKIP_PERSONAS,
};
use crate::definition::{StepConfig, WorkflowDefinition};
use crate::engine::{EngineServices, RunInputs, WorkflowEngine};
use crate::registry::StepRegistry;
use crate::step::{required_str, StepError, StepResult, WorkflowStep};
use crate::template;

/// Variables a child inherits unless its resolved inputs override them
const INHERITED_VARS: [&str; 4] = [
    VAR_SKIP_GIT,
    VAR_SKIP_PERSONAS,
    VAR_REPO_REMOTE,
    VAR_PROJECT_ID,
];

/// Loads a workflow definition from a file and executes it as a child run.
///
/// Config:
///
/// ```yaml
/// config:
///   path: reviews/qa-loop.yaml         # required, relative to workflows_dir
///   inputs: { task_id: "${task_id}" }  # resolved against the parent context
///   outputs: { qa_verdict: verdict }   # child variable -> parent variable
/// ```
///
/// The child inherits the parent's skip flags, repo remote, and project ID
/// unless `inputs` overrides them. A failing child fails this step.
pub struct SubWorkflowStep {
    services: Arc<EngineServices>,
    /// Back-reference to the registry this step is registered in, so child
    /// workflows see every step type. Weak to avoid a reference cycle.
    registry: OnceLock<Weak<StepRegistry>>,
}

impl SubWorkflowStep {
    pub fn new(services: Arc<EngineServices>) -> Self {
        Self {
            services,
            registry: OnceLock::new(),
        }
    }

    /// Wire the finished registry in after construction (see
    /// [`crate::steps::build_registry`]).
    pub fn attach_registry(&self, registry: &Arc<StepRegistry>) {
        let _ = self.registry.set(Arc::downgrade(registry));
    }
}

#[async_trait]
impl WorkflowStep for SubWorkflowStep {
    fn validate_config(&self, config: &StepConfig) -> Result<(), StepError> {
        if config
            .config
            .get("path")
            .and_then(Value::as_str)
            .map_or(true, str::is_empty)
        {
            return Err(StepError::Config(format!(
                "sub_workflow step {:?} needs config key \"path\"",
                config.name
            )));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &mut WorkflowContext, config: &StepConfig) -> StepResult {
        let Some(registry) = self.registry.get().and_then(Weak::upgrade) else {
            return StepResult::failure(StepError::Config(
                "sub_workflow step has no registry attached".to_string(),
            ));
        };

        let path = match required_str(ctx, config, "path") {
            Ok(p) => p,
            Err(e) => return StepResult::failure(e),
        };
        let full_path = if std::path::Path::new(&path).is_absolute() {
            std::path::PathBuf::from(&path)
        } else {
            self.services.workflows_dir.join(&path)
        };
        let definition = match WorkflowDefinition::load(&full_path) {
            Ok(definition) => definition,
            Err(e) => return StepResult::failure(StepError::Config(e.to_string())),
        };

        // Inherited flags first, then resolved inputs on top
        let mut inputs = RunInputs::new(
            ctx.project_id.clone(),
            ctx.repo_root.clone(),
            ctx.current_branch().to_string(),
        )
        .with_workflow_id(format!("{}:{}", ctx.workflow_id, definition.name));
        for name in INHERITED_VARS {
            if let Some(value) = ctx.get_variable(name) {
                inputs = inputs.with_variable(name, value.clone());
            }
        }
        if let Some(declared) = config.config.get("inputs").and_then(Value::as_object) {
            for (name, raw) in declared {
                inputs = inputs.with_variable(name.clone(), template::resolve_json(ctx, raw));
            }
        }

        info!(
            step = %config.name,
            child = %definition.name,
            path = %full_path.display(),
            "running sub-workflow"
        );
        let engine = WorkflowEngine::new(registry, Arc::clone(&self.services));
        let result = engine.run(&definition, inputs).await;

        if !result.success {
            return StepResult::failure(StepError::Other(format!(
                "sub-workflow {:?} failed at step {:?}: {}",
                definition.name,
                result.failed_step.as_deref().unwrap_or("<none>"),
                result.error.as_deref().unwrap_or("unknown error"),
            )));
        }

        // Map declared child variables back into the parent
        if let Some(mappings) = config.config.get("outputs").and_then(Value::as_object) {
            for (child_var, parent_var) in mappings {
                let Some(parent_var) = parent_var.as_str() else {
                    continue;
                };
                let value = result
                    .final_context
                    .get_variable(child_var)
                    .cloned()
                    .unwrap_or(Value::Null);
                ctx.set_variable(parent_var, value);
            }
        }

        StepResult::success(json!({
            "workflow": definition.name,
            "completed_steps": result.completed_steps,
            "skipped_steps": result.skipped_steps,
            "duration_ms": result.duration.as_millis() as u64,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::build_registry;
    use ensemble_transport::MemoryTransport;

    fn write_child(dir: &std::path::Path, name: &str, body: &str) {
        std::fs::write(dir.join(name), body).unwrap();
    }

    fn services(workflows_dir: &std::path::Path) -> Arc<EngineServices> {
        Arc::new(
            EngineServices::new(Arc::new(MemoryTransport::new()))
                .with_workflows_dir(workflows_dir),
        )
    }

    #[tokio::test]
    async fn test_child_runs_and_maps_outputs() {
        let dir = tempfile::tempdir().unwrap();
        // The child scans the repo and exports the file count
        write_child(
            dir.path(),
            "child.yaml",
            r#"
name: child-scan
steps:
  - name: scan
    type: context_scan
    outputs:
      child_file_count: file_count
"#,
        );
        let repo = tempfile::tempdir().unwrap();
        std::fs::write(repo.path().join("a.rs"), "fn a() {}\n").unwrap();

        let services = services(dir.path());
        let registry = build_registry(Arc::clone(&services));
        let step = registry.get("sub_workflow").unwrap();

        let mut ctx = WorkflowContext::new("wf-parent", "p", repo.path(), "main");
        ctx.set_variable(VAR_SKIP_GIT, json!(true));
        let config = StepConfig::new("delegate", "sub_workflow").with_config(json!({
            "path": "child.yaml",
            "outputs": {"child_file_count": "scan_file_count"},
        }));

        let StepResult::Success { outputs } = step.execute(&mut ctx, &config).await else {
            panic!("expected success");
        };
        assert_eq!(outputs["workflow"], "child-scan");
        assert_eq!(ctx.get_variable("scan_file_count"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_inputs_override_inherited_flags() {
        let dir = tempfile::tempdir().unwrap();
        // persona_request under SKIP_PERSONA_OPERATIONS=true simulates pass;
        // the child only succeeds if the flag survived inheritance.
        write_child(
            dir.path(),
            "child.yaml",
            r#"
name: child-personas
steps:
  - name: ping
    type: persona_request
    config:
      persona: tester-qa
      intent: ping
      wait_ms: 200
"#,
        );
        let repo = tempfile::tempdir().unwrap();

        let services = services(dir.path());
        let registry = build_registry(Arc::clone(&services));
        let step = registry.get("sub_workflow").unwrap();

        let mut ctx = WorkflowContext::new("wf-parent", "p", repo.path(), "main");
        ctx.set_variable(VAR_SKIP_PERSONAS, json!(true));
        let config = StepConfig::new("delegate", "sub_workflow")
            .with_config(json!({"path": "child.yaml"}));
        assert!(step.execute(&mut ctx, &config).await.is_success());

        // Overriding the inherited flag makes the child actually wait (and
        // time out against the empty bus).
        let config = StepConfig::new("delegate", "sub_workflow").with_config(json!({
            "path": "child.yaml",
            "inputs": {"SKIP_PERSONA_OPERATIONS": false},
        }));
        let result = step.execute(&mut ctx, &config).await;
        assert!(matches!(result, StepResult::Failure { .. }));
    }

    #[tokio::test]
    async fn test_missing_child_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let services = services(dir.path());
        let registry = build_registry(Arc::clone(&services));
        let step = registry.get("sub_workflow").unwrap();

        let mut ctx = WorkflowContext::new("wf", "p", "/tmp/repo", "main");
        let config = StepConfig::new("delegate", "sub_workflow")
            .with_config(json!({"path": "ghost.yaml"}));
        assert!(matches!(
            step.execute(&mut ctx, &config).await,
            StepResult::Failure { .. }
        ));
    }
}
