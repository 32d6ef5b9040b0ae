//! DiffApplyStep: edit-spec extraction + repo mutation

use std::sync::Arc;

use async_trait::async_trait;
use ensemble_repo::{ApplyOptions, EditSpec, MutationPolicy, RepoMutator};
use serde_json::{json, Value};
use tracing::info;

use crate::context::{WorkflowContext, VAR_SKIP_GIT};
use crate::definition::StepConfig;
use crate::engine::EngineServices;
use crate::step::{optional_str, required_str, StepError, StepResult, WorkflowStep};

/// Parses the source step's output into an [`EditSpec`] and applies it via
/// the repo mutator.
///
/// Config:
///
/// ```yaml
/// config:
///   source_step: implement       # required: step whose output carries the spec
///   commit_message: "${task_title}"
///   push: true
///   blocked_extensions: [".lock"]
/// ```
///
/// Three distinct failures the workflow can tell apart: no ops parsed, ops
/// applied but no files changed, and files changed but no commit produced.
/// The retired `allowed_extensions` option is rejected outright: the policy
/// is deny-list only.
pub struct DiffApplyStep {
    services: Arc<EngineServices>,
}

impl DiffApplyStep {
    pub fn new(services: Arc<EngineServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl WorkflowStep for DiffApplyStep {
    fn validate_config(&self, config: &StepConfig) -> Result<(), StepError> {
        if config.config.get("allowed_extensions").is_some() {
            return Err(StepError::Config(
                "diff_apply no longer supports \"allowed_extensions\"; use \"blocked_extensions\" (deny-list only)"
                    .to_string(),
            ));
        }
        if config
            .config
            .get("source_step")
            .and_then(Value::as_str)
            .map_or(true, str::is_empty)
        {
            return Err(StepError::Config(format!(
                "diff_apply step {:?} needs config key \"source_step\"",
                config.name
            )));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &mut WorkflowContext, config: &StepConfig) -> StepResult {
        let source_step = match required_str(ctx, config, "source_step") {
            Ok(s) => s,
            Err(e) => return StepResult::failure(e),
        };
        let Some(source_output) = ctx.get_step_output(&source_step).cloned() else {
            return StepResult::failure(StepError::Contract(format!(
                "diff_apply source step {source_step:?} produced no output"
            )));
        };

        let Some(spec) = EditSpec::from_output(&source_output) else {
            return StepResult::failure(StepError::Parse(format!(
                "no edit ops parsed from output of step {source_step:?}"
            )));
        };

        let skip_git = ctx.flag(VAR_SKIP_GIT);
        let blocked_exts: Vec<String> = config
            .config
            .get("blocked_extensions")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let policy = MutationPolicy::new(&ctx.repo_root)
            .with_allow_workspace_git(self.services.allow_workspace_git)
            .with_blocked_exts(self.services.blocked_exts.clone());
        let mutator = RepoMutator::new(policy)
            .with_diagnostics(self.services.write_diagnostics)
            .with_diagnostics_dir(ctx.repo_root.join("outputs").join("diagnostics"));

        let options = ApplyOptions {
            commit_message: if skip_git {
                None
            } else {
                Some(
                    optional_str(ctx, config, "commit_message")
                        .unwrap_or_else(|| format!("workflow {}: apply changes", ctx.workflow_id)),
                )
            },
            branch: Some(ctx.current_branch().to_string()),
            push: !skip_git
                && config
                    .config
                    .get("push")
                    .and_then(Value::as_bool)
                    .unwrap_or(true),
            blocked_exts,
        };

        let result = match mutator.apply(&spec, &options).await {
            Ok(result) => result,
            Err(e) => return StepResult::failure(StepError::Mutation(e.to_string())),
        };

        if result.changed.is_empty() {
            return StepResult::failure(StepError::Mutation(format!(
                "edit ops from step {source_step:?} applied but no files changed"
            )));
        }
        if !skip_git && result.sha.is_none() {
            return StepResult::failure(StepError::Mutation(format!(
                "files changed by step {source_step:?} but no commit was produced"
            )));
        }

        info!(
            files = result.changed.len(),
            noop = result.noop,
            sha = result.sha.as_deref().unwrap_or("<uncommitted>"),
            "edit spec applied"
        );
        StepResult::success(json!({
            "changed": result.changed,
            "noop": result.noop,
            "sha": result.sha,
            "pushed": result.pushed,
        }))
    }
}
