//! ReviewCoordinationStep: act on a failed review
//!
//! For `qa`, `code_review`, and `security_review` outcomes: a passing review
//! is a no-op; a failing one either spawns the PM's follow-up tasks on the
//! dashboard or iterates the implementation plan, depending on whether the
//! reviewed task is itself a follow-up of an earlier review.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ensemble_core::client::{self, PersonaClientError};
use ensemble_core::dashboard::{DashboardClient, NewTask};
use ensemble_core::personas;
use ensemble_core::wire::{PersonaRequest, PersonaStatus};
use ensemble_review::{
    enforce_qa_followup_guard, interpret_reply_status, BlockingIssue, FollowUpTask, PmDecision,
};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::context::{WorkflowContext, VAR_SKIP_PERSONAS};
use crate::definition::StepConfig;
use crate::engine::EngineServices;
use crate::step::{optional_bool, optional_str, required_str, StepError, StepResult, WorkflowStep};

const DEFAULT_MAX_PLAN_REVISIONS: u64 = 5;
const DEFAULT_WAIT_MS: u64 = 600_000;

const REVIEW_TYPES: [&str; 3] = ["qa", "code_review", "security_review"];

/// Coordination after a review verdict.
///
/// Config:
///
/// ```yaml
/// config:
///   review_type: qa                    # required: qa | code_review | security_review
///   source_step: qa_check              # required: the reviewing step
///   mode: auto                         # auto | new_tasks | iterate_plan
///   max_plan_revisions: 5
///   urgent: true                       # security reviews are always urgent
///   task_id: "${task_id}"
///   parent_task_id: "${parent_task_id}"   # presence marks this task a follow-up
/// ```
///
/// Requires the `pm_decision` variable (set by `pm_decision_parser`) when
/// the review failed.
pub struct ReviewCoordinationStep {
    services: Arc<EngineServices>,
}

impl ReviewCoordinationStep {
    pub fn new(services: Arc<EngineServices>) -> Self {
        Self { services }
    }

    fn resolve_status(ctx: &WorkflowContext, source_step: &str, output: &Value) -> PersonaStatus {
        if let Some(Value::String(status)) = ctx.get_variable(&format!("{source_step}_status")) {
            let parsed = PersonaStatus::parse(status);
            if parsed != PersonaStatus::Unknown {
                return parsed;
            }
        }
        if let Some(status) = output.get("status").and_then(Value::as_str) {
            let parsed = PersonaStatus::parse(status);
            if parsed != PersonaStatus::Unknown {
                return parsed;
            }
        }
        interpret_reply_status(output)
    }

    /// Blocking issues carried by the review output, wherever the persona
    /// put them.
    fn blocking_issues(output: &Value) -> Vec<BlockingIssue> {
        let candidates = [
            output.get("blocking_issues"),
            output.get("output").and_then(|o| o.get("blocking_issues")),
            output.get("issues"),
            output.get("output").and_then(|o| o.get("issues")),
        ];
        let Some(items) = candidates.into_iter().flatten().find_map(Value::as_array) else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| match item {
                Value::String(text) => Some(BlockingIssue::new(text.clone(), String::new())),
                Value::Object(map) => {
                    let title = map.get("title").and_then(Value::as_str).unwrap_or_default();
                    let description = map
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    if title.is_empty() && description.is_empty() {
                        None
                    } else {
                        Some(BlockingIssue::new(title, description))
                    }
                }
                _ => None,
            })
            .collect()
    }

    async fn create_follow_up_tasks(
        &self,
        ctx: &WorkflowContext,
        tasks: &[FollowUpTask],
        urgent: bool,
        parent_task_id: Option<String>,
    ) -> Result<Vec<String>, StepError> {
        let Some(dashboard) = &self.services.dashboard else {
            return Err(StepError::Contract(
                "review coordination needs a dashboard client to create follow-up tasks"
                    .to_string(),
            ));
        };

        let mut created = Vec::with_capacity(tasks.len());
        for task in tasks {
            let priority = if urgent { task.priority_score } else { 50 };
            let id = dashboard
                .create_task(NewTask {
                    project_id: ctx.project_id.clone(),
                    title: task.title.clone(),
                    description: task.description.clone(),
                    priority,
                    milestone_id: task.milestone_id.clone(),
                    assignee_persona: task.assignee_persona.clone(),
                    parent_task_id: parent_task_id.clone(),
                    labels: vec!["review-follow-up".to_string()],
                })
                .await
                .map_err(|e| StepError::Coordination(e.to_string()))?;
            created.push(id);
        }
        Ok(created)
    }

    async fn invoke(
        &self,
        ctx: &WorkflowContext,
        step_name: &str,
        persona: &str,
        intent: &str,
        payload: Value,
        wait_ms: u64,
    ) -> Result<Value, StepError> {
        let request = PersonaRequest {
            workflow_id: ctx.workflow_id.clone(),
            to_persona: Some(persona.to_string()),
            step: step_name.to_string(),
            intent: intent.to_string(),
            corr_id: client::new_corr_id(),
            from: Some("workflow-engine".to_string()),
            task_id: ctx
                .get_variable("task_id")
                .and_then(Value::as_str)
                .map(String::from),
            payload,
            repo: None,
            branch: Some(ctx.current_branch().to_string()),
            project_id: Some(ctx.project_id.clone()),
        };
        let event = client::request_persona(
            &self.services.transport,
            &self.services.request_stream,
            &self.services.response_stream,
            request,
            Duration::from_millis(wait_ms),
        )
        .await
        .map_err(|e| match e {
            PersonaClientError::Timeout(..) => StepError::Timeout(wait_ms),
            PersonaClientError::Transport(e) => StepError::Transport(e.to_string()),
        })?;
        Ok(event.result)
    }

    /// Evaluator/planner cycles until the evaluator accepts the revised plan
    /// or revisions run out.
    async fn iterate_plan(
        &self,
        ctx: &WorkflowContext,
        config: &StepConfig,
        review_output: &Value,
        max_revisions: u64,
        wait_ms: u64,
    ) -> Result<(u64, &'static str), StepError> {
        if ctx.flag(VAR_SKIP_PERSONAS) {
            return Ok((0, "pass"));
        }
        let evaluator = optional_str(ctx, config, "evaluator_persona")
            .unwrap_or_else(|| personas::PROJECT_MANAGER.to_string());
        let planner = optional_str(ctx, config, "planner_persona")
            .unwrap_or_else(|| personas::IMPLEMENTATION_PLANNER.to_string());

        let mut feedback = review_output.clone();
        for revision in 1..=max_revisions {
            let revised = self
                .invoke(
                    ctx,
                    &config.name,
                    &planner,
                    "revise_plan",
                    json!({"revision": revision, "review_feedback": feedback}),
                    wait_ms,
                )
                .await?;

            let evaluation = self
                .invoke(
                    ctx,
                    &config.name,
                    &evaluator,
                    "evaluate_plan",
                    json!({"revision": revision, "plan": revised.get("output").unwrap_or(&revised)}),
                    wait_ms,
                )
                .await?;

            if Self::resolve_status(ctx, "", &evaluation).is_pass() {
                return Ok((revision, "pass"));
            }
            feedback = evaluation;
        }
        Ok((max_revisions, "exhausted"))
    }
}

#[async_trait]
impl WorkflowStep for ReviewCoordinationStep {
    fn validate_config(&self, config: &StepConfig) -> Result<(), StepError> {
        let review_type = config
            .config
            .get("review_type")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !REVIEW_TYPES.contains(&review_type) {
            return Err(StepError::Config(format!(
                "review_coordination step {:?} needs review_type one of {REVIEW_TYPES:?}",
                config.name
            )));
        }
        if config
            .config
            .get("source_step")
            .and_then(Value::as_str)
            .map_or(true, str::is_empty)
        {
            return Err(StepError::Config(format!(
                "review_coordination step {:?} needs config key \"source_step\"",
                config.name
            )));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &mut WorkflowContext, config: &StepConfig) -> StepResult {
        let review_type = match required_str(ctx, config, "review_type") {
            Ok(t) => t,
            Err(e) => return StepResult::failure(e),
        };
        let source_step = match required_str(ctx, config, "source_step") {
            Ok(s) => s,
            Err(e) => return StepResult::failure(e),
        };
        let Some(review_output) = ctx.get_step_output(&source_step).cloned() else {
            return StepResult::failure(StepError::Contract(format!(
                "review_coordination source step {source_step:?} produced no output"
            )));
        };

        let status = Self::resolve_status(ctx, &source_step, &review_output);
        if status.is_pass() {
            info!(step = %config.name, review_type, "review passed, nothing to coordinate");
            return StepResult::success(json!({"action": "none", "status": "pass"}));
        }

        let decision: PmDecision = match ctx
            .get_variable("pm_decision")
            .cloned()
            .map(serde_json::from_value)
        {
            Some(Ok(decision)) => decision,
            Some(Err(e)) => {
                return StepResult::failure(StepError::Parse(format!(
                    "pm_decision variable is not a valid decision record: {e}"
                )))
            }
            None => {
                return StepResult::failure(StepError::Contract(
                    "review_coordination needs the pm_decision variable (run pm_decision_parser first)"
                        .to_string(),
                ))
            }
        };

        let blocking = Self::blocking_issues(&review_output);
        if review_type == "qa" {
            if let Err(e) = enforce_qa_followup_guard(&blocking, &decision.follow_up_tasks) {
                warn!(step = %config.name, "QA follow-up guard rejected the decision: {e}");
                return StepResult::failure(StepError::Coordination(e.to_string()));
            }
        }

        // Security findings are always treated as urgent
        let urgent = if review_type == "security_review" {
            true
        } else {
            optional_bool(ctx, config, "urgent").unwrap_or(true)
        };

        let parent_task_id = optional_str(ctx, config, "parent_task_id");
        let mode = optional_str(ctx, config, "mode").unwrap_or_else(|| "auto".to_string());
        let iterate = match mode.as_str() {
            "new_tasks" => false,
            "iterate_plan" => true,
            // auto: iterate when this task is itself a follow-up of a review
            _ => parent_task_id.is_some(),
        };

        if iterate {
            let max_revisions = config
                .config
                .get("max_plan_revisions")
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_MAX_PLAN_REVISIONS);
            let wait_ms = config
                .config
                .get("wait_ms")
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_WAIT_MS);
            let (revisions, outcome) = match self
                .iterate_plan(ctx, config, &review_output, max_revisions, wait_ms)
                .await
            {
                Ok(done) => done,
                Err(e) => return StepResult::failure(e),
            };
            info!(step = %config.name, revisions, outcome, "plan iteration finished");
            return StepResult::success(json!({
                "action": "iterated_plan",
                "revisions": revisions,
                "outcome": outcome,
            }));
        }

        let task_id = optional_str(ctx, config, "task_id");
        let created = match self
            .create_follow_up_tasks(ctx, &decision.follow_up_tasks, urgent, task_id)
            .await
        {
            Ok(created) => created,
            Err(e) => return StepResult::failure(e),
        };
        info!(step = %config.name, created = created.len(), "follow-up tasks created");
        StepResult::success(json!({
            "action": "created_tasks",
            "task_ids": created,
            "urgent": urgent,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_core::dashboard::{MemoryDashboard, ProjectStatus};
    use ensemble_transport::MemoryTransport;

    fn services_with_dashboard() -> (Arc<EngineServices>, Arc<MemoryDashboard>) {
        let dashboard = Arc::new(MemoryDashboard::new());
        dashboard.insert_project(ProjectStatus {
            id: "p".to_string(),
            name: "demo".to_string(),
            status: "active".to_string(),
            repo_url: None,
            default_branch: None,
        });
        let services = Arc::new(
            EngineServices::new(Arc::new(MemoryTransport::new()))
                .with_dashboard(Arc::clone(&dashboard) as Arc<dyn ensemble_core::DashboardClient>),
        );
        (services, dashboard)
    }

    fn decision_variable(tasks: Vec<Value>) -> Value {
        json!({
            "decision": "immediate_fix",
            "reasoning": "issues found",
            "immediate_issues": [],
            "deferred_issues": [],
            "follow_up_tasks": tasks,
            "warnings": [],
        })
    }

    fn follow_up(title: &str, score: i64) -> Value {
        json!({
            "title": title,
            "description": "",
            "priority": "high",
            "priority_score": score,
            "milestone_id": "m-1",
            "assignee_persona": "implementation-planner",
        })
    }

    fn config(review_type: &str) -> StepConfig {
        StepConfig::new("coordinate", "review_coordination").with_config(json!({
            "review_type": review_type,
            "source_step": "qa_check",
        }))
    }

    #[tokio::test]
    async fn test_passing_review_is_noop() {
        let (services, dashboard) = services_with_dashboard();
        let step = ReviewCoordinationStep::new(services);
        let mut ctx = WorkflowContext::new("wf", "p", "/tmp/repo", "main");
        ctx.set_step_output("qa_check", json!({"status": "pass"}));

        let StepResult::Success { outputs } =
            step.execute(&mut ctx, &config("qa")).await
        else {
            panic!("expected success");
        };
        assert_eq!(outputs["action"], "none");
        assert!(dashboard.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_failed_review_creates_follow_up_tasks() {
        let (services, dashboard) = services_with_dashboard();
        let step = ReviewCoordinationStep::new(services);
        let mut ctx = WorkflowContext::new("wf", "p", "/tmp/repo", "main");
        ctx.set_step_output(
            "qa_check",
            json!({"status": "fail", "output": {"blocking_issues": [
                {"title": "Timeout", "description": "integration test times out"}
            ]}}),
        );
        ctx.set_variable(
            "pm_decision",
            decision_variable(vec![follow_up("Fix the flaky integration test", 1200)]),
        );

        let StepResult::Success { outputs } =
            step.execute(&mut ctx, &config("qa")).await
        else {
            panic!("expected success");
        };
        assert_eq!(outputs["action"], "created_tasks");
        let tasks = dashboard.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].priority, 1200);
        assert_eq!(
            tasks[0].assignee_persona.as_deref(),
            Some("implementation-planner")
        );
    }

    #[tokio::test]
    async fn test_qa_guard_blocks_ignored_test_failure() {
        let (services, _dashboard) = services_with_dashboard();
        let step = ReviewCoordinationStep::new(services);
        let mut ctx = WorkflowContext::new("wf", "p", "/tmp/repo", "main");
        ctx.set_step_output(
            "qa_check",
            json!({"status": "fail", "output": {"blocking_issues": [
                {"title": "Broken", "description": "Unable to run tests: test framework missing"}
            ]}}),
        );
        ctx.set_variable(
            "pm_decision",
            decision_variable(vec![follow_up("Refactor validation", 1000)]),
        );

        let StepResult::Failure { error } = step.execute(&mut ctx, &config("qa")).await else {
            panic!("expected failure");
        };
        assert!(error
            .to_string()
            .contains("PM decision ignored QA test failure"));
    }

    #[tokio::test]
    async fn test_missing_pm_decision_is_contract_error() {
        let (services, _dashboard) = services_with_dashboard();
        let step = ReviewCoordinationStep::new(services);
        let mut ctx = WorkflowContext::new("wf", "p", "/tmp/repo", "main");
        ctx.set_step_output("qa_check", json!({"status": "fail"}));

        let result = step.execute(&mut ctx, &config("code_review")).await;
        assert!(matches!(
            result,
            StepResult::Failure {
                error: StepError::Contract(_)
            }
        ));
    }

    #[tokio::test]
    async fn test_follow_up_task_iterates_plan_instead() {
        let (services, dashboard) = services_with_dashboard();
        let step = ReviewCoordinationStep::new(services);
        let mut ctx = WorkflowContext::new("wf", "p", "/tmp/repo", "main");
        // Skip personas so the iteration loop short-circuits to pass
        ctx.set_variable(VAR_SKIP_PERSONAS, json!(true));
        ctx.set_step_output("qa_check", json!({"status": "fail"}));
        ctx.set_variable(
            "pm_decision",
            decision_variable(vec![follow_up("Something", 1000)]),
        );

        let mut step_config = config("code_review");
        step_config.config["parent_task_id"] = json!("task-parent");

        let StepResult::Success { outputs } = step.execute(&mut ctx, &step_config).await else {
            panic!("expected success");
        };
        assert_eq!(outputs["action"], "iterated_plan");
        assert!(dashboard.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_validate_rejects_unknown_review_type() {
        let (services, _dashboard) = services_with_dashboard();
        let step = ReviewCoordinationStep::new(services);
        let bad = StepConfig::new("coordinate", "review_coordination")
            .with_config(json!({"review_type": "vibes", "source_step": "x"}));
        assert!(step.validate_config(&bad).is_err());
    }
}
