//! AnalysisReviewLoopStep: analyst/reviewer iteration with auto-pass

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ensemble_core::client::{self, PersonaClientError};
use ensemble_core::wire::{PersonaRequest, PersonaStatus};
use ensemble_review::interpret_reply_status;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::context::{WorkflowContext, VAR_SKIP_PERSONAS};
use crate::definition::StepConfig;
use crate::engine::EngineServices;
use crate::step::{optional_str, required_str, StepError, StepResult, WorkflowStep};
use crate::template;

const DEFAULT_MAX_ITERATIONS: u64 = 5;
const DEFAULT_WAIT_MS: u64 = 600_000;
const DEFAULT_AUTO_PASS_REASON: &str =
    "Maximum review iterations reached; accepting the last analysis with reviewer feedback attached";

/// Runs the analyst persona, has the reviewer persona judge the result, and
/// iterates on reviewer feedback until the reviewer passes it or
/// `max_iterations` is reached. Reaching the cap auto-passes: the last
/// review is wrapped in a passing record that carries the unresolved
/// feedback forward.
///
/// Config:
///
/// ```yaml
/// config:
///   analyst_persona: implementation-planner   # required
///   reviewer_persona: project-manager         # required
///   max_iterations: 5
///   analysis_intent: analyze_task
///   review_intent: review_analysis
///   payload: { task_id: "${task_id}" }
/// ```
///
/// On completion sets `analysis_request_result`, `analysis_review_result`,
/// `analysis_review_status`, `analysis_iterations`, and `analysis_auto_pass`.
pub struct AnalysisReviewLoopStep {
    services: Arc<EngineServices>,
}

impl AnalysisReviewLoopStep {
    pub fn new(services: Arc<EngineServices>) -> Self {
        Self { services }
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

    /// Normalize reviewer feedback into the fields the analyst prompt uses
    fn feedback_digest(review: &Value) -> Value {
        match review {
            Value::String(text) => json!({"text": text, "status": "fail"}),
            Value::Object(map) => {
                let mut digest = Map::new();
                for key in ["text", "summary", "required_revisions", "reason", "status"] {
                    if let Some(value) = map.get(key) {
                        digest.insert(key.to_string(), value.clone());
                    }
                }
                if let Some(output) = map.get("output") {
                    if let Some(inner) = output.as_object() {
                        for key in ["summary", "required_revisions"] {
                            if let Some(value) = inner.get(key) {
                                digest.entry(key.to_string()).or_insert(value.clone());
                            }
                        }
                    }
                }
                Value::Object(digest)
            }
            other => other.clone(),
        }
    }

    /// Resolve the reviewer's verdict: pre-resolved status variable first,
    /// then the structured status field, then the shared interpreter.
    fn resolve_status(ctx: &WorkflowContext, review_step: &str, review: &Value) -> PersonaStatus {
        if let Some(Value::String(status)) = ctx.get_variable(&format!("{review_step}_status")) {
            let parsed = PersonaStatus::parse(status);
            if parsed != PersonaStatus::Unknown {
                return parsed;
            }
        }
        if let Some(status) = review.get("status").and_then(Value::as_str) {
            let parsed = PersonaStatus::parse(status);
            if parsed != PersonaStatus::Unknown {
                return parsed;
            }
        }
        interpret_reply_status(review)
    }
}

#[async_trait]
impl WorkflowStep for AnalysisReviewLoopStep {
    fn validate_config(&self, config: &StepConfig) -> Result<(), StepError> {
        for key in ["analyst_persona", "reviewer_persona"] {
            if config
                .config
                .get(key)
                .and_then(Value::as_str)
                .map_or(true, str::is_empty)
            {
                return Err(StepError::Config(format!(
                    "analysis_review_loop step {:?} needs config key {key:?}",
                    config.name
                )));
            }
        }
        if let Some(n) = config.config.get("max_iterations").and_then(Value::as_u64) {
            if n == 0 {
                return Err(StepError::Config(
                    "max_iterations must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }

    async fn execute(&self, ctx: &mut WorkflowContext, config: &StepConfig) -> StepResult {
        if ctx.flag(VAR_SKIP_PERSONAS) {
            let review = json!({"status": "pass", "skipped": true});
            ctx.set_variable("analysis_request_result", Value::Null);
            ctx.set_variable("analysis_review_result", review.clone());
            ctx.set_variable("analysis_review_status", json!("pass"));
            ctx.set_variable("analysis_iterations", json!(0));
            ctx.set_variable("analysis_auto_pass", json!(false));
            return StepResult::success(json!({"status": "pass", "skipped": true}));
        }

        let analyst = match required_str(ctx, config, "analyst_persona") {
            Ok(p) => p,
            Err(e) => return StepResult::failure(e),
        };
        let reviewer = match required_str(ctx, config, "reviewer_persona") {
            Ok(p) => p,
            Err(e) => return StepResult::failure(e),
        };
        let max_iterations = config
            .config
            .get("max_iterations")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MAX_ITERATIONS)
            .max(1);
        let analysis_intent =
            optional_str(ctx, config, "analysis_intent").unwrap_or_else(|| "analyze".to_string());
        let review_intent = optional_str(ctx, config, "review_intent")
            .unwrap_or_else(|| "review_analysis".to_string());
        let wait_ms = config
            .config
            .get("wait_ms")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_WAIT_MS);
        let auto_pass_reason = optional_str(ctx, config, "auto_pass_reason")
            .unwrap_or_else(|| DEFAULT_AUTO_PASS_REASON.to_string());
        let base_payload = config
            .config
            .get("payload")
            .map(|raw| template::resolve_json(ctx, raw))
            .unwrap_or_else(|| json!({}));
        let review_step_name = optional_str(ctx, config, "review_step")
            .unwrap_or_else(|| format!("{}_review", config.name));

        let mut initial_analysis: Option<Value> = None;
        let mut previous_analysis: Option<Value> = None;
        let mut last_analysis = Value::Null;
        let mut previous_review: Option<Value> = None;
        let mut review_history: Vec<Value> = Vec::new();

        let mut final_review = Value::Null;
        let mut auto_pass = false;
        let mut iterations_used = 0;

        for iteration in 1..=max_iterations {
            iterations_used = iteration;

            // Analyst turn: base payload plus iteration markers and the
            // accumulated review feedback.
            let mut payload = base_payload.as_object().cloned().unwrap_or_default();
            payload.insert("iteration".to_string(), json!(iteration));
            payload.insert("is_revision".to_string(), json!(iteration > 1));
            if let Some(review) = &previous_review {
                payload.insert("previous_review".to_string(), Self::feedback_digest(review));
            }
            if let Some(previous) = &previous_analysis {
                payload.insert("previous_analysis".to_string(), previous.clone());
            }
            if let Some(initial) = &initial_analysis {
                payload.insert("initial_analysis".to_string(), initial.clone());
            }
            if !review_history.is_empty() {
                payload.insert("review_history".to_string(), json!(review_history));
            }
            if iteration > 1 {
                payload.insert(
                    "revision_directive".to_string(),
                    json!("Revise the previous analysis to address every required revision from the reviewer feedback"),
                );
            }

            let analysis_result = match self
                .invoke(
                    ctx,
                    &config.name,
                    &analyst,
                    &analysis_intent,
                    Value::Object(payload),
                    wait_ms,
                )
                .await
            {
                Ok(result) => result,
                Err(e) => return StepResult::failure(e),
            };
            if PersonaStatus::parse(
                analysis_result
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or(""),
            )
            .is_fail()
            {
                return StepResult::failure(StepError::Persona(format!(
                    "analyst {analyst} failed on iteration {iteration}"
                )));
            }

            let analysis_output = analysis_result
                .get("output")
                .filter(|v| !v.is_null())
                .unwrap_or(&analysis_result)
                .clone();
            if initial_analysis.is_none() {
                initial_analysis = Some(analysis_output.clone());
            }
            previous_analysis = Some(analysis_output.clone());
            last_analysis = analysis_output.clone();

            // Reviewer turn
            let mut review_payload = base_payload.as_object().cloned().unwrap_or_default();
            review_payload.insert("iteration".to_string(), json!(iteration));
            review_payload.insert("analysis".to_string(), analysis_output);
            let review_result = match self
                .invoke(
                    ctx,
                    &review_step_name,
                    &reviewer,
                    &review_intent,
                    Value::Object(review_payload),
                    wait_ms,
                )
                .await
            {
                Ok(result) => result,
                Err(e) => return StepResult::failure(e),
            };

            let status = Self::resolve_status(ctx, &review_step_name, &review_result);
            info!(
                step = %config.name,
                iteration,
                max_iterations,
                ?status,
                "review iteration finished"
            );

            if status.is_pass() {
                final_review = review_result;
                auto_pass = false;
                break;
            }

            review_history.push(json!({
                "iteration": iteration,
                "status": "fail",
                "feedback": Self::feedback_digest(&review_result),
            }));

            if iteration == max_iterations {
                warn!(
                    step = %config.name,
                    iterations = max_iterations,
                    "review never passed, auto-passing with feedback attached"
                );
                final_review = json!({
                    "status": "pass",
                    "auto_pass": true,
                    "reason": auto_pass_reason,
                    "previous_feedback": review_result,
                });
                auto_pass = true;
                break;
            }

            previous_review = Some(review_result);
        }

        let final_status = "pass";
        ctx.set_variable("analysis_request_result", last_analysis.clone());
        ctx.set_variable("analysis_review_result", final_review.clone());
        ctx.set_variable("analysis_review_status", json!(final_status));
        ctx.set_variable("analysis_iterations", json!(iterations_used));
        ctx.set_variable("analysis_auto_pass", json!(auto_pass));

        StepResult::success(json!({
            "status": final_status,
            "auto_pass": auto_pass,
            "iterations": iterations_used,
            "analysis": last_analysis,
            "review": final_review,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_core::wire::PersonaEvent;
    use ensemble_transport::{AddId, GroupStart, MemoryTransport, ReadOptions, ReadTarget};

    fn services() -> Arc<EngineServices> {
        Arc::new(EngineServices::new(Arc::new(MemoryTransport::new())))
    }

    fn loop_config(max_iterations: u64) -> StepConfig {
        StepConfig::new("analysis", "analysis_review_loop").with_config(json!({
            "analyst_persona": "implementation-planner",
            "reviewer_persona": "project-manager",
            "max_iterations": max_iterations,
            "wait_ms": 3000,
        }))
    }

    /// Scripted personas: the analyst always passes; the reviewer's verdicts
    /// come from the queue, repeating the last one when drained.
    fn spawn_personas(services: Arc<EngineServices>, reviewer_verdicts: Vec<&'static str>) {
        let transport = Arc::clone(&services.transport);
        let request_stream = services.request_stream.clone();
        let response_stream = services.response_stream.clone();

        tokio::spawn(async move {
            transport
                .create_group(&request_stream, "personas", GroupStart::Oldest, true)
                .await
                .unwrap();
            let mut verdicts = reviewer_verdicts.into_iter();
            let mut last = "fail";

            loop {
                let Some(batches) = transport
                    .read_group(
                        "personas",
                        "c",
                        &[(request_stream.clone(), ReadTarget::New)],
                        ReadOptions::new().with_block(Duration::from_millis(200)),
                    )
                    .await
                    .unwrap()
                else {
                    continue;
                };
                for batch in batches {
                    for message in batch.messages {
                        transport
                            .ack(&request_stream, "personas", message.id)
                            .await
                            .unwrap();
                        let request = PersonaRequest::from_fields(&message.fields).unwrap();
                        let persona = request.to_persona.clone().unwrap_or_default();
                        let result = if persona == "project-manager" {
                            let verdict = verdicts.next().unwrap_or(last);
                            last = verdict;
                            json!({
                                "status": verdict,
                                "output": {"summary": "needs work", "required_revisions": ["tighten scope"]},
                            })
                        } else {
                            json!({
                                "status": "pass",
                                "output": {"plan": "do the thing", "iteration": request.payload["iteration"]},
                            })
                        };
                        let event = PersonaEvent {
                            workflow_id: request.workflow_id,
                            corr_id: request.corr_id,
                            from: persona,
                            result,
                        };
                        transport
                            .add(&response_stream, AddId::Auto, event.to_fields())
                            .await
                            .unwrap();
                    }
                }
            }
        });
    }

    #[tokio::test]
    async fn test_pass_on_first_iteration() {
        let services = services();
        spawn_personas(Arc::clone(&services), vec!["pass"]);
        let step = AnalysisReviewLoopStep::new(Arc::clone(&services));
        let mut ctx = WorkflowContext::new("wf-loop", "p", "/tmp/repo", "main");

        let result = step.execute(&mut ctx, &loop_config(5)).await;
        let StepResult::Success { outputs } = result else {
            panic!("expected success");
        };
        assert_eq!(outputs["iterations"], 1);
        assert_eq!(outputs["auto_pass"], false);
        assert_eq!(ctx.get_variable("analysis_iterations"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_revision_then_pass() {
        let services = services();
        spawn_personas(Arc::clone(&services), vec!["fail", "pass"]);
        let step = AnalysisReviewLoopStep::new(Arc::clone(&services));
        let mut ctx = WorkflowContext::new("wf-loop", "p", "/tmp/repo", "main");

        let result = step.execute(&mut ctx, &loop_config(5)).await;
        let StepResult::Success { outputs } = result else {
            panic!("expected success");
        };
        assert_eq!(outputs["iterations"], 2);
        assert_eq!(outputs["auto_pass"], false);
    }

    #[tokio::test]
    async fn test_auto_pass_after_max_iterations() {
        let services = services();
        spawn_personas(Arc::clone(&services), vec!["fail", "fail", "fail"]);
        let step = AnalysisReviewLoopStep::new(Arc::clone(&services));
        let mut ctx = WorkflowContext::new("wf-loop", "p", "/tmp/repo", "main");

        let result = step.execute(&mut ctx, &loop_config(3)).await;
        let StepResult::Success { outputs } = result else {
            panic!("expected success");
        };

        assert_eq!(
            ctx.get_variable("analysis_review_status"),
            Some(&json!("pass"))
        );
        assert_eq!(ctx.get_variable("analysis_auto_pass"), Some(&json!(true)));
        assert_eq!(ctx.get_variable("analysis_iterations"), Some(&json!(3)));
        let review = ctx.get_variable("analysis_review_result").unwrap();
        assert_eq!(review["auto_pass"], true);
        assert_eq!(review["previous_feedback"]["status"], "fail");
        assert_eq!(outputs["review"]["auto_pass"], true);
    }

    #[tokio::test]
    async fn test_validate_rejects_zero_iterations() {
        let step = AnalysisReviewLoopStep::new(services());
        let config = StepConfig::new("loop", "analysis_review_loop").with_config(json!({
            "analyst_persona": "a",
            "reviewer_persona": "b",
            "max_iterations": 0,
        }));
        assert!(step.validate_config(&config).is_err());
    }
}
