//! PersonaRequestStep: one request/await round-trip with a persona

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ensemble_core::client::{self, PersonaClientError};
use ensemble_core::wire::{PersonaRequest, PersonaStatus};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::context::{WorkflowContext, VAR_REPO_REMOTE, VAR_SKIP_PERSONAS};
use crate::definition::StepConfig;
use crate::engine::EngineServices;
use crate::step::{optional_str, required_str, StepError, StepResult, WorkflowStep};
use crate::template;

/// Default wait for a persona reply (10 minutes)
const DEFAULT_WAIT_MS: u64 = 600_000;

/// Sends a request to one persona and waits for the correlated completion.
///
/// Config:
///
/// ```yaml
/// config:
///   persona: tester-qa          # required, templated
///   intent: run_qa              # required
///   payload: { files: "${plan.files}" }   # optional, resolved recursively
///   wait_ms: 120000             # optional
/// ```
///
/// Outputs `{status, result, output}`, and sets the `{step}_status`
/// variable. A reply with status `fail`/`failed` fails the step; with
/// `abort_on_failure: false` the step succeeds instead, keeping the failing
/// reply in its outputs so later steps (conditions, review coordination)
/// can act on it.
pub struct PersonaRequestStep {
    services: Arc<EngineServices>,
}

impl PersonaRequestStep {
    pub fn new(services: Arc<EngineServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl WorkflowStep for PersonaRequestStep {
    fn validate_config(&self, config: &StepConfig) -> Result<(), StepError> {
        for key in ["persona", "intent"] {
            if config.config.get(key).and_then(Value::as_str).map_or(true, str::is_empty) {
                return Err(StepError::Config(format!(
                    "persona_request step {:?} needs config key {key:?}",
                    config.name
                )));
            }
        }
        Ok(())
    }

    async fn execute(&self, ctx: &mut WorkflowContext, config: &StepConfig) -> StepResult {
        if ctx.flag(VAR_SKIP_PERSONAS) {
            debug!(step = %config.name, "persona operations disabled, simulating pass");
            let outputs = json!({"status": "pass", "skipped": true});
            ctx.set_variable(format!("{}_status", config.name), json!("pass"));
            return StepResult::success(outputs);
        }

        let persona = match required_str(ctx, config, "persona") {
            Ok(p) => p,
            Err(e) => return StepResult::failure(e),
        };
        let intent = match required_str(ctx, config, "intent") {
            Ok(i) => i,
            Err(e) => return StepResult::failure(e),
        };
        let payload = config
            .config
            .get("payload")
            .map(|raw| template::resolve_json(ctx, raw))
            .unwrap_or_else(|| json!({}));
        let wait_ms = config
            .config
            .get("wait_ms")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_WAIT_MS);

        let request = PersonaRequest {
            workflow_id: ctx.workflow_id.clone(),
            to_persona: Some(persona.clone()),
            step: config.name.clone(),
            intent,
            corr_id: client::new_corr_id(),
            from: Some("workflow-engine".to_string()),
            task_id: optional_str(ctx, config, "task_id")
                .or_else(|| ctx.get_variable("task_id").and_then(Value::as_str).map(String::from)),
            payload,
            repo: ctx
                .get_variable(VAR_REPO_REMOTE)
                .and_then(Value::as_str)
                .map(String::from),
            branch: Some(ctx.current_branch().to_string()),
            project_id: Some(ctx.project_id.clone()),
        };

        let event = match client::request_persona(
            &self.services.transport,
            &self.services.request_stream,
            &self.services.response_stream,
            request,
            Duration::from_millis(wait_ms),
        )
        .await
        {
            Ok(event) => event,
            Err(PersonaClientError::Timeout(..)) => {
                return StepResult::failure(StepError::Timeout(wait_ms));
            }
            Err(PersonaClientError::Transport(e)) => {
                return StepResult::failure(StepError::Transport(e.to_string()));
            }
        };

        let status = event.status();
        info!(step = %config.name, persona, ?status, "persona completed");
        ctx.set_variable(
            format!("{}_status", config.name),
            json!(match status {
                PersonaStatus::Pass => "pass",
                PersonaStatus::Fail => "fail",
                PersonaStatus::Unknown => "unknown",
            }),
        );

        let output = event.result.get("output").cloned().unwrap_or(Value::Null);
        let outputs = json!({
            "status": match status {
                PersonaStatus::Pass => "pass",
                PersonaStatus::Fail => "fail",
                PersonaStatus::Unknown => "unknown",
            },
            "result": event.result,
            "output": output,
        });

        if status.is_fail() && config.abort_on_failure {
            return StepResult::failure(StepError::Persona(format!(
                "persona {persona} reported failure for step {}",
                config.name
            )));
        }
        StepResult::success(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_core::wire::PersonaEvent;
    use ensemble_transport::{AddId, MemoryTransport, ReadOptions, ReadTarget, StreamTransport};

    fn services() -> Arc<EngineServices> {
        Arc::new(EngineServices::new(Arc::new(MemoryTransport::new())))
    }

    fn step_config(persona: &str) -> StepConfig {
        StepConfig::new("qa_check", "persona_request").with_config(json!({
            "persona": persona,
            "intent": "run_qa",
            "payload": {"branch": "${missing || \"main\"}"},
            "wait_ms": 2000,
        }))
    }

    /// Answer the first request on the stream with the given status
    async fn respond_once(services: Arc<EngineServices>, status: &str) {
        let transport = Arc::clone(&services.transport);
        transport
            .create_group(&services.request_stream, "fake-persona", ensemble_transport::GroupStart::Oldest, true)
            .await
            .unwrap();
        loop {
            let batches = transport
                .read_group(
                    "fake-persona",
                    "c",
                    &[(services.request_stream.clone(), ReadTarget::New)],
                    ReadOptions::new().with_block(Duration::from_millis(500)),
                )
                .await
                .unwrap();
            if let Some(batches) = batches {
                let message = &batches[0].messages[0];
                let request = PersonaRequest::from_fields(&message.fields).unwrap();
                let event = PersonaEvent {
                    workflow_id: request.workflow_id,
                    corr_id: request.corr_id,
                    from: request.to_persona.unwrap_or_default(),
                    result: json!({"status": status, "output": {"notes": "done"}}),
                };
                transport
                    .add(&services.response_stream, AddId::Auto, event.to_fields())
                    .await
                    .unwrap();
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_pass_roundtrip_sets_status_variable() {
        let services = services();
        let step = PersonaRequestStep::new(Arc::clone(&services));
        let mut ctx = WorkflowContext::new("wf-1", "p", "/tmp/repo", "main");

        let responder = tokio::spawn(respond_once(Arc::clone(&services), "pass"));
        let result = step.execute(&mut ctx, &step_config("tester-qa")).await;
        responder.await.unwrap();

        let StepResult::Success { outputs } = result else {
            panic!("expected success");
        };
        assert_eq!(outputs["status"], "pass");
        assert_eq!(outputs["output"]["notes"], "done");
        assert_eq!(ctx.get_variable("qa_check_status"), Some(&json!("pass")));
    }

    #[tokio::test]
    async fn test_failed_persona_fails_step() {
        let services = services();
        let step = PersonaRequestStep::new(Arc::clone(&services));
        let mut ctx = WorkflowContext::new("wf-1", "p", "/tmp/repo", "main");

        let responder = tokio::spawn(respond_once(Arc::clone(&services), "failed"));
        let result = step.execute(&mut ctx, &step_config("tester-qa")).await;
        responder.await.unwrap();

        assert!(matches!(
            result,
            StepResult::Failure {
                error: StepError::Persona(_)
            }
        ));
        assert_eq!(ctx.get_variable("qa_check_status"), Some(&json!("fail")));
    }

    #[tokio::test]
    async fn test_tolerated_failure_keeps_outputs() {
        let services = services();
        let step = PersonaRequestStep::new(Arc::clone(&services));
        let mut ctx = WorkflowContext::new("wf-1", "p", "/tmp/repo", "main");

        let responder = tokio::spawn(respond_once(Arc::clone(&services), "fail"));
        let mut config = step_config("tester-qa");
        config.abort_on_failure = false;
        let result = step.execute(&mut ctx, &config).await;
        responder.await.unwrap();

        // The failing reply is preserved as step output instead of aborting
        let StepResult::Success { outputs } = result else {
            panic!("expected success: {result:?}");
        };
        assert_eq!(outputs["status"], "fail");
        assert_eq!(ctx.get_variable("qa_check_status"), Some(&json!("fail")));
    }

    #[tokio::test]
    async fn test_skip_personas_flag_simulates_pass() {
        let services = services();
        let step = PersonaRequestStep::new(services);
        let mut ctx = WorkflowContext::new("wf-1", "p", "/tmp/repo", "main");
        ctx.set_variable(VAR_SKIP_PERSONAS, json!(true));

        let result = step.execute(&mut ctx, &step_config("tester-qa")).await;
        let StepResult::Success { outputs } = result else {
            panic!("expected success");
        };
        assert_eq!(outputs["skipped"], true);
    }

    #[tokio::test]
    async fn test_validate_requires_persona_and_intent() {
        let services = services();
        let step = PersonaRequestStep::new(services);
        let config = StepConfig::new("bad", "persona_request").with_config(json!({"intent": "x"}));
        assert!(step.validate_config(&config).is_err());
    }
}
