//! PmDecisionParserStep: canonicalize a PM reply

use async_trait::async_trait;
use ensemble_review::{parse_decision, RouteContext};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::context::WorkflowContext;
use crate::definition::StepConfig;
use crate::step::{optional_str, required_str, StepError, StepResult, WorkflowStep};

/// Parses the source step's output into a canonical PM decision and stores
/// it as the `pm_decision` variable.
///
/// Config:
///
/// ```yaml
/// config:
///   source_step: pm_review              # required
///   review_type: qa                     # optional
///   milestone_id: "${task_milestone}"
///   parent_task_milestone_id: "${parent_milestone}"
///   backlog_milestone_id: "${backlog_milestone}"
/// ```
pub struct PmDecisionParserStep;

impl PmDecisionParserStep {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PmDecisionParserStep {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStep for PmDecisionParserStep {
    fn validate_config(&self, config: &StepConfig) -> Result<(), StepError> {
        if config
            .config
            .get("source_step")
            .and_then(Value::as_str)
            .map_or(true, str::is_empty)
        {
            return Err(StepError::Config(format!(
                "pm_decision_parser step {:?} needs config key \"source_step\"",
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
                "pm_decision_parser source step {source_step:?} produced no output"
            )));
        };

        // Prefer the persona's inner output over our own request envelope
        let reply = source_output
            .get("output")
            .filter(|v| !v.is_null())
            .or_else(|| source_output.get("result"))
            .unwrap_or(&source_output)
            .clone();

        let route = RouteContext {
            review_type: optional_str(ctx, config, "review_type"),
            milestone_id: optional_str(ctx, config, "milestone_id"),
            parent_task_milestone_id: optional_str(ctx, config, "parent_task_milestone_id"),
            backlog_milestone_id: optional_str(ctx, config, "backlog_milestone_id"),
        };

        let decision = parse_decision(&reply, &route);
        for warning in &decision.warnings {
            warn!(step = %config.name, warning, "decision parser warning");
        }
        info!(
            step = %config.name,
            decision = ?decision.decision,
            tasks = decision.follow_up_tasks.len(),
            "PM decision parsed"
        );

        let decision_value = match serde_json::to_value(&decision) {
            Ok(value) => value,
            Err(e) => return StepResult::failure(StepError::Parse(e.to_string())),
        };
        ctx.set_variable("pm_decision", decision_value.clone());
        StepResult::success(json!({"decision": decision_value}))
    }
}
