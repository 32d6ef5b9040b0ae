//! Decision normalization and task routing
//!
//! Enforced invariants:
//!
//! - every follow-up task is assigned to `implementation-planner`
//! - `immediate_fix` without tasks is downgraded to `defer` with a warning
//! - urgent tasks (critical/high) score 1200 for QA work and 1000 otherwise,
//!   and route to the parent milestone; everything else scores 50 and lands
//!   in the backlog milestone
//! - security reviews without a detected stage infer one from the reasoning

use tracing::warn;

use crate::decision::{
    DecisionKind, FollowUpTask, PmDecision, Priority, RouteContext, FOLLOW_UP_ASSIGNEE,
    WARN_IMMEDIATE_FIX_NO_TASKS, WARN_PARENT_MILESTONE_MISSING,
};
use crate::parser::RawDecision;

/// Priority score for urgent QA follow-ups
pub const SCORE_URGENT_QA: i64 = 1200;
/// Priority score for other urgent follow-ups
pub const SCORE_URGENT: i64 = 1000;
/// Priority score for backlog follow-ups
pub const SCORE_BACKLOG: i64 = 50;

/// Apply the normalization rules and milestone routing to a captured
/// decision.
pub fn normalize_and_route(
    raw: RawDecision,
    mut warnings: Vec<String>,
    ctx: &RouteContext,
) -> PmDecision {
    let mut decision = raw.decision.unwrap_or(DecisionKind::ImmediateFix);

    let review_is_qa = ctx.review_type.as_deref() == Some("qa");
    let mut tasks: Vec<FollowUpTask> = Vec::with_capacity(raw.tasks.len());

    for task in raw.tasks {
        let priority = Priority::from_label(task.priority_label.as_deref().unwrap_or(""));

        let (score, milestone_id) = if priority.is_urgent() {
            let qa_task = review_is_qa || task.title.to_ascii_lowercase().contains("[qa]");
            let score = if qa_task { SCORE_URGENT_QA } else { SCORE_URGENT };
            let milestone = ctx
                .parent_task_milestone_id
                .clone()
                .or_else(|| ctx.milestone_id.clone());
            match milestone {
                Some(milestone) => (score, Some(milestone)),
                None => {
                    warnings.push(WARN_PARENT_MILESTONE_MISSING.to_string());
                    (score, ctx.backlog_milestone_id.clone())
                }
            }
        } else {
            (SCORE_BACKLOG, ctx.backlog_milestone_id.clone())
        };

        tasks.push(FollowUpTask {
            title: task.title,
            description: task.description,
            priority,
            priority_score: score,
            milestone_id,
            assignee_persona: FOLLOW_UP_ASSIGNEE.to_string(),
        });
    }

    if decision == DecisionKind::ImmediateFix && tasks.is_empty() {
        warn!("immediate_fix decision arrived without tasks, downgrading to defer");
        warnings.push(WARN_IMMEDIATE_FIX_NO_TASKS.to_string());
        decision = DecisionKind::Defer;
    }

    let detected_stage = match raw.detected_stage {
        Some(stage) => Some(stage),
        None if ctx.review_type.as_deref() == Some("security_review") => {
            Some(infer_stage(&raw.reasoning).to_string())
        }
        None => None,
    };

    PmDecision {
        decision,
        reasoning: raw.reasoning,
        detected_stage,
        immediate_issues: raw.immediate_issues,
        deferred_issues: raw.deferred_issues,
        follow_up_tasks: tasks,
        warnings,
    }
}

/// Stage inference for security reviews that omitted `detected_stage`
fn infer_stage(reasoning: &str) -> &'static str {
    let lower = reasoning.to_ascii_lowercase();
    if lower.contains("production") || lower.contains("prod ") {
        "production"
    } else if lower.contains("beta") {
        "beta"
    } else {
        "early"
    }
}
