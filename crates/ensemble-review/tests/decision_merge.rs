//! End-to-end decision parsing: backlog merge, routing, and the guard

use ensemble_review::{
    enforce_qa_followup_guard, parse_decision, BlockingIssue, DecisionKind, RouteContext,
    WARN_BOTH_BACKLOG_AND_TASKS, WARN_DEPRECATED_BACKLOG,
};
use serde_json::json;

#[test]
fn backlog_and_follow_up_tasks_merge_with_routing() {
    let reply = json!({
        "decision": "immediate_fix",
        "reasoning": "QA surfaced a timeout and a vulnerable dependency",
        "follow_up_tasks": [
            {"title": "🚨 [QA] Fix test timeout", "priority": "critical"},
            {"title": "🚨 [Security] Update dependency", "priority": "high"}
        ],
        "backlog": [
            {"title": "📋 [Code] Refactor error handling", "priority": "medium"}
        ]
    });
    let ctx = RouteContext {
        review_type: Some("code_review".to_string()),
        milestone_id: Some("m-123".to_string()),
        parent_task_milestone_id: None,
        backlog_milestone_id: Some("m-backlog".to_string()),
    };

    let decision = parse_decision(&reply, &ctx);

    assert_eq!(decision.decision, DecisionKind::ImmediateFix);
    assert_eq!(decision.follow_up_tasks.len(), 3);

    let qa = &decision.follow_up_tasks[0];
    assert_eq!(qa.title, "🚨 [QA] Fix test timeout");
    assert_eq!(qa.priority_score, 1200);
    assert_eq!(qa.milestone_id.as_deref(), Some("m-123"));

    let security = &decision.follow_up_tasks[1];
    assert_eq!(security.priority_score, 1000);
    assert_eq!(security.milestone_id.as_deref(), Some("m-123"));

    let refactor = &decision.follow_up_tasks[2];
    assert_eq!(refactor.priority_score, 50);
    assert_eq!(refactor.milestone_id.as_deref(), Some("m-backlog"));

    for task in &decision.follow_up_tasks {
        assert_eq!(task.assignee_persona, "implementation-planner");
    }

    assert!(decision
        .warnings
        .contains(&WARN_DEPRECATED_BACKLOG.to_string()));
    assert!(decision
        .warnings
        .contains(&WARN_BOTH_BACKLOG_AND_TASKS.to_string()));
}

#[test]
fn qa_guard_rejects_decision_that_ignores_test_failure() {
    let reply = json!({
        "decision": "immediate_fix",
        "follow_up_tasks": [{"title": "Refactor validation", "priority": "high"}]
    });
    let ctx = RouteContext {
        review_type: Some("qa".to_string()),
        milestone_id: Some("m-1".to_string()),
        parent_task_milestone_id: None,
        backlog_milestone_id: Some("m-backlog".to_string()),
    };
    let decision = parse_decision(&reply, &ctx);

    let blocking = [BlockingIssue::new(
        "Tests cannot run",
        "Unable to run tests: test framework missing",
    )];
    let err = enforce_qa_followup_guard(&blocking, &decision.follow_up_tasks).unwrap_err();
    assert!(err
        .to_string()
        .contains("PM decision ignored QA test failure"));
}
