//! Canonical decision record

use serde::{Deserialize, Serialize};

/// Warning emitted when the PM used the retired `backlog` field
pub const WARN_DEPRECATED_BACKLOG: &str = "PM used deprecated \"backlog\" field";
/// Warning emitted when `backlog` and `follow_up_tasks` were both populated
pub const WARN_BOTH_BACKLOG_AND_TASKS: &str =
    "PM returned both \"backlog\" and \"follow_up_tasks\"";
/// Warning emitted when an immediate-fix decision arrived without tasks
pub const WARN_IMMEDIATE_FIX_NO_TASKS: &str = "PM set immediate_fix=true but provided no tasks";
/// Warning emitted when an urgent task had no parent milestone to land in
pub const WARN_PARENT_MILESTONE_MISSING: &str = "Parent milestone not found";

/// Every follow-up task is assigned here, regardless of what the PM said
pub const FOLLOW_UP_ASSIGNEE: &str = "implementation-planner";

/// Whether the review findings warrant immediate action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    ImmediateFix,
    Defer,
}

/// Canonical priority label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    /// Map a free-form priority string: case-insensitive substring match,
    /// `medium` when nothing matches.
    pub fn from_label(raw: &str) -> Self {
        let lower = raw.to_ascii_lowercase();
        if lower.contains("critical") || lower.contains("severe") {
            Priority::Critical
        } else if lower.contains("high") || lower.contains("urgent") {
            Priority::High
        } else if lower.contains("low") || lower.contains("minor") {
            Priority::Low
        } else {
            Priority::Medium
        }
    }

    /// Urgent priorities route to the parent milestone with a high score
    pub fn is_urgent(self) -> bool {
        matches!(self, Priority::Critical | Priority::High)
    }
}

/// A task spawned from a review outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub priority: Priority,
    /// Numeric score after routing (1200 / 1000 / 50)
    pub priority_score: i64,
    #[serde(default)]
    pub milestone_id: Option<String>,
    pub assignee_persona: String,
}

/// The canonical decision record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PmDecision {
    pub decision: DecisionKind,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub detected_stage: Option<String>,
    #[serde(default)]
    pub immediate_issues: Vec<String>,
    #[serde(default)]
    pub deferred_issues: Vec<String>,
    #[serde(default)]
    pub follow_up_tasks: Vec<FollowUpTask>,
    /// Shape problems tolerated during parsing and normalization
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl PmDecision {
    /// Minimum decision for replies nothing could be extracted from
    pub fn minimum(warnings: Vec<String>) -> Self {
        Self {
            decision: DecisionKind::Defer,
            reasoning: String::new(),
            detected_stage: None,
            immediate_issues: Vec::new(),
            deferred_issues: Vec::new(),
            follow_up_tasks: Vec::new(),
            warnings,
        }
    }
}

/// Milestone and review-type context the routing rules need
#[derive(Debug, Clone, Default)]
pub struct RouteContext {
    /// e.g. `qa`, `code_review`, `security_review`
    pub review_type: Option<String>,
    /// Milestone of the task under review
    pub milestone_id: Option<String>,
    /// Milestone of the parent task, when the reviewed task is a follow-up
    pub parent_task_milestone_id: Option<String>,
    /// Catch-all milestone for non-urgent work
    pub backlog_milestone_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_substring_mapping() {
        assert_eq!(Priority::from_label("CRITICAL"), Priority::Critical);
        assert_eq!(Priority::from_label("severe defect"), Priority::Critical);
        assert_eq!(Priority::from_label("High"), Priority::High);
        assert_eq!(Priority::from_label("urgent!"), Priority::High);
        assert_eq!(Priority::from_label("low-ish"), Priority::Low);
        assert_eq!(Priority::from_label("minor nit"), Priority::Low);
        assert_eq!(Priority::from_label("P2"), Priority::Medium);
        assert_eq!(Priority::from_label(""), Priority::Medium);
    }

    #[test]
    fn test_urgency() {
        assert!(Priority::Critical.is_urgent());
        assert!(Priority::High.is_urgent());
        assert!(!Priority::Medium.is_urgent());
        assert!(!Priority::Low.is_urgent());
    }
}
