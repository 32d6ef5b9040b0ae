//! QA follow-up guard
//!
//! When a QA review fails because tests could not run or did not pass, the
//! PM's follow-up tasks must actually address that. Otherwise the
//! coordination step fails loudly instead of quietly shipping a decision
//! that drops the test failure on the floor.

use crate::decision::FollowUpTask;

/// A blocking issue from a failed review
#[derive(Debug, Clone)]
pub struct BlockingIssue {
    pub title: String,
    pub description: String,
}

impl BlockingIssue {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
        }
    }

    fn text(&self) -> String {
        format!("{} {}", self.title, self.description).to_ascii_lowercase()
    }
}

/// Guard violations
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("PM decision ignored QA test failure: blocking issue {issue:?} has no test-related follow-up task")]
    MissingTestFollowUp { issue: String },

    #[error("PM decision ignored QA test failure: infrastructure issue {issue:?} has no infra-related follow-up task")]
    MissingInfraFollowUp { issue: String },
}

/// Words marking an issue or follow-up as test-related
const TEST_KEYWORDS: [&str; 6] = ["test", "tests", "testing", "spec", "coverage", "assertion"];

/// Phrases marking a blocking issue as test-infrastructure breakage
const INFRA_FLAGS: [&str; 6] = [
    "test framework missing",
    "harness missing",
    "unable to run tests",
    "cannot run tests",
    "no test runner",
    "missing test dependency",
];

/// Words a follow-up must carry to count as addressing infrastructure
const INFRA_KEYWORDS: [&str; 7] = [
    "framework",
    "harness",
    "runner",
    "install",
    "setup",
    "configure",
    "infrastructure",
];

fn task_text(task: &FollowUpTask) -> String {
    format!("{} {}", task.title, task.description).to_ascii_lowercase()
}

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| text.contains(k))
}

/// Enforce the QA follow-up guard over a `qa` review's blocking issues.
///
/// The two rules are independent and an issue can trip both:
///
/// - a test-related blocking issue requires at least one test-related
///   follow-up task
/// - an infra-flagged blocking issue (framework or harness breakage)
///   requires an infra-related follow-up task; its phrasing is usually
///   test-related too, so such issues also need the test rule satisfied
pub fn enforce_qa_followup_guard(
    blocking_issues: &[BlockingIssue],
    follow_up_tasks: &[FollowUpTask],
) -> Result<(), GuardError> {
    let any_test_followup = follow_up_tasks
        .iter()
        .any(|t| contains_any(&task_text(t), &TEST_KEYWORDS));
    let any_infra_followup = follow_up_tasks
        .iter()
        .any(|t| contains_any(&task_text(t), &INFRA_KEYWORDS));

    for issue in blocking_issues {
        let text = issue.text();
        if contains_any(&text, &INFRA_FLAGS) && !any_infra_followup {
            return Err(GuardError::MissingInfraFollowUp {
                issue: issue.title.clone(),
            });
        }
        if contains_any(&text, &TEST_KEYWORDS) && !any_test_followup {
            return Err(GuardError::MissingTestFollowUp {
                issue: issue.title.clone(),
            });
        }
    }
    Ok(())
}
