//! # Review decision subsystem
//!
//! Project-manager personas answer review failures in whatever shape their
//! backing model produced: a JSON object, a JSON string, markdown with a
//! fenced block, or an envelope wrapping any of those. This crate folds all
//! of them into one canonical [`PmDecision`]:
//!
//! 1. [`parser`] extracts a loose decision from the reply, tier by tier,
//!    collecting warnings instead of failing on recoverable shape issues.
//! 2. [`normalize`] enforces the record invariants (priority labels, the
//!    immediate-fix-needs-tasks rule, security stage inference) and routes
//!    every follow-up task to an urgent or backlog milestone with its
//!    numeric priority score.
//! 3. [`guard`] cross-checks QA review failures against the decision so a
//!    PM cannot silently drop a failing test run.
//!
//! A reply that yields nothing parseable still produces a minimum decision
//! (`defer`, empty lists) with warnings; the parser only represents what the
//! PM said, it never invents tasks.

pub mod decision;
pub mod guard;
pub mod normalize;
pub mod parser;
pub mod status;

pub use decision::{
    DecisionKind, FollowUpTask, PmDecision, Priority, RouteContext, WARN_BOTH_BACKLOG_AND_TASKS,
    WARN_DEPRECATED_BACKLOG, WARN_IMMEDIATE_FIX_NO_TASKS, WARN_PARENT_MILESTONE_MISSING,
};
pub use guard::{enforce_qa_followup_guard, BlockingIssue, GuardError};
pub use normalize::normalize_and_route;
pub use parser::parse_decision;
pub use status::interpret_reply_status;
