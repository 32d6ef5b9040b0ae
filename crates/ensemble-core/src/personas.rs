//! Persona roster
//!
//! Personas are named roles consuming from the shared request stream. Their
//! implementations live outside the core; the engine only routes by name.

/// Drives project coordination messages
pub const COORDINATOR: &str = "coordinator";
/// Scans and summarizes the repository
pub const CONTEXT: &str = "context";
/// Turns tasks into implementation plans; all follow-up tasks land here
pub const IMPLEMENTATION_PLANNER: &str = "implementation-planner";
pub const FRONTEND_DEVELOPER: &str = "frontend-developer";
pub const BACKEND_DEVELOPER: &str = "backend-developer";
pub const CODE_REVIEWER: &str = "code-reviewer";
pub const SECURITY_AUDITOR: &str = "security-auditor";
pub const TESTER_QA: &str = "tester-qa";
pub const DEVOPS: &str = "devops";
pub const PROJECT_MANAGER: &str = "project-manager";
pub const SUMMARIZER: &str = "summarizer";

/// Every persona the shipped system runs, in pool start order
pub const ALL: [&str; 11] = [
    COORDINATOR,
    CONTEXT,
    IMPLEMENTATION_PLANNER,
    FRONTEND_DEVELOPER,
    BACKEND_DEVELOPER,
    CODE_REVIEWER,
    SECURITY_AUDITOR,
    TESTER_QA,
    DEVOPS,
    PROJECT_MANAGER,
    SUMMARIZER,
];

/// Case-insensitive roster membership check
pub fn is_known(name: &str) -> bool {
    ALL.iter().any(|p| p.eq_ignore_ascii_case(name))
}
