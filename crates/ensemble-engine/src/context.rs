//! Per-run workflow state
//!
//! Variables and step outputs are independent namespaces. Variables outlive
//! individual steps; step outputs are keyed by step name and are the only
//! cross-step channel. The context is owned exclusively by its workflow run
//! and dropped at completion.

use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::Value;

/// Well-known variable: suppress commit/push side effects
pub const VAR_SKIP_GIT: &str = "SKIP_GIT_OPERATIONS";
/// Well-known variable: suppress persona invocations
pub const VAR_SKIP_PERSONAS: &str = "SKIP_PERSONA_OPERATIONS";
/// Well-known variable: remote URL of the repository under work
pub const VAR_REPO_REMOTE: &str = "repo_remote";
/// Well-known variable: owning project
pub const VAR_PROJECT_ID: &str = "project_id";

/// State object threaded through one workflow run
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    pub workflow_id: String,
    pub project_id: String,
    pub repo_root: PathBuf,
    branch: String,
    variables: HashMap<String, Value>,
    step_outputs: HashMap<String, Value>,
}

impl WorkflowContext {
    pub fn new(
        workflow_id: impl Into<String>,
        project_id: impl Into<String>,
        repo_root: impl Into<PathBuf>,
        branch: impl Into<String>,
    ) -> Self {
        let project_id = project_id.into();
        let mut context = Self {
            workflow_id: workflow_id.into(),
            project_id: project_id.clone(),
            repo_root: repo_root.into(),
            branch: branch.into(),
            variables: HashMap::new(),
            step_outputs: HashMap::new(),
        };
        context.set_variable(VAR_PROJECT_ID, Value::String(project_id));
        context
    }

    pub fn get_variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    pub fn get_step_output(&self, step: &str) -> Option<&Value> {
        self.step_outputs.get(step)
    }

    pub fn set_step_output(&mut self, step: impl Into<String>, output: Value) {
        self.step_outputs.insert(step.into(), output);
    }

    pub fn all_step_outputs(&self) -> &HashMap<String, Value> {
        &self.step_outputs
    }

    /// Branch the run is working on; steps may override it
    pub fn current_branch(&self) -> &str {
        if self.branch.is_empty() {
            "main"
        } else {
            &self.branch
        }
    }

    pub fn set_branch(&mut self, branch: impl Into<String>) {
        self.branch = branch.into();
    }

    /// Truthiness of a flag variable (`true`, `"true"`, `1`, `"1"`)
    pub fn flag(&self, name: &str) -> bool {
        match self.variables.get(name) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.as_str(), "true" | "1" | "yes"),
            Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_namespaces_are_independent() {
        let mut ctx = WorkflowContext::new("wf", "p", "/tmp/repo", "main");
        ctx.set_variable("scan", json!("variable"));
        ctx.set_step_output("scan", json!({"files": 3}));

        assert_eq!(ctx.get_variable("scan"), Some(&json!("variable")));
        assert_eq!(ctx.get_step_output("scan"), Some(&json!({"files": 3})));
    }

    #[test]
    fn test_branch_override() {
        let mut ctx = WorkflowContext::new("wf", "p", "/tmp/repo", "main");
        assert_eq!(ctx.current_branch(), "main");
        ctx.set_branch("feature/retry");
        assert_eq!(ctx.current_branch(), "feature/retry");
    }

    #[test]
    fn test_flags() {
        let mut ctx = WorkflowContext::new("wf", "p", "/tmp/repo", "main");
        assert!(!ctx.flag(VAR_SKIP_GIT));
        ctx.set_variable(VAR_SKIP_GIT, json!("true"));
        assert!(ctx.flag(VAR_SKIP_GIT));
        ctx.set_variable(VAR_SKIP_GIT, json!(false));
        assert!(!ctx.flag(VAR_SKIP_GIT));
        ctx.set_variable(VAR_SKIP_GIT, json!(1));
        assert!(ctx.flag(VAR_SKIP_GIT));
    }

    #[test]
    fn test_project_id_seeded_as_variable() {
        let ctx = WorkflowContext::new("wf", "proj-7", "/tmp/repo", "main");
        assert_eq!(ctx.get_variable(VAR_PROJECT_ID), Some(&json!("proj-7")));
    }
}
