//! RegisterBlockedDependenciesStep: maintain a task's blocked-by list

use std::sync::Arc;

use async_trait::async_trait;
use ensemble_core::dashboard::DashboardClient;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::context::WorkflowContext;
use crate::definition::StepConfig;
use crate::engine::EngineServices;
use crate::step::{optional_bool, required_str, StepError, StepResult, WorkflowStep};
use crate::template;

/// Normalizes dependency IDs (dedup, self-reference removed), merges them
/// with the task's existing blocked-by list, and pushes the result to the
/// dashboard. An empty merged list is only written when `allow_clear` is
/// set; otherwise the step leaves the dashboard untouched.
///
/// Config:
///
/// ```yaml
/// config:
///   task_id: "${task_id}"               # required
///   dependencies: "${plan.blocked_by}"  # array, templated
///   allow_clear: false
/// ```
pub struct RegisterBlockedDependenciesStep {
    services: Arc<EngineServices>,
}

impl RegisterBlockedDependenciesStep {
    pub fn new(services: Arc<EngineServices>) -> Self {
        Self { services }
    }

    /// Dedup preserving order, dropping blanks and the task's own ID
    fn normalize(task_id: &str, raw: &Value) -> Vec<String> {
        let items: Vec<String> = match raw {
            Value::Array(items) => items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    Value::Object(map) => {
                        map.get("id").and_then(Value::as_str).map(String::from)
                    }
                    _ => None,
                })
                .collect(),
            Value::String(s) => s
                .split(',')
                .map(|part| part.trim().to_string())
                .collect(),
            _ => Vec::new(),
        };

        let mut seen = std::collections::HashSet::new();
        items
            .into_iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty() && id != task_id && seen.insert(id.clone()))
            .collect()
    }
}

#[async_trait]
impl WorkflowStep for RegisterBlockedDependenciesStep {
    fn validate_config(&self, config: &StepConfig) -> Result<(), StepError> {
        if config
            .config
            .get("task_id")
            .and_then(Value::as_str)
            .map_or(true, str::is_empty)
        {
            return Err(StepError::Config(format!(
                "register_blocked_dependencies step {:?} needs config key \"task_id\"",
                config.name
            )));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &mut WorkflowContext, config: &StepConfig) -> StepResult {
        let task_id = match required_str(ctx, config, "task_id") {
            Ok(id) => id,
            Err(e) => return StepResult::failure(e),
        };
        let Some(dashboard) = &self.services.dashboard else {
            return StepResult::failure(StepError::Contract(
                "register_blocked_dependencies needs a dashboard client".to_string(),
            ));
        };

        let declared = config
            .config
            .get("dependencies")
            .map(|raw| template::resolve_json(ctx, raw))
            .unwrap_or(Value::Null);
        let normalized = Self::normalize(&task_id, &declared);

        let existing = match dashboard.task(&task_id).await {
            Ok(task) => task.blocked_by,
            Err(e) => {
                return StepResult::failure(StepError::Other(format!(
                    "failed to load task {task_id}: {e}"
                )))
            }
        };

        // Merge: existing order first, then new IDs
        let mut merged = existing.clone();
        for id in &normalized {
            if !merged.contains(id) {
                merged.push(id.clone());
            }
        }

        let allow_clear = optional_bool(ctx, config, "allow_clear").unwrap_or(false);
        if merged.is_empty() && !allow_clear {
            debug!(task_id, "no dependencies to register and clearing not allowed");
            return StepResult::success(json!({
                "task_id": task_id,
                "blocked_by": existing,
                "updated": false,
            }));
        }

        if let Err(e) = dashboard
            .update_task_dependencies(&task_id, merged.clone())
            .await
        {
            return StepResult::failure(StepError::Other(format!(
                "failed to update dependencies of task {task_id}: {e}"
            )));
        }
        info!(task_id, count = merged.len(), "blocked dependencies registered");

        StepResult::success(json!({
            "task_id": task_id,
            "blocked_by": merged,
            "updated": true,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_core::dashboard::{MemoryDashboard, ProjectStatus, TaskSummary};
    use ensemble_transport::MemoryTransport;

    fn setup(blocked_by: Vec<String>) -> (Arc<EngineServices>, Arc<MemoryDashboard>) {
        let dashboard = Arc::new(MemoryDashboard::new());
        dashboard.insert_project(ProjectStatus {
            id: "p".to_string(),
            name: "demo".to_string(),
            status: "active".to_string(),
            repo_url: None,
            default_branch: None,
        });
        dashboard.insert_task(TaskSummary {
            id: "t-1".to_string(),
            title: "task".to_string(),
            description: String::new(),
            status: "open".to_string(),
            priority: 100,
            milestone_id: None,
            parent_task_id: None,
            assignee_persona: None,
            blocked_by,
            labels: vec![],
        });
        let services = Arc::new(
            EngineServices::new(Arc::new(MemoryTransport::new()))
                .with_dashboard(Arc::clone(&dashboard) as Arc<dyn ensemble_core::DashboardClient>),
        );
        (services, dashboard)
    }

    fn config(deps: Value) -> StepConfig {
        StepConfig::new("register", "register_blocked_dependencies")
            .with_config(json!({"task_id": "t-1", "dependencies": deps}))
    }

    #[tokio::test]
    async fn test_normalize_dedups_and_drops_self() {
        let normalized = RegisterBlockedDependenciesStep::normalize(
            "t-1",
            &json!(["t-2", "t-3", "t-2", "t-1", "", " t-4 "]),
        );
        assert_eq!(normalized, vec!["t-2", "t-3", "t-4"]);
    }

    #[tokio::test]
    async fn test_merges_with_existing() {
        let (services, dashboard) = setup(vec!["t-9".to_string()]);
        let step = RegisterBlockedDependenciesStep::new(services);
        let mut ctx = WorkflowContext::new("wf", "p", "/tmp/repo", "main");

        let StepResult::Success { outputs } = step
            .execute(&mut ctx, &config(json!(["t-2", "t-9"])))
            .await
        else {
            panic!("expected success");
        };
        assert_eq!(outputs["updated"], true);
        assert_eq!(
            dashboard.task("t-1").await.unwrap().blocked_by,
            vec!["t-9", "t-2"]
        );
    }

    #[tokio::test]
    async fn test_empty_list_not_cleared_by_default() {
        let (services, dashboard) = setup(vec![]);
        let step = RegisterBlockedDependenciesStep::new(services);
        let mut ctx = WorkflowContext::new("wf", "p", "/tmp/repo", "main");

        let StepResult::Success { outputs } =
            step.execute(&mut ctx, &config(json!([]))).await
        else {
            panic!("expected success");
        };
        assert_eq!(outputs["updated"], false);
        assert!(dashboard.task("t-1").await.unwrap().blocked_by.is_empty());
    }

    #[tokio::test]
    async fn test_allow_clear_writes_empty_list() {
        let (services, dashboard) = setup(vec![]);
        let step = RegisterBlockedDependenciesStep::new(services);
        let mut ctx = WorkflowContext::new("wf", "p", "/tmp/repo", "main");

        let config = StepConfig::new("register", "register_blocked_dependencies").with_config(
            json!({"task_id": "t-1", "dependencies": [], "allow_clear": true}),
        );
        let StepResult::Success { outputs } = step.execute(&mut ctx, &config).await else {
            panic!("expected success");
        };
        assert_eq!(outputs["updated"], true);
        assert!(dashboard.task("t-1").await.unwrap().blocked_by.is_empty());
    }
}
