//! Workflow coordinator
//!
//! Entry point for one "coordinate this project" message: resolve the
//! project's open tasks and fan each into its own workflow run. Task-level
//! failures land in the aggregate report; they never abort the other tasks.
//! Coordinator messages are handled at most once - redelivery protection
//! lives in the duplicate tracker upstream.

use std::path::PathBuf;
use std::sync::Arc;

use ensemble_core::dashboard::{DashboardClient, DashboardError, TaskSummary};
use serde_json::json;
use tracing::{error, info, instrument, warn};

use crate::context::VAR_REPO_REMOTE;
use crate::definition::{DefinitionError, WorkflowDefinition};
use crate::engine::{RunInputs, WorkflowEngine};

/// Coordinator-level failures (task-level failures go in the results)
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Dashboard(#[from] DashboardError),

    #[error(transparent)]
    Definition(#[from] DefinitionError),
}

/// Coordinator settings
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Directory holding workflow definition files
    pub workflows_dir: PathBuf,
    /// Definition used for tasks that do not select one via label
    pub default_workflow: String,
    /// Directory under which project checkouts live
    pub project_base: PathBuf,
}

impl CoordinatorConfig {
    pub fn new(workflows_dir: impl Into<PathBuf>, project_base: impl Into<PathBuf>) -> Self {
        Self {
            workflows_dir: workflows_dir.into(),
            default_workflow: "implement-task.yaml".to_string(),
            project_base: project_base.into(),
        }
    }

    pub fn with_default_workflow(mut self, name: impl Into<String>) -> Self {
        self.default_workflow = name.into();
        self
    }
}

/// One task's outcome in the aggregate report
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskRunResult {
    pub task_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
}

/// Aggregate report for one coordinate message
#[derive(Debug, serde::Serialize)]
pub struct CoordinatorOutcome {
    pub success: bool,
    pub results: Vec<TaskRunResult>,
}

/// Per-project driver that fans open tasks into workflow runs
pub struct WorkflowCoordinator {
    engine: WorkflowEngine,
    dashboard: Arc<dyn DashboardClient>,
    config: CoordinatorConfig,
}

impl WorkflowCoordinator {
    pub fn new(
        engine: WorkflowEngine,
        dashboard: Arc<dyn DashboardClient>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            engine,
            dashboard,
            config,
        }
    }

    /// Workflow file for a task: a `workflow:<name>` label selects
    /// `<name>.yaml`, otherwise the default.
    fn workflow_file_for(&self, task: &TaskSummary) -> String {
        task.labels
            .iter()
            .find_map(|label| label.strip_prefix("workflow:"))
            .map(|name| format!("{name}.yaml"))
            .unwrap_or_else(|| self.config.default_workflow.clone())
    }

    /// Handle one coordinate-project message.
    #[instrument(skip(self))]
    pub async fn coordinate_project(
        &self,
        project_id: &str,
    ) -> Result<CoordinatorOutcome, CoordinatorError> {
        let project = self.dashboard.project_status(project_id).await?;
        let tasks = self.dashboard.open_tasks(project_id).await?;
        info!(
            project = %project.name,
            open_tasks = tasks.len(),
            "coordinating project"
        );

        let repo_root = self.config.project_base.join(project_id);
        let branch = project
            .default_branch
            .clone()
            .unwrap_or_else(|| "main".to_string());

        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            let result = self
                .run_task_workflow(&project.id, &repo_root, &branch, &project.repo_url, &task)
                .await;
            if !result.success {
                warn!(
                    task_id = %result.task_id,
                    failed_step = result.failed_step.as_deref().unwrap_or("<none>"),
                    "task workflow failed"
                );
            }
            results.push(result);
        }

        Ok(CoordinatorOutcome {
            success: results.iter().all(|r| r.success),
            results,
        })
    }

    async fn run_task_workflow(
        &self,
        project_id: &str,
        repo_root: &std::path::Path,
        branch: &str,
        repo_url: &Option<String>,
        task: &TaskSummary,
    ) -> TaskRunResult {
        // A task without a description cannot be worked on; this is the
        // contract the dashboard owes every open task.
        if task.description.trim().is_empty() {
            return TaskRunResult {
                task_id: task.id.clone(),
                success: false,
                error: Some(format!(
                    "missing required input: task {} has no description",
                    task.id
                )),
                failed_step: None,
            };
        }

        let workflow_file = self.workflow_file_for(task);
        let definition = match WorkflowDefinition::load(&self.config.workflows_dir.join(&workflow_file))
        {
            Ok(definition) => definition,
            Err(e) => {
                return TaskRunResult {
                    task_id: task.id.clone(),
                    success: false,
                    error: Some(e.to_string()),
                    failed_step: None,
                }
            }
        };

        let mut inputs = RunInputs::new(project_id, repo_root, branch)
            .with_variable("task_id", json!(task.id))
            .with_variable("task_title", json!(task.title))
            .with_variable("task_description", json!(task.description))
            .with_variable("task_priority", json!(task.priority));
        if let Some(milestone) = &task.milestone_id {
            inputs = inputs.with_variable("milestone_id", json!(milestone));
        }
        if let Some(parent) = &task.parent_task_id {
            inputs = inputs.with_variable("parent_task_id", json!(parent));
        }
        if let Some(url) = repo_url {
            inputs = inputs.with_variable(VAR_REPO_REMOTE, json!(url));
        }

        info!(task_id = %task.id, workflow = %definition.name, "starting task workflow");
        let run = self.engine.run(&definition, inputs).await;
        TaskRunResult {
            task_id: task.id.clone(),
            success: run.success,
            error: run.error,
            failed_step: run.failed_step,
        }
    }
}
