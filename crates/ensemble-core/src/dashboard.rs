//! Dashboard client
//!
//! The task dashboard is an external collaborator; this module models only
//! the interface the engine consumes. An HTTP implementation talks JSON to
//! the dashboard service, and an in-memory implementation backs tests.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Dashboard operation failures
#[derive(Debug, thiserror::Error)]
pub enum DashboardError {
    #[error("dashboard request failed: {0}")]
    Http(String),

    #[error("dashboard returned unexpected payload: {0}")]
    Decode(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),
}

/// Project summary as the dashboard reports it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectStatus {
    pub id: String,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub default_branch: Option<String>,
}

/// One task row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub milestone_id: Option<String>,
    #[serde(default)]
    pub parent_task_id: Option<String>,
    #[serde(default)]
    pub assignee_persona: Option<String>,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Task creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub project_id: String,
    pub title: String,
    pub description: String,
    pub priority: i64,
    #[serde(default)]
    pub milestone_id: Option<String>,
    pub assignee_persona: String,
    #[serde(default)]
    pub parent_task_id: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Client interface to the external dashboard.
///
/// Implementations must be safe to share across concurrent workflows.
#[async_trait]
pub trait DashboardClient: Send + Sync {
    /// Current project summary
    async fn project_status(&self, project_id: &str) -> Result<ProjectStatus, DashboardError>;

    /// Open (non-terminal) tasks for the project, oldest first
    async fn open_tasks(&self, project_id: &str) -> Result<Vec<TaskSummary>, DashboardError>;

    /// Fetch one task
    async fn task(&self, task_id: &str) -> Result<TaskSummary, DashboardError>;

    /// Move a task to a new status
    async fn update_task_status(&self, task_id: &str, status: &str) -> Result<(), DashboardError>;

    /// Create a task, returning its ID
    async fn create_task(&self, task: NewTask) -> Result<String, DashboardError>;

    /// Replace a task's blocked-by dependency list
    async fn update_task_dependencies(
        &self,
        task_id: &str,
        blocked_by: Vec<String>,
    ) -> Result<(), DashboardError>;
}

/// HTTP implementation speaking JSON to the dashboard service
pub struct HttpDashboardClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpDashboardClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, DashboardError> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| DashboardError::Http(e.to_string()))?
            .error_for_status()
            .map_err(|e| DashboardError::Http(e.to_string()))?;
        response
            .json()
            .await
            .map_err(|e| DashboardError::Decode(e.to_string()))
    }
}

#[async_trait]
impl DashboardClient for HttpDashboardClient {
    async fn project_status(&self, project_id: &str) -> Result<ProjectStatus, DashboardError> {
        self.get_json(&format!("/api/projects/{project_id}/status"))
            .await
    }

    async fn open_tasks(&self, project_id: &str) -> Result<Vec<TaskSummary>, DashboardError> {
        self.get_json(&format!("/api/projects/{project_id}/tasks?state=open"))
            .await
    }

    async fn task(&self, task_id: &str) -> Result<TaskSummary, DashboardError> {
        self.get_json(&format!("/api/tasks/{task_id}")).await
    }

    async fn update_task_status(&self, task_id: &str, status: &str) -> Result<(), DashboardError> {
        debug!(task_id, status, "updating task status");
        self.client
            .patch(self.url(&format!("/api/tasks/{task_id}")))
            .json(&serde_json::json!({ "status": status }))
            .send()
            .await
            .map_err(|e| DashboardError::Http(e.to_string()))?
            .error_for_status()
            .map_err(|e| DashboardError::Http(e.to_string()))?;
        Ok(())
    }

    async fn create_task(&self, task: NewTask) -> Result<String, DashboardError> {
        #[derive(Deserialize)]
        struct Created {
            id: String,
        }
        let response = self
            .client
            .post(self.url("/api/tasks"))
            .json(&task)
            .send()
            .await
            .map_err(|e| DashboardError::Http(e.to_string()))?
            .error_for_status()
            .map_err(|e| DashboardError::Http(e.to_string()))?;
        let created: Created = response
            .json()
            .await
            .map_err(|e| DashboardError::Decode(e.to_string()))?;
        Ok(created.id)
    }

    async fn update_task_dependencies(
        &self,
        task_id: &str,
        blocked_by: Vec<String>,
    ) -> Result<(), DashboardError> {
        self.client
            .put(self.url(&format!("/api/tasks/{task_id}/dependencies")))
            .json(&serde_json::json!({ "blocked_by": blocked_by }))
            .send()
            .await
            .map_err(|e| DashboardError::Http(e.to_string()))?
            .error_for_status()
            .map_err(|e| DashboardError::Http(e.to_string()))?;
        Ok(())
    }
}

/// In-memory dashboard for tests and offline runs
#[derive(Default)]
pub struct MemoryDashboard {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    projects: HashMap<String, ProjectStatus>,
    tasks: HashMap<String, TaskSummary>,
    next_id: u64,
}

impl MemoryDashboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_project(&self, project: ProjectStatus) {
        self.state.lock().projects.insert(project.id.clone(), project);
    }

    pub fn insert_task(&self, task: TaskSummary) {
        self.state.lock().tasks.insert(task.id.clone(), task);
    }

    /// Snapshot of all tasks, for assertions
    pub fn tasks(&self) -> Vec<TaskSummary> {
        let mut tasks: Vec<TaskSummary> = self.state.lock().tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }
}

#[async_trait]
impl DashboardClient for MemoryDashboard {
    async fn project_status(&self, project_id: &str) -> Result<ProjectStatus, DashboardError> {
        self.state
            .lock()
            .projects
            .get(project_id)
            .cloned()
            .ok_or_else(|| DashboardError::ProjectNotFound(project_id.to_string()))
    }

    async fn open_tasks(&self, project_id: &str) -> Result<Vec<TaskSummary>, DashboardError> {
        let state = self.state.lock();
        if !state.projects.contains_key(project_id) {
            return Err(DashboardError::ProjectNotFound(project_id.to_string()));
        }
        let mut tasks: Vec<TaskSummary> = state
            .tasks
            .values()
            .filter(|t| !matches!(t.status.as_str(), "done" | "closed" | "cancelled"))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    async fn task(&self, task_id: &str) -> Result<TaskSummary, DashboardError> {
        self.state
            .lock()
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| DashboardError::TaskNotFound(task_id.to_string()))
    }

    async fn update_task_status(&self, task_id: &str, status: &str) -> Result<(), DashboardError> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| DashboardError::TaskNotFound(task_id.to_string()))?;
        task.status = status.to_string();
        Ok(())
    }

    async fn create_task(&self, task: NewTask) -> Result<String, DashboardError> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = format!("task-{}", state.next_id);
        state.tasks.insert(
            id.clone(),
            TaskSummary {
                id: id.clone(),
                title: task.title,
                description: task.description,
                status: "open".to_string(),
                priority: task.priority,
                milestone_id: task.milestone_id,
                parent_task_id: task.parent_task_id,
                assignee_persona: Some(task.assignee_persona),
                blocked_by: Vec::new(),
                labels: task.labels,
            },
        );
        Ok(id)
    }

    async fn update_task_dependencies(
        &self,
        task_id: &str,
        blocked_by: Vec<String>,
    ) -> Result<(), DashboardError> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| DashboardError::TaskNotFound(task_id.to_string()))?;
        task.blocked_by = blocked_by;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_dashboard_task_lifecycle() {
        let dash = MemoryDashboard::new();
        dash.insert_project(ProjectStatus {
            id: "p1".to_string(),
            name: "demo".to_string(),
            status: "active".to_string(),
            repo_url: None,
            default_branch: None,
        });

        let id = dash
            .create_task(NewTask {
                project_id: "p1".to_string(),
                title: "Fix flaky test".to_string(),
                description: "…".to_string(),
                priority: 1000,
                milestone_id: None,
                assignee_persona: "implementation-planner".to_string(),
                parent_task_id: None,
                labels: vec![],
            })
            .await
            .unwrap();

        assert_eq!(dash.open_tasks("p1").await.unwrap().len(), 1);

        dash.update_task_status(&id, "done").await.unwrap();
        assert!(dash.open_tasks("p1").await.unwrap().is_empty());

        dash.update_task_dependencies(&id, vec!["task-9".to_string()])
            .await
            .unwrap();
        assert_eq!(dash.task(&id).await.unwrap().blocked_by, vec!["task-9"]);
    }
}
