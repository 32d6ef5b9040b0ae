//! TaskUpdateStep: dashboard status updates + task-log retention

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use ensemble_core::dashboard::DashboardClient;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::context::WorkflowContext;
use crate::definition::StepConfig;
use crate::engine::EngineServices;
use crate::step::{required_str, StepError, StepResult, WorkflowStep};

/// Statuses that end a task's lifecycle and trigger log cleanup
const TERMINAL_STATUSES: [&str; 4] = ["done", "closed", "cancelled", "failed"];

/// Files kept per log category after cleanup
const KEEP_NEWEST: usize = 5;

/// Log categories swept on terminal statuses: directory + filename suffix
const LOG_CATEGORIES: [(&str, &str); 2] = [("planning", "-plan.log"), ("qa", "-qa.log")];

/// Moves a task to a new dashboard status. Terminal statuses also prune the
/// task's planning/QA logs down to the five newest files per category.
///
/// Config:
///
/// ```yaml
/// config:
///   task_id: "${task_id}"   # required
///   status: done            # required
/// ```
pub struct TaskUpdateStep {
    services: Arc<EngineServices>,
}

impl TaskUpdateStep {
    pub fn new(services: Arc<EngineServices>) -> Self {
        Self { services }
    }

    /// Keep the `KEEP_NEWEST` most recently modified matching files in each
    /// log category, removing the rest.
    fn cleanup_task_logs(repo_root: &Path) {
        for (category, suffix) in LOG_CATEGORIES {
            let dir = repo_root.join(".ma").join(category);
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };

            let mut files: Vec<(std::time::SystemTime, std::path::PathBuf)> = entries
                .flatten()
                .filter_map(|entry| {
                    let path = entry.path();
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if !(name.starts_with("task-") && name.ends_with(suffix)) {
                        return None;
                    }
                    let modified = entry.metadata().ok()?.modified().ok()?;
                    Some((modified, path))
                })
                .collect();

            files.sort_by(|a, b| b.0.cmp(&a.0));
            for (_, path) in files.into_iter().skip(KEEP_NEWEST) {
                match std::fs::remove_file(&path) {
                    Ok(()) => debug!(path = %path.display(), "pruned task log"),
                    Err(e) => warn!(path = %path.display(), "failed to prune task log: {e}"),
                }
            }
        }
    }
}

#[async_trait]
impl WorkflowStep for TaskUpdateStep {
    fn validate_config(&self, config: &StepConfig) -> Result<(), StepError> {
        for key in ["task_id", "status"] {
            if config
                .config
                .get(key)
                .and_then(Value::as_str)
                .map_or(true, str::is_empty)
            {
                return Err(StepError::Config(format!(
                    "task_update step {:?} needs config key {key:?}",
                    config.name
                )));
            }
        }
        Ok(())
    }

    async fn execute(&self, ctx: &mut WorkflowContext, config: &StepConfig) -> StepResult {
        let task_id = match required_str(ctx, config, "task_id") {
            Ok(id) => id,
            Err(e) => return StepResult::failure(e),
        };
        let status = match required_str(ctx, config, "status") {
            Ok(s) => s,
            Err(e) => return StepResult::failure(e),
        };

        let Some(dashboard) = &self.services.dashboard else {
            return StepResult::failure(StepError::Contract(
                "task_update needs a dashboard client".to_string(),
            ));
        };
        if let Err(e) = dashboard.update_task_status(&task_id, &status).await {
            return StepResult::failure(StepError::Other(format!(
                "dashboard update for task {task_id} failed: {e}"
            )));
        }
        info!(task_id, status, "task status updated");

        let terminal = TERMINAL_STATUSES.contains(&status.as_str());
        if terminal {
            Self::cleanup_task_logs(&ctx.repo_root);
        }

        StepResult::success(json!({
            "task_id": task_id,
            "status": status,
            "terminal": terminal,
        }))
    }
}
