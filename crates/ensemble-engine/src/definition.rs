//! Workflow definitions
//!
//! A workflow is a named, versioned, ordered sequence of step configs,
//! loaded from a YAML or JSON file. Execution order is declaration order.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_true() -> bool {
    true
}

/// One step's declaration inside a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    pub name: String,

    /// Registered step type name
    #[serde(rename = "type")]
    pub step_type: String,

    /// Gate expression; the step is skipped when it evaluates false
    #[serde(default)]
    pub condition: Option<String>,

    /// Step-type specific parameters
    #[serde(default)]
    pub config: Value,

    /// Retries of the whole step body (exponential backoff, 1 s base, 5 s cap)
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Abort the step after this many milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// On success, copy `outputs[source]` into the variable `alias`
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,

    /// When false, a failure is recorded but the workflow continues
    #[serde(default = "default_true")]
    pub abort_on_failure: bool,
}

impl StepConfig {
    /// Minimal config for tests and programmatic workflows
    pub fn new(name: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            step_type: step_type.into(),
            condition: None,
            config: Value::Null,
            max_retries: None,
            timeout_ms: None,
            outputs: BTreeMap::new(),
            abort_on_failure: true,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// A declared, named, versioned workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub steps: Vec<StepConfig>,
}

fn default_version() -> String {
    "1".to_string()
}

/// Definition load failures
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("failed to read workflow definition {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse workflow definition {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("workflow definition {path} is invalid: {message}")]
    Invalid { path: PathBuf, message: String },
}

impl WorkflowDefinition {
    /// Load a definition from a YAML or JSON file (sniffed by extension) and
    /// validate its basic shape.
    pub fn load(path: &Path) -> Result<Self, DefinitionError> {
        let raw = std::fs::read_to_string(path).map_err(|source| DefinitionError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let definition: WorkflowDefinition =
            if path.extension().is_some_and(|e| e == "json") {
                serde_json::from_str(&raw).map_err(|e| DefinitionError::Parse {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })?
            } else {
                serde_yaml::from_str(&raw).map_err(|e| DefinitionError::Parse {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })?
            };
        definition.validate(path)?;
        Ok(definition)
    }

    fn validate(&self, path: &Path) -> Result<(), DefinitionError> {
        if self.steps.is_empty() {
            return Err(DefinitionError::Invalid {
                path: path.to_path_buf(),
                message: "workflow has no steps".to_string(),
            });
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if step.name.trim().is_empty() {
                return Err(DefinitionError::Invalid {
                    path: path.to_path_buf(),
                    message: "step with empty name".to_string(),
                });
            }
            if !seen.insert(step.name.as_str()) {
                return Err(DefinitionError::Invalid {
                    path: path.to_path_buf(),
                    message: format!("duplicate step name {:?}", step.name),
                });
            }
        }
        Ok(())
    }
}
