//! Step type registry

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::step::WorkflowStep;

/// Name -> step singleton map, populated at startup
#[derive(Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn WorkflowStep>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step type under its name. Later registrations replace
    /// earlier ones, which lets deployments override a built-in.
    pub fn register(&mut self, step_type: impl Into<String>, step: Arc<dyn WorkflowStep>) {
        let step_type = step_type.into();
        info!(step_type, "registered workflow step type");
        self.steps.insert(step_type, step);
    }

    pub fn get(&self, step_type: &str) -> Option<Arc<dyn WorkflowStep>> {
        self.steps.get(step_type).cloned()
    }

    pub fn known_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.steps.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
