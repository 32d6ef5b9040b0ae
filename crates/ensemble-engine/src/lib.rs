//! # Workflow Engine
//!
//! Executes declarative workflows against one repository checkout:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 WorkflowCoordinator                      │
//! │   (per project: open tasks -> one workflow run each)     │
//! └──────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                   WorkflowEngine                         │
//! │  (ordered steps: condition -> validate -> retry/timeout) │
//! └──────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │          StepRegistry + built-in step types              │
//! │ (persona requests, repo scan, diff apply, review loops)  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! A workflow run owns its [`WorkflowContext`] exclusively; variables and
//! step outputs are the only channels between steps, and `${…}` templates
//! are the only expression language.

pub mod context;
pub mod coordinator;
pub mod definition;
pub mod engine;
pub mod registry;
pub mod step;
pub mod steps;
pub mod template;

pub use context::WorkflowContext;
pub use coordinator::{CoordinatorConfig, CoordinatorOutcome, TaskRunResult, WorkflowCoordinator};
pub use definition::{DefinitionError, StepConfig, WorkflowDefinition};
pub use engine::{EngineServices, RunInputs, WorkflowEngine, WorkflowRunResult};
pub use registry::StepRegistry;
pub use step::{StepError, StepResult, WorkflowStep};
