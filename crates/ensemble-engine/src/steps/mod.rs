//! Built-in step types

pub mod analysis_loop;
pub mod context_scan;
pub mod diff_apply;
pub mod persona_request;
pub mod pm_decision;
pub mod register_deps;
pub mod review_coordination;
pub mod sub_workflow;
pub mod task_update;

use std::sync::Arc;

use crate::engine::EngineServices;
use crate::registry::StepRegistry;

pub use analysis_loop::AnalysisReviewLoopStep;
pub use context_scan::ContextScanStep;
pub use diff_apply::DiffApplyStep;
pub use persona_request::PersonaRequestStep;
pub use pm_decision::PmDecisionParserStep;
pub use register_deps::RegisterBlockedDependenciesStep;
pub use review_coordination::ReviewCoordinationStep;
pub use sub_workflow::SubWorkflowStep;
pub use task_update::TaskUpdateStep;

/// Register every built-in step type under its canonical name
pub fn register_builtins(registry: &mut StepRegistry, services: Arc<EngineServices>) {
    registry.register(
        "persona_request",
        Arc::new(PersonaRequestStep::new(Arc::clone(&services))),
    );
    registry.register("context_scan", Arc::new(ContextScanStep::new()));
    registry.register(
        "diff_apply",
        Arc::new(DiffApplyStep::new(Arc::clone(&services))),
    );
    registry.register("pm_decision_parser", Arc::new(PmDecisionParserStep::new()));
    registry.register(
        "analysis_review_loop",
        Arc::new(AnalysisReviewLoopStep::new(Arc::clone(&services))),
    );
    registry.register(
        "review_coordination",
        Arc::new(ReviewCoordinationStep::new(Arc::clone(&services))),
    );
    registry.register(
        "task_update",
        Arc::new(TaskUpdateStep::new(Arc::clone(&services))),
    );
    registry.register(
        "register_blocked_dependencies",
        Arc::new(RegisterBlockedDependenciesStep::new(Arc::clone(&services))),
    );
}

/// Full registry: built-ins plus the sub-workflow step, which gets a handle
/// back to the finished registry so child workflows see every step type
/// (including `sub_workflow` itself).
pub fn build_registry(services: Arc<EngineServices>) -> Arc<StepRegistry> {
    let mut registry = StepRegistry::new();
    register_builtins(&mut registry, Arc::clone(&services));

    let sub = Arc::new(SubWorkflowStep::new(services));
    registry.register("sub_workflow", Arc::clone(&sub) as Arc<dyn crate::step::WorkflowStep>);

    let registry = Arc::new(registry);
    sub.attach_registry(&registry);
    registry
}
