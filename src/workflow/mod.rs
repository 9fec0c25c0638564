//! Workflow orchestration: data model, persistent store, and the
//! execution engine.

pub mod engine;
pub mod model;
pub mod prompt;
pub mod store;


pub use engine::{
    EngineConfig, SessionSpawner, SessionStatus, SpawnHandle, SpawnRequest, WorkflowEngine,
    MAX_POLL_INTERVAL_MS, MIN_POLL_INTERVAL_MS, POLL_BACKOFF_FACTOR, TICK_INTERVAL_MS,
};
pub use model::{
    CreateWorkflowInput, PrPolicies, PrPoliciesPatch, RequiredCredential, SessionPolicies,
    SessionPoliciesPatch, StepInput, StepPatch, StepStatus, Workflow, WorkflowEvent,
    WorkflowEventKind, WorkflowPatch, WorkflowPolicies, WorkflowPoliciesPatch, WorkflowStatus,
    WorkflowStep, WorkflowStoreDoc, MAX_EVENTS_PER_WORKFLOW,
};
pub use prompt::{build_step_prompt, build_system_prompt, render_pr_body};
pub use store::WorkflowStore;
