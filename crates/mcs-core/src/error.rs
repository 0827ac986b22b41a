//! Error taxonomy for the coordination server's orchestration layer.
//!
//! Kinds map onto spec §7: validation/auth/conflict/not-found errors are
//! surfaced to the caller; plan and audit LLM failures are handled locally
//! (see [`crate::planner`] and [`crate::auditor`]) and never reach this enum
//! as a propagated error.

use thiserror::Error;
use uuid::Uuid;

/// Top-level error type for `mcs-core` operations.
#[derive(Debug, Error)]
pub enum McsError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unauthorized")]
    Auth,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] anyhow::Error),
}

impl McsError {
    pub fn not_found_workflow(id: Uuid) -> Self {
        Self::NotFound(format!("workflow {id} not found"))
    }

    pub fn not_found_project(id: Uuid) -> Self {
        Self::NotFound(format!("project {id} not found"))
    }

    pub fn not_found_task(workflow_id: Uuid, step_id: &str) -> Self {
        Self::NotFound(format!("task {step_id:?} not found in workflow {workflow_id}"))
    }
}

/// Errors raised while validating a planner-produced task graph, per
/// spec §4.4 step 3.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanValidationError {
    #[error("plan must contain at least one task")]
    Empty,

    #[error("duplicate step_id: {0:?}")]
    DuplicateStepId(String),

    #[error("task {task:?} depends on unknown step_id {dependency:?}")]
    UnknownDependency { task: String, dependency: String },

    #[error("task {task:?} has unknown role {role:?}")]
    UnknownRole { task: String, role: String },

    #[error("task {task:?} declares unknown file mode {mode:?} for path {path:?}")]
    UnknownFileMode {
        task: String,
        path: String,
        mode: String,
    },

    #[error("dependency cycle detected involving tasks: {0}")]
    CycleDetected(String),
}

/// Errors raised by the [`crate::llm_gateway::LlmGateway`] trait.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("LLM output failed schema validation after {attempts} attempt(s): {last_error}")]
    SchemaFailure { attempts: u32, last_error: String },

    #[error("LLM transport error: {0}")]
    Transport(String),
}
