//! Engine-level error types.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the orchestration engine (validation + execution).
///
/// Definition problems (`Validation`, `DuplicateStepId`, `UnknownDependency`,
/// `CyclicDependency`) surface at registration or run start and never reach
/// step execution.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    /// Bad trigger, step, or expression definition.
    #[error("validation error: {0}")]
    Validation(String),

    /// Two or more steps share the same id.
    #[error("duplicate step id: '{0}'")]
    DuplicateStepId(String),

    /// A step depends on a step id that doesn't exist in the workflow.
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    /// Topological sort detected a cycle in the step graph.
    #[error("workflow step graph contains a cycle")]
    CyclicDependency,

    /// A run request referenced a workflow the store doesn't know.
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(Uuid),

    // ------ Execution errors ------

    /// Call rejected by an open circuit breaker; no network attempt was made.
    #[error("circuit open for integration '{0}'")]
    CircuitOpen(String),

    /// A step or run exceeded its allotted time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Every attempt against an integration failed.
    #[error("step '{step}' exhausted {attempts} attempts: {last_error}")]
    RetryExhausted {
        step: String,
        attempts: u32,
        last_error: String,
    },

    /// A notification send failed. Logged by the caller, never fatal.
    #[error("notification failed: {0}")]
    NotificationFailure(String),
}

impl EngineError {
    /// Whether this error leaves any point in further attempts.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
