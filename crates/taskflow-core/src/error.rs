//! Named error kinds, distinct from the stringly-typed `anyhow::Error`
//! chains used for "this should never happen" failures. The HTTP layer
//! matches on these to pick a status code; everything else propagates as
//! `anyhow::Error` with context.

use uuid::Uuid;

/// One of the error kinds a caller-facing operation can fail with.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskflowError {
    /// Malformed request: missing `name`, non-object `input`, unknown step.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Caller attempted a non-monotone status update.
    #[error("invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: Uuid,
        from: String,
        to: String,
    },

    /// No task with this id exists.
    #[error("task {0} not found")]
    NotFound(Uuid),

    /// A worker's terminal update arrived for a task that had already
    /// reached a (different) terminal state; discarded, not surfaced.
    #[error("terminal mismatch for task {0}: already terminal")]
    TerminalMismatch(Uuid),

    /// Delivery to a worker timed out, hit 5xx/429, or a network error.
    #[error("delivery transport error for task {task_id}: {detail}")]
    DeliveryTransport { task_id: Uuid, detail: String },

    /// A worker reported `status_code=3`.
    #[error("worker reported failure for task {task_id}: {detail}")]
    WorkerFailure { task_id: Uuid, detail: String },

    /// A step exceeded its wall-clock timeout.
    #[error("step timed out for task {0}")]
    StepTimeout(Uuid),

    /// The root task was externally failed mid-pipeline.
    #[error("root task {0} was cancelled")]
    Cancelled(Uuid),

    /// A `processing` task's worker never reported back before the
    /// processing deadline; reaped by the broker.
    #[error("worker silent timeout for task {0}")]
    WorkerSilentTimeout(Uuid),
}

impl TaskflowError {
    /// The kind name used in log fields and HTTP error bodies, distinct
    /// from the full `Display` message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::InvalidTransition { .. } => "invalid-transition",
            Self::NotFound(_) => "not-found",
            Self::TerminalMismatch(_) => "terminal-mismatch",
            Self::DeliveryTransport { .. } => "delivery-transport",
            Self::WorkerFailure { .. } => "worker-failure",
            Self::StepTimeout(_) => "step-timeout",
            Self::Cancelled(_) => "cancelled",
            Self::WorkerSilentTimeout(_) => "worker-silent-timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_are_stable() {
        let id = Uuid::nil();
        assert_eq!(TaskflowError::NotFound(id).kind(), "not-found");
        assert_eq!(
            TaskflowError::TerminalMismatch(id).kind(),
            "terminal-mismatch"
        );
    }
}
