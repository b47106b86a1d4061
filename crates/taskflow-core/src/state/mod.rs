//! Task state machine transitions.
//!
//! Validates and executes state transitions for tasks, enforcing the
//! allowed transition graph, monotonicity, and timestamp management. The
//! actual compare-and-swap lives in [`taskflow_db::queries::tasks`], keyed
//! per-task by the store's internal mutex; this layer adds the
//! existence/shape checks a caller needs to tell "task not found" apart
//! from "transition rejected".

pub mod dispatch;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use taskflow_db::models::{Task, TaskStatus};
use taskflow_db::queries::tasks as db;
use taskflow_db::store::TaskStore;

/// The task state machine.
///
/// Enforces the valid transition graph, each task moving through
/// `0→1→{2,3}` exactly once:
///
/// ```text
/// waiting    -> processing
/// processing -> completed
/// processing -> failed
/// ```
///
/// `completed` and `failed` are terminal: further transition attempts
/// against a terminal task are silent no-ops, not errors, so that a
/// worker's retried status report can't fail a task twice.
pub struct TaskStateMachine;

impl TaskStateMachine {
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        matches!(
            (from, to),
            (TaskStatus::Waiting, TaskStatus::Processing)
                | (TaskStatus::Processing, TaskStatus::Completed)
                | (TaskStatus::Processing, TaskStatus::Failed)
        )
    }

    /// Transition `waiting -> processing`, stamping `started_at`. This is
    /// the transition a worker's own status report makes; the broker's
    /// delivery loop never calls this (it only records the attempt, see
    /// [`taskflow_db::queries::tasks::record_delivery_attempt`]).
    ///
    /// Returns an error if the task does not exist. Returns `Ok(None)` if
    /// the task exists but is no longer `waiting` (already claimed, or
    /// already terminal).
    pub async fn begin_processing(
        store: &TaskStore,
        task_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        require_exists(store, task_id).await?;
        Ok(db::begin_processing(store, task_id, now).await)
    }

    /// Transition `processing -> completed`. No-op if already terminal.
    pub async fn complete(
        store: &TaskStore,
        task_id: Uuid,
        output: serde_json::Value,
    ) -> Result<Option<Task>> {
        require_exists(store, task_id).await?;
        Ok(db::complete_task(store, task_id, output, Utc::now()).await)
    }

    /// Transition `processing -> failed`. No-op if already terminal.
    pub async fn fail(
        store: &TaskStore,
        task_id: Uuid,
        status_message: String,
    ) -> Result<Option<Task>> {
        require_exists(store, task_id).await?;
        Ok(db::fail_task(store, task_id, status_message, Utc::now()).await)
    }
}

async fn require_exists(store: &TaskStore, task_id: Uuid) -> Result<Task> {
    db::get_task(store, task_id)
        .await
        .with_context(|| format!("task {task_id} not found"))
}
