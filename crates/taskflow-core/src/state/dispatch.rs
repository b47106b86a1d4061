//! Convenience dispatch helpers that wrap [`super::TaskStateMachine`]
//! transitions with semantic names matching the worker status-report verbs
//! a `PUT /task/{id}` carries.

use anyhow::Result;
use uuid::Uuid;

use taskflow_db::models::Task;
use taskflow_db::store::TaskStore;

use super::TaskStateMachine;

/// A worker accepts responsibility for a task: `waiting -> processing`.
pub async fn begin_processing(
    store: &TaskStore,
    task_id: Uuid,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<Option<Task>> {
    TaskStateMachine::begin_processing(store, task_id, now).await
}

/// A worker reports success: `processing -> completed`.
pub async fn complete_task(
    store: &TaskStore,
    task_id: Uuid,
    output: serde_json::Value,
) -> Result<Option<Task>> {
    TaskStateMachine::complete(store, task_id, output).await
}

/// A worker reports failure, or retries are exhausted: `processing ->
/// failed`.
pub async fn fail_task(
    store: &TaskStore,
    task_id: Uuid,
    status_message: String,
) -> Result<Option<Task>> {
    TaskStateMachine::fail(store, task_id, status_message).await
}
