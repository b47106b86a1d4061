//! Query functions over the in-memory task store.
//!
//! Each function takes a `&TaskStore` the way a typical query module takes
//! a `&PgPool` — a thin, testable seam between the state machine and its
//! storage. Transitions enforce the monotone ordering `Waiting <
//! Processing < {Completed, Failed}`: an update that would move a task
//! backwards, or that targets an already-terminal task, is a silent no-op
//! rather than an error.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Task, TaskStatus};
use crate::store::TaskStore;

/// Insert a new `waiting` task. If `idempotency_key` matches an existing
/// task, that task is returned unchanged instead of creating a duplicate.
pub async fn insert_task(
    store: &TaskStore,
    name: String,
    input: serde_json::Value,
    parent_id: Option<Uuid>,
    scheduled_start_at: Option<DateTime<Utc>>,
    idempotency_key: Option<String>,
) -> Task {
    let task = Task::new(name, input, parent_id, scheduled_start_at, idempotency_key);
    store.insert(task).await
}

pub async fn get_task(store: &TaskStore, id: Uuid) -> Option<Task> {
    store.get(id).await
}

/// List tasks, optionally filtered by `name` and/or `status`.
pub async fn list_tasks(
    store: &TaskStore,
    name: Option<&str>,
    status: Option<TaskStatus>,
) -> Vec<Task> {
    store
        .list(|t| {
            name.is_none_or(|n| t.name == n) && status.is_none_or(|s| t.status == s)
        })
        .await
}

/// List a task's direct children.
pub async fn list_children(store: &TaskStore, parent_id: Uuid) -> Vec<Task> {
    store.list(|t| t.parent_id == Some(parent_id)).await
}

/// Tasks that are `waiting` and due for delivery at `now`.
pub async fn list_ready_for_delivery(store: &TaskStore, now: DateTime<Utc>) -> Vec<Task> {
    store.list(|t| t.is_due(now)).await
}

/// Tasks stuck `processing` past their deadline — candidates for the
/// worker-timeout reaper.
pub async fn list_deadline_expired(store: &TaskStore, now: DateTime<Utc>) -> Vec<Task> {
    store
        .list(|t| {
            t.status == TaskStatus::Processing
                && t.processing_deadline.map(|d| d < now).unwrap_or(false)
        })
        .await
}

/// Move a task from `waiting` to `processing`, stamping `started_at`.
/// No-op (returns `None`) if the task is not currently `waiting`.
///
/// Called when a worker's own status report first sets `status_code=1` —
/// the broker itself never makes this transition; it only increments
/// `attempts` and records `processing_deadline` at delivery time, via
/// [`record_delivery_attempt`].
pub async fn begin_processing(store: &TaskStore, id: Uuid, now: DateTime<Utc>) -> Option<Task> {
    store
        .with_task_mut(id, |t| {
            if t.status != TaskStatus::Waiting {
                return None;
            }
            t.status = TaskStatus::Processing;
            t.status_message = "processing".to_string();
            t.started_at = Some(now);
            Some(t.clone())
        })
        .await
        .flatten()
}

/// Record a delivery attempt: increments `attempts` and stamps the
/// `processing_deadline` the worker-timeout reaper will enforce. No-op if
/// the task is no longer `waiting`.
pub async fn record_delivery_attempt(
    store: &TaskStore,
    id: Uuid,
    deadline: DateTime<Utc>,
) -> Option<Task> {
    store
        .with_task_mut(id, |t| {
            if t.status != TaskStatus::Waiting {
                return None;
            }
            t.attempts += 1;
            t.processing_deadline = Some(deadline);
            Some(t.clone())
        })
        .await
        .flatten()
}

/// Reschedule a `waiting` task for a later delivery attempt after a
/// transient delivery failure, using exponential backoff. No-op if the
/// task is no longer `waiting`.
pub async fn reschedule(
    store: &TaskStore,
    id: Uuid,
    scheduled_start_at: DateTime<Utc>,
    status_message: String,
) -> Option<Task> {
    store
        .with_task_mut(id, |t| {
            if t.status != TaskStatus::Waiting {
                return None;
            }
            t.scheduled_start_at = Some(scheduled_start_at);
            t.status_message = status_message.clone();
            Some(t.clone())
        })
        .await
        .flatten()
}

/// Update progress/state on a still-`processing` task without changing
/// status. No-op if the task has already reached a terminal state.
pub async fn update_progress(
    store: &TaskStore,
    id: Uuid,
    progress: u8,
    status_message: Option<String>,
    state: Option<serde_json::Value>,
) -> Option<Task> {
    store
        .with_task_mut(id, |t| {
            if t.status.is_terminal() {
                return None;
            }
            t.progress = progress;
            if let Some(msg) = status_message {
                t.status_message = msg;
            }
            if let Some(s) = state {
                t.state = Some(s);
            }
            Some(t.clone())
        })
        .await
        .flatten()
}

/// Move a task to `completed`, stamping `ended_at` and recording `output`.
/// No-op if the task is already terminal (idempotent on duplicate
/// terminal updates).
pub async fn complete_task(
    store: &TaskStore,
    id: Uuid,
    output: serde_json::Value,
    now: DateTime<Utc>,
) -> Option<Task> {
    store
        .with_task_mut(id, |t| {
            if t.status.is_terminal() {
                return None;
            }
            t.status = TaskStatus::Completed;
            t.status_message = "completed".to_string();
            t.progress = 100;
            t.output = Some(output);
            t.ended_at = Some(now);
            Some(t.clone())
        })
        .await
        .flatten()
}

/// Move a task to `failed`, stamping `ended_at` and recording a message.
/// No-op if the task is already terminal.
pub async fn fail_task(
    store: &TaskStore,
    id: Uuid,
    status_message: String,
    now: DateTime<Utc>,
) -> Option<Task> {
    store
        .with_task_mut(id, |t| {
            if t.status.is_terminal() {
                return None;
            }
            t.status = TaskStatus::Failed;
            t.status_message = status_message.clone();
            t.ended_at = Some(now);
            Some(t.clone())
        })
        .await
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[tokio::test]
    async fn begin_processing_is_monotone() {
        let store = TaskStore::new();
        let task = insert_task(&store, "parse-document".into(), serde_json::json!({}), None, None, None).await;

        let started = begin_processing(&store, task.id, now())
            .await
            .expect("should transition");
        assert_eq!(started.status, TaskStatus::Processing);

        // Already processing: second begin_processing is a no-op.
        assert!(begin_processing(&store, task.id, now()).await.is_none());
    }

    #[tokio::test]
    async fn record_delivery_attempt_increments_and_stamps_deadline() {
        let store = TaskStore::new();
        let task = insert_task(&store, "chunk".into(), serde_json::json!({}), None, None, None).await;

        let deadline = now() + chrono::Duration::hours(1);
        let delivered = record_delivery_attempt(&store, task.id, deadline)
            .await
            .expect("should record attempt");
        assert_eq!(delivered.attempts, 1);
        assert_eq!(delivered.status, TaskStatus::Waiting);
        assert_eq!(delivered.processing_deadline, Some(deadline));
    }

    #[tokio::test]
    async fn complete_is_idempotent_on_terminal() {
        let store = TaskStore::new();
        let task = insert_task(&store, "chunk".into(), serde_json::json!({}), None, None, None).await;
        begin_processing(&store, task.id, now()).await;

        let completed = complete_task(&store, task.id, serde_json::json!({"ok": true}), now())
            .await
            .expect("should complete");
        assert_eq!(completed.status, TaskStatus::Completed);

        // Duplicate terminal update is a silent no-op, not an error.
        assert!(fail_task(&store, task.id, "late failure".into(), now()).await.is_none());
        let unchanged = get_task(&store, task.id).await.unwrap();
        assert_eq!(unchanged.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn deadline_expired_lists_processing_past_deadline() {
        let store = TaskStore::new();
        let task = insert_task(&store, "embed".into(), serde_json::json!({}), None, None, None).await;
        let past = now() - chrono::Duration::hours(2);
        record_delivery_attempt(&store, task.id, past + chrono::Duration::minutes(1)).await;
        begin_processing(&store, task.id, past).await;

        let expired = list_deadline_expired(&store, now()).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, task.id);
    }

    #[tokio::test]
    async fn list_tasks_filters_by_name_and_status() {
        let store = TaskStore::new();
        insert_task(&store, "chunk".into(), serde_json::json!({}), None, None, None).await;
        let t2 = insert_task(&store, "chunk".into(), serde_json::json!({}), None, None, None).await;
        begin_processing(&store, t2.id, now()).await;

        let waiting_chunks = list_tasks(&store, Some("chunk"), Some(TaskStatus::Waiting)).await;
        assert_eq!(waiting_chunks.len(), 1);
    }

    #[tokio::test]
    async fn reschedule_sets_backoff_and_message() {
        let store = TaskStore::new();
        let task = insert_task(&store, "embed".into(), serde_json::json!({}), None, None, None).await;
        let when = now() + chrono::Duration::seconds(30);

        let rescheduled = reschedule(&store, task.id, when, "retrying after 5xx".into())
            .await
            .expect("should reschedule");
        assert_eq!(rescheduled.status, TaskStatus::Waiting);
        assert_eq!(rescheduled.scheduled_start_at, Some(when));
        assert_eq!(rescheduled.status_message, "retrying after 5xx");
    }
}
