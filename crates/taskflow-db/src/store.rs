//! In-memory, per-key-locked persistence for tasks and consumers.
//!
//! The shared mutable task store could equally be an RDBMS with row-level
//! locking; this crate implements the in-memory equivalent instead: each
//! task and each consumer is wrapped in its own `Mutex`, so concurrent
//! delivery workers mutating *different* tasks never contend, while writers
//! racing to mutate the *same* task serialize through that task's lock — the
//! same guarantee a `SELECT ... FOR UPDATE` row lock would give.
//!
//! The outer map is a `RwLock` guarding structural changes (insertion,
//! removal); the per-row `Mutex` guards in-place mutation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::models::{Consumer, Task};

/// Shared store for `Task` rows.
#[derive(Default)]
pub struct TaskStore {
    tasks: RwLock<HashMap<Uuid, Arc<Mutex<Task>>>>,
    idempotency_index: RwLock<HashMap<String, Uuid>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new task. If `task.idempotency_key` matches a key already
    /// on file, the existing task is returned unchanged instead.
    pub async fn insert(&self, task: Task) -> Task {
        if let Some(key) = &task.idempotency_key {
            let index = self.idempotency_index.read().await;
            if let Some(existing_id) = index.get(key) {
                let tasks = self.tasks.read().await;
                if let Some(existing) = tasks.get(existing_id) {
                    return existing.lock().await.clone();
                }
            }
        }

        let id = task.id;
        let key = task.idempotency_key.clone();
        self.tasks
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(task.clone())));
        if let Some(key) = key {
            self.idempotency_index.write().await.insert(key, id);
        }
        task
    }

    /// Fetch a clone of a task by id.
    pub async fn get(&self, id: Uuid) -> Option<Task> {
        let arc = self.tasks.read().await.get(&id)?.clone();
        Some(arc.lock().await.clone())
    }

    /// Run `f` under the per-task lock, mutating the task in place.
    /// Returns `None` if the task does not exist.
    pub async fn with_task_mut<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Task) -> R,
    ) -> Option<R> {
        let arc = self.tasks.read().await.get(&id)?.clone();
        let mut guard = arc.lock().await;
        Some(f(&mut guard))
    }

    /// Snapshot every task matching `predicate`.
    pub async fn list(&self, predicate: impl Fn(&Task) -> bool) -> Vec<Task> {
        let arcs: Vec<_> = self.tasks.read().await.values().cloned().collect();
        let mut out = Vec::new();
        for arc in arcs {
            let task = arc.lock().await;
            if predicate(&task) {
                out.push(task.clone());
            }
        }
        out
    }

    /// Total number of tasks on file (used by tests and diagnostics).
    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }
}

/// Shared store for `Consumer` rows, keyed by `(topic, endpoint_url)`.
#[derive(Default)]
pub struct ConsumerStore {
    consumers: RwLock<HashMap<(String, String), Arc<Mutex<Consumer>>>>,
    /// Per-topic round-robin cursor, so the broker cycles through every
    /// ready consumer registered for the same topic instead of favoring one.
    round_robin: RwLock<HashMap<String, Arc<AtomicUsize>>>,
}

impl ConsumerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a consumer row, keyed by `(topic, endpoint_url)`.
    pub async fn upsert(&self, consumer: Consumer) {
        let key = (consumer.topic.clone(), consumer.endpoint_url.clone());
        let mut map = self.consumers.write().await;
        match map.get(&key) {
            Some(existing) => {
                *existing.lock().await = consumer;
            }
            None => {
                map.insert(key, Arc::new(Mutex::new(consumer)));
            }
        }
    }

    /// Remove a consumer row. Returns `true` if a row was removed.
    pub async fn remove(&self, topic: &str, endpoint_url: &str) -> bool {
        self.consumers
            .write()
            .await
            .remove(&(topic.to_string(), endpoint_url.to_string()))
            .is_some()
    }

    pub async fn get(&self, topic: &str, endpoint_url: &str) -> Option<Consumer> {
        let arc = self
            .consumers
            .read()
            .await
            .get(&(topic.to_string(), endpoint_url.to_string()))?
            .clone();
        Some(arc.lock().await.clone())
    }

    pub async fn list(&self) -> Vec<Consumer> {
        let arcs: Vec<_> = self.consumers.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(arcs.len());
        for arc in arcs {
            out.push(arc.lock().await.clone());
        }
        out
    }

    /// Mutate a specific consumer row (e.g. from the health-probe loop).
    pub async fn with_consumer_mut<R>(
        &self,
        topic: &str,
        endpoint_url: &str,
        f: impl FnOnce(&mut Consumer) -> R,
    ) -> Option<R> {
        let arc = self
            .consumers
            .read()
            .await
            .get(&(topic.to_string(), endpoint_url.to_string()))?
            .clone();
        let mut guard = arc.lock().await;
        Some(f(&mut guard))
    }

    /// Pick the next ready consumer for `topic`, round-robin across all
    /// ready registrations.
    pub async fn pick_ready(&self, topic: &str) -> Option<Consumer> {
        let all = self.list().await;
        let mut candidates: Vec<Consumer> = all
            .into_iter()
            .filter(|c| c.topic == topic && c.ready)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by(|a, b| a.endpoint_url.cmp(&b.endpoint_url));

        let cursor = {
            let mut rr = self.round_robin.write().await;
            rr.entry(topic.to_string())
                .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
                .clone()
        };
        let index = cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates.swap_remove(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskStatus;

    fn sample_task(name: &str) -> Task {
        Task::new(name.to_string(), serde_json::json!({}), None, None, None)
    }

    #[tokio::test]
    async fn insert_and_get_roundtrip() {
        let store = TaskStore::new();
        let task = sample_task("parse-document");
        let id = task.id;
        store.insert(task).await;
        let fetched = store.get(id).await.expect("task should exist");
        assert_eq!(fetched.name, "parse-document");
        assert_eq!(fetched.status, TaskStatus::Waiting);
    }

    #[tokio::test]
    async fn idempotency_key_returns_existing_task() {
        let store = TaskStore::new();
        let first = Task::new(
            "index-document".to_string(),
            serde_json::json!({"a": 1}),
            None,
            None,
            Some("upload-42".to_string()),
        );
        let first_id = first.id;
        store.insert(first).await;

        let second = Task::new(
            "index-document".to_string(),
            serde_json::json!({"a": 2}),
            None,
            None,
            Some("upload-42".to_string()),
        );
        let result = store.insert(second).await;

        assert_eq!(result.id, first_id);
        assert_eq!(result.input, serde_json::json!({"a": 1}));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn with_task_mut_mutates_in_place() {
        let store = TaskStore::new();
        let task = sample_task("chunk");
        let id = task.id;
        store.insert(task).await;

        store
            .with_task_mut(id, |t| {
                t.status = TaskStatus::Processing;
                t.progress = 50;
            })
            .await
            .expect("task should exist");

        let fetched = store.get(id).await.unwrap();
        assert_eq!(fetched.status, TaskStatus::Processing);
        assert_eq!(fetched.progress, 50);
    }

    #[tokio::test]
    async fn list_filters_by_predicate() {
        let store = TaskStore::new();
        store.insert(sample_task("parse-document")).await;
        store.insert(sample_task("chunk")).await;
        store.insert(sample_task("chunk")).await;

        let chunks = store.list(|t| t.name == "chunk").await;
        assert_eq!(chunks.len(), 2);
    }

    #[tokio::test]
    async fn consumer_round_robin_cycles_through_ready() {
        let store = ConsumerStore::new();
        store
            .upsert(Consumer::new(
                "chunk".to_string(),
                "http://a/chunk".to_string(),
                None,
            ))
            .await;
        store
            .upsert(Consumer::new(
                "chunk".to_string(),
                "http://b/chunk".to_string(),
                None,
            ))
            .await;

        let mut seen = Vec::new();
        for _ in 0..4 {
            let picked = store.pick_ready("chunk").await.unwrap();
            seen.push(picked.endpoint_url);
        }
        assert_eq!(seen, vec!["http://a/chunk", "http://b/chunk", "http://a/chunk", "http://b/chunk"]);
    }

    #[tokio::test]
    async fn consumer_round_robin_skips_unready() {
        let store = ConsumerStore::new();
        store
            .upsert(Consumer::new(
                "chunk".to_string(),
                "http://a/chunk".to_string(),
                None,
            ))
            .await;
        store
            .with_consumer_mut("chunk", "http://a/chunk", |c| c.ready = false)
            .await;

        assert!(store.pick_ready("chunk").await.is_none());
    }

    #[tokio::test]
    async fn remove_consumer() {
        let store = ConsumerStore::new();
        store
            .upsert(Consumer::new(
                "chunk".to_string(),
                "http://a/chunk".to_string(),
                None,
            ))
            .await;
        assert!(store.remove("chunk", "http://a/chunk").await);
        assert!(store.get("chunk", "http://a/chunk").await.is_none());
        assert!(!store.remove("chunk", "http://a/chunk").await);
    }
}
