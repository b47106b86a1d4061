//! The broker's delivery loop and worker-timeout reaper.
//!
//! Runs as a background task inside the broker process, selecting
//! `waiting` tasks whose scheduled start has passed, dispatching them to a
//! ready consumer over HTTP, and applying the retry/backoff/ceiling rules.
//! A small pool of concurrent workers cooperate on the same store, bounded
//! by a semaphore sized from
//! [`taskflow_db::config::BrokerConfig::delivery_concurrency`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use taskflow_db::config::BrokerConfig;
use taskflow_db::models::Task;
use taskflow_db::queries::{consumers as consumer_db, tasks as task_db};
use taskflow_db::store::{ConsumerStore, TaskStore};

use crate::backoff;

/// Body POSTed to a consumer's `endpoint_url`.
#[derive(Debug, Clone, serde::Serialize)]
struct Delivery {
    task_id: Uuid,
    name: String,
    input: serde_json::Value,
    status_callback_url: String,
}

/// Run the delivery loop and the deadline reaper until `cancel` fires.
pub async fn run(
    tasks: Arc<TaskStore>,
    consumers: Arc<ConsumerStore>,
    http: reqwest::Client,
    config: BrokerConfig,
    cancel: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(config.delivery_concurrency.max(1)));
    let mut ticker = tokio::time::interval(config.delivery_tick);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => {
                tracing::info!("delivery loop stopping");
                return;
            }
        }

        reap_expired(&tasks, Utc::now()).await;

        let ready = task_db::list_ready_for_delivery(&tasks, Utc::now()).await;
        for task in ready {
            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break, // all delivery workers busy this tick
            };
            let tasks = Arc::clone(&tasks);
            let consumers = Arc::clone(&consumers);
            let http = http.clone();
            let config = config.clone();
            tokio::spawn(async move {
                let _permit = permit;
                dispatch_one(&tasks, &consumers, &http, &config, task).await;
            });
        }
    }
}

async fn dispatch_one(
    tasks: &TaskStore,
    consumers: &ConsumerStore,
    http: &reqwest::Client,
    config: &BrokerConfig,
    task: Task,
) {
    let Some(consumer) = consumer_db::pick_consumer(consumers, &task.name).await else {
        // No ready consumer for this topic: stays `waiting`, retried next tick.
        return;
    };

    let now = Utc::now();
    let deadline = now + config.processing_deadline;
    let Some(task) = task_db::record_delivery_attempt(tasks, task.id, deadline).await else {
        return; // raced with another delivery worker or a terminal update
    };

    let status_callback_url = format!("{}/task/{}", config.public_url.trim_end_matches('/'), task.id);
    let body = Delivery {
        task_id: task.id,
        name: task.name.clone(),
        input: task.input.clone(),
        status_callback_url,
    };

    let result = http
        .post(&consumer.endpoint_url)
        .timeout(Duration::from_secs(10))
        .json(&body)
        .send()
        .await;

    match result {
        Ok(response) if response.status().is_success() => {
            tracing::info!(
                task_id = %task.id,
                topic = %task.name,
                endpoint = %consumer.endpoint_url,
                attempts = task.attempts,
                "task delivered"
            );
        }
        Ok(response) if is_client_error_non_retryable(response.status()) => {
            let status = response.status();
            let body_text = response.text().await.unwrap_or_default();
            tracing::warn!(
                task_id = %task.id,
                topic = %task.name,
                %status,
                "delivery rejected by consumer, marking task failed"
            );
            let _ = task_db::fail_task(
                tasks,
                task.id,
                format!("delivery rejected: {status} {body_text}"),
                Utc::now(),
            )
            .await;
        }
        Ok(response) => {
            retry_or_fail(
                tasks,
                &task,
                config,
                format!("delivery retry after {}", response.status()),
            )
            .await;
        }
        Err(e) => {
            retry_or_fail(tasks, &task, config, format!("delivery retry after error: {e}")).await;
        }
    }
}

fn is_client_error_non_retryable(status: reqwest::StatusCode) -> bool {
    status.is_client_error() && status.as_u16() != 429
}

async fn retry_or_fail(tasks: &TaskStore, task: &Task, config: &BrokerConfig, message: String) {
    if task.attempts >= config.retry_ceiling {
        tracing::warn!(task_id = %task.id, attempts = task.attempts, "delivery attempt ceiling reached");
        let _ = task_db::fail_task(tasks, task.id, "undeliverable".to_string(), Utc::now()).await;
        return;
    }

    let delay = backoff::exponential(Duration::from_secs(1), task.attempts, 6, Duration::from_secs(120));
    let _ = task_db::reschedule(tasks, task.id, Utc::now() + delay, message).await;
}

/// Reap `processing` tasks whose worker never reported back before the
/// recorded `processing_deadline`.
async fn reap_expired(tasks: &TaskStore, now: chrono::DateTime<Utc>) {
    for task in task_db::list_deadline_expired(tasks, now).await {
        tracing::warn!(task_id = %task.id, "reaping task past processing deadline");
        let _ = task_db::fail_task(tasks, task.id, "worker-timeout".to_string(), now).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskflow_db::config::BrokerConfig;
    use taskflow_db::models::TaskStatus;

    #[tokio::test]
    async fn dispatch_with_no_consumer_leaves_task_waiting() {
        let tasks = TaskStore::new();
        let consumers = ConsumerStore::new();
        let http = reqwest::Client::new();
        let config = BrokerConfig::default();

        let task =
            task_db::insert_task(&tasks, "parse-document".into(), serde_json::json!({}), None, None, None)
                .await;

        dispatch_one(&tasks, &consumers, &http, &config, task.clone()).await;

        let fetched = task_db::get_task(&tasks, task.id).await.unwrap();
        assert_eq!(fetched.status, TaskStatus::Waiting);
        assert_eq!(fetched.attempts, 0);
    }

    #[tokio::test]
    async fn reap_marks_expired_processing_tasks_failed() {
        let tasks = TaskStore::new();
        let task = task_db::insert_task(&tasks, "embed".into(), serde_json::json!({}), None, None, None).await;
        let past = Utc::now() - chrono::Duration::hours(2);
        task_db::record_delivery_attempt(&tasks, task.id, past + chrono::Duration::minutes(1)).await;
        task_db::begin_processing(&tasks, task.id, past).await;

        reap_expired(&tasks, Utc::now()).await;

        let fetched = task_db::get_task(&tasks, task.id).await.unwrap();
        assert_eq!(fetched.status, TaskStatus::Failed);
        assert_eq!(fetched.status_message, "worker-timeout");
    }

    #[tokio::test]
    async fn retry_or_fail_marks_undeliverable_past_ceiling() {
        let tasks = TaskStore::new();
        let config = BrokerConfig {
            retry_ceiling: 2,
            ..BrokerConfig::default()
        };
        let task = task_db::insert_task(&tasks, "chunk".into(), serde_json::json!({}), None, None, None).await;
        task_db::record_delivery_attempt(&tasks, task.id, Utc::now() + chrono::Duration::hours(1)).await;
        let task = task_db::get_task(&tasks, task.id).await.unwrap();
        task_db::record_delivery_attempt(&tasks, task.id, Utc::now() + chrono::Duration::hours(1)).await;
        let task = task_db::get_task(&tasks, task.id).await.unwrap();
        assert_eq!(task.attempts, 2);

        retry_or_fail(&tasks, &task, &config, "5xx".into()).await;

        let fetched = task_db::get_task(&tasks, task.id).await.unwrap();
        assert_eq!(fetched.status, TaskStatus::Failed);
        assert_eq!(fetched.status_message, "undeliverable");
    }
}
