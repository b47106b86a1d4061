//! HTTP client for the broker's wire surface, used by the orchestrator to
//! create child tasks, poll their status, and conclude the root task. Kept
//! separate from the delivery loop's outbound POST to an arbitrary consumer
//! `endpoint_url`, which speaks the worker contract instead.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use taskflow_db::models::TaskStatus;

/// Body of `POST /task`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub name: String,
    pub input: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_start_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// Body of `PUT /task/{id}`: any subset of mutable fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_start_at: Option<DateTime<Utc>>,
}

impl TaskPatch {
    pub fn completed(output: serde_json::Value) -> Self {
        Self {
            status_code: Some(TaskStatus::Completed.code()),
            status: Some("completed".to_string()),
            output: Some(output),
            ..Default::default()
        }
    }

    pub fn failed(status: impl Into<String>) -> Self {
        Self {
            status_code: Some(TaskStatus::Failed.code()),
            status: Some(status.into()),
            ..Default::default()
        }
    }

    pub fn processing(status: impl Into<String>) -> Self {
        Self {
            status_code: Some(TaskStatus::Processing.code()),
            status: Some(status.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub status_code: u8,
    pub status: String,
    pub progress: u8,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
}

/// Mirrors the broker's `TaskResponse` wire shape: flat `status_code` +
/// `status`, not the internal [`taskflow_db::models::Task`] model (which
/// carries `status_message` alongside a `TaskStatus` enum instead).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub id: Uuid,
    pub name: String,
    pub parent_id: Option<Uuid>,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub status_code: u8,
    pub status: String,
    pub progress: u8,
    pub state: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub scheduled_start_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub processing_deadline: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
}

/// A thin `reqwest`-backed client over the broker's HTTP surface.
#[derive(Clone)]
pub struct BrokerClient {
    http: reqwest::Client,
    base_url: String,
}

impl BrokerClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    pub async fn create_task(&self, req: &CreateTaskRequest) -> Result<TaskView> {
        let response = self
            .http
            .post(self.url("/task"))
            .json(req)
            .send()
            .await
            .context("failed to reach broker for task creation")?;

        if !response.status().is_success() {
            bail!("broker rejected task creation: {}", response.status());
        }
        response
            .json::<TaskView>()
            .await
            .context("failed to decode broker task-creation response")
    }

    pub async fn get_task(&self, id: Uuid) -> Result<TaskView> {
        let response = self
            .http
            .get(self.url(&format!("/task/{id}")))
            .send()
            .await
            .context("failed to reach broker for task lookup")?;

        if response.status().as_u16() == 404 {
            bail!("task {id} not found");
        }
        response
            .json::<TaskView>()
            .await
            .context("failed to decode broker task response")
    }

    pub async fn get_status(&self, id: Uuid) -> Result<TaskStatusView> {
        let response = self
            .http
            .get(self.url(&format!("/task/{id}/status")))
            .send()
            .await
            .context("failed to reach broker for status poll")?;

        if response.status().as_u16() == 404 {
            bail!("task {id} not found");
        }
        response
            .json::<TaskStatusView>()
            .await
            .context("failed to decode broker status response")
    }

    pub async fn update_task(&self, id: Uuid, patch: &TaskPatch) -> Result<TaskView> {
        let response = self
            .http
            .put(self.url(&format!("/task/{id}")))
            .json(patch)
            .send()
            .await
            .context("failed to reach broker for task update")?;

        match response.status().as_u16() {
            200 => response
                .json::<TaskView>()
                .await
                .context("failed to decode broker task-update response"),
            404 => bail!("task {id} not found"),
            409 => bail!("invalid transition for task {id}"),
            other => bail!("unexpected broker response updating task {id}: {other}"),
        }
    }
}
