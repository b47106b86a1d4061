//! The broker's HTTP surface.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use taskflow_core::client::TaskPatch;
use taskflow_core::state::dispatch;
use taskflow_core::{TaskStateMachine, TaskflowError};
use taskflow_db::config::BrokerConfig;
use taskflow_db::models::{Consumer, Task, TaskStatus};
use taskflow_db::queries::{consumers as consumer_db, tasks as task_db};
use taskflow_db::store::{ConsumerStore, TaskStore};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl AppError {
    fn invalid_argument(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, kind: "validation", message: msg.into() }
    }

    /// Consumer-registry lookups have no `TaskflowError` kind of their own.
    fn not_found(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::NOT_FOUND, kind: "not-found", message: msg.into() }
    }
}

/// Maps a [`TaskflowError`] kind to its HTTP status code. This is the
/// one place status codes and error kinds are joined, so handlers never
/// match kind strings themselves.
impl From<TaskflowError> for AppError {
    fn from(err: TaskflowError) -> Self {
        let status = match &err {
            TaskflowError::NotFound(_) => StatusCode::NOT_FOUND,
            TaskflowError::Validation(_) => StatusCode::BAD_REQUEST,
            TaskflowError::InvalidTransition { .. } | TaskflowError::TerminalMismatch(_) => StatusCode::CONFLICT,
            TaskflowError::DeliveryTransport { .. }
            | TaskflowError::WorkerFailure { .. }
            | TaskflowError::StepTimeout(_)
            | TaskflowError::Cancelled(_)
            | TaskflowError::WorkerSilentTimeout(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self { status, kind: err.kind(), message: err.to_string() }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message, "kind": self.kind });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub id: Uuid,
    pub name: String,
    pub parent_id: Option<Uuid>,
    pub input: Value,
    pub output: Option<Value>,
    pub status_code: u8,
    pub status: String,
    pub progress: u8,
    pub state: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub scheduled_start_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub processing_deadline: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
}

impl From<Task> for TaskResponse {
    fn from(t: Task) -> Self {
        Self {
            id: t.id,
            name: t.name,
            parent_id: t.parent_id,
            input: t.input,
            output: t.output,
            status_code: t.status.code(),
            status: t.status_message,
            progress: t.progress,
            state: t.state,
            created_at: t.created_at,
            scheduled_start_at: t.scheduled_start_at,
            started_at: t.started_at,
            ended_at: t.ended_at,
            attempts: t.attempts,
            processing_deadline: t.processing_deadline,
            idempotency_key: t.idempotency_key,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status_code: u8,
    pub status: String,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl From<Task> for StatusResponse {
    fn from(t: Task) -> Self {
        Self {
            status_code: t.status.code(),
            status: t.status_message,
            progress: t.progress,
            output: t.output,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskBody {
    pub name: String,
    pub input: Value,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub scheduled_start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    pub name: Option<String>,
    pub status_code: Option<u8>,
}

#[derive(Debug, Deserialize)]
pub struct ConsumerBody {
    pub topic: String,
    pub endpoint_url: String,
    #[serde(default)]
    pub health_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConsumerKey {
    pub topic: String,
    pub endpoint_url: String,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct BrokerState {
    pub tasks: Arc<TaskStore>,
    pub consumers: Arc<ConsumerStore>,
}

pub fn build_broker_router(tasks: Arc<TaskStore>, consumers: Arc<ConsumerStore>) -> Router {
    let state = BrokerState { tasks, consumers };
    Router::new()
        .route("/task", post(create_task).get(list_tasks))
        .route("/task/{id}", get(get_task).put(update_task))
        .route("/task/{id}/status", get(get_task_status))
        .route("/consumer", put(upsert_consumer).get(list_consumers).delete(remove_consumer))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_broker(
    tasks: Arc<TaskStore>,
    consumers: Arc<ConsumerStore>,
    http: reqwest::Client,
    config: BrokerConfig,
    cancel: tokio_util::sync::CancellationToken,
) -> anyhow::Result<()> {
    let delivery_cancel = cancel.clone();
    let delivery_handle = tokio::spawn(taskflow_core::delivery::run(
        Arc::clone(&tasks),
        Arc::clone(&consumers),
        http.clone(),
        config.clone(),
        delivery_cancel,
    ));

    let health_cancel = cancel.clone();
    let health_handle = tokio::spawn(taskflow_core::consumer::health::run(
        Arc::clone(&consumers),
        http,
        config.health_probe_interval,
        config.health_failure_threshold,
        health_cancel,
    ));

    let app = build_broker_router(tasks, consumers);
    let addr: SocketAddr = format!("{}:{}", config.bind, config.port).parse()?;
    tracing::info!("broker listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    delivery_handle.await.ok();
    health_handle.await.ok();
    tracing::info!("broker shut down");
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn create_task(
    State(state): State<BrokerState>,
    Json(body): Json<CreateTaskBody>,
) -> Result<Response, AppError> {
    if body.name.trim().is_empty() {
        return Err(AppError::invalid_argument("name must not be empty"));
    }
    if !body.input.is_object() {
        return Err(AppError::invalid_argument("input must be a JSON object"));
    }

    let task = task_db::insert_task(
        &state.tasks,
        body.name,
        body.input,
        body.parent_id,
        body.scheduled_start_at,
        body.idempotency_key,
    )
    .await;

    let location = format!("/task/{}/status", task.id);
    let mut response = (StatusCode::ACCEPTED, Json(TaskResponse::from(task))).into_response();
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    Ok(response)
}

async fn list_tasks(
    State(state): State<BrokerState>,
    Query(query): Query<ListTasksQuery>,
) -> Json<Vec<TaskResponse>> {
    let status = query.status_code.and_then(TaskStatus::from_code);
    let tasks = task_db::list_tasks(&state.tasks, query.name.as_deref(), status).await;
    Json(tasks.into_iter().map(TaskResponse::from).collect())
}

async fn get_task(
    State(state): State<BrokerState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskResponse>, AppError> {
    let task = task_db::get_task(&state.tasks, id)
        .await
        .ok_or(TaskflowError::NotFound(id))?;
    Ok(Json(TaskResponse::from(task)))
}

async fn get_task_status(
    State(state): State<BrokerState>,
    Path(id): Path<Uuid>,
) -> Result<Json<StatusResponse>, AppError> {
    let task = task_db::get_task(&state.tasks, id)
        .await
        .ok_or(TaskflowError::NotFound(id))?;
    Ok(Json(StatusResponse::from(task)))
}

/// Apply a worker's status report. `status_code` transitions are validated
/// against the monotone graph; a repeated terminal update is accepted as a
/// no-op if it agrees with the recorded terminal state (same status code and,
/// for `completed`, the same output), and rejected with `terminal-mismatch`
/// (409) otherwise.
async fn update_task(
    State(state): State<BrokerState>,
    Path(id): Path<Uuid>,
    Json(patch): Json<TaskPatch>,
) -> Result<Json<TaskResponse>, AppError> {
    let current = task_db::get_task(&state.tasks, id)
        .await
        .ok_or(TaskflowError::NotFound(id))?;

    if let Some(code) = patch.status_code {
        let to = TaskStatus::from_code(code)
            .ok_or_else(|| AppError::invalid_argument(format!("unknown status_code {code}")))?;

        if current.status.is_terminal() {
            let matches = to == current.status
                && (to != TaskStatus::Completed || patch.output == current.output);
            if matches {
                return Ok(Json(TaskResponse::from(current)));
            }
            return Err(TaskflowError::TerminalMismatch(id).into());
        }
        if !TaskStateMachine::is_valid_transition(current.status, to) || to == TaskStatus::Waiting {
            return Err(TaskflowError::InvalidTransition {
                task_id: id,
                from: current.status.to_string(),
                to: to.to_string(),
            }
            .into());
        }

        let updated = match to {
            TaskStatus::Processing => dispatch::begin_processing(&state.tasks, id, Utc::now()).await,
            TaskStatus::Completed => {
                dispatch::complete_task(&state.tasks, id, patch.output.clone().unwrap_or(Value::Null)).await
            }
            TaskStatus::Failed => {
                dispatch::fail_task(&state.tasks, id, patch.status.clone().unwrap_or_else(|| "failed".to_string())).await
            }
            TaskStatus::Waiting => unreachable!("rejected above"),
        };

        let mut updated = updated
            .map_err(|e| AppError::invalid_argument(e.to_string()))?
            .ok_or(TaskflowError::TerminalMismatch(id))?;
        if to == TaskStatus::Processing {
            if let Some(status_message) = patch.status.clone() {
                updated = task_db::update_progress(&state.tasks, id, updated.progress, Some(status_message), patch.state.clone())
                    .await
                    .unwrap_or(updated);
            }
        }
        return Ok(Json(TaskResponse::from(updated)));
    }

    if patch.progress.is_some() || patch.status.is_some() || patch.state.is_some() {
        let updated = task_db::update_progress(
            &state.tasks,
            id,
            patch.progress.unwrap_or(current.progress),
            patch.status.clone(),
            patch.state.clone(),
        )
        .await
        .ok_or(TaskflowError::TerminalMismatch(id))?;
        return Ok(Json(TaskResponse::from(updated)));
    }

    if let Some(scheduled_start_at) = patch.scheduled_start_at {
        let updated = task_db::reschedule(&state.tasks, id, scheduled_start_at, current.status_message.clone())
            .await
            .ok_or(TaskflowError::TerminalMismatch(id))?;
        return Ok(Json(TaskResponse::from(updated)));
    }

    Ok(Json(TaskResponse::from(current)))
}

async fn upsert_consumer(
    State(state): State<BrokerState>,
    Json(body): Json<ConsumerBody>,
) -> Result<Json<Consumer>, AppError> {
    let consumer = taskflow_core::consumer::register(&state.consumers, body.topic, body.endpoint_url, body.health_url)
        .await
        .map_err(|e| AppError::invalid_argument(e.to_string()))?;
    Ok(Json(consumer))
}

async fn remove_consumer(
    State(state): State<BrokerState>,
    Json(key): Json<ConsumerKey>,
) -> Result<StatusCode, AppError> {
    let removed = taskflow_core::consumer::deregister(&state.consumers, &key.topic, &key.endpoint_url).await;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found("consumer not registered"))
    }
}

async fn list_consumers(State(state): State<BrokerState>) -> Json<Vec<Consumer>> {
    Json(consumer_db::list_consumers(&state.consumers).await)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;

    async fn send(router: Router, method: &str, uri: &str, body: Value) -> Response {
        router
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn router() -> Router {
        build_broker_router(Arc::new(TaskStore::new()), Arc::new(ConsumerStore::new()))
    }

    #[tokio::test]
    async fn create_task_rejects_empty_name() {
        let resp = send(router(), "POST", "/task", serde_json::json!({"name": "", "input": {}})).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_then_get_task_roundtrip() {
        let router = router();
        let created = send(router.clone(), "POST", "/task", serde_json::json!({"name": "chunk", "input": {}})).await;
        assert_eq!(created.status(), StatusCode::ACCEPTED);
        let created = body_json(created).await;
        let id = created["id"].as_str().unwrap();

        let fetched = send(router, "GET", &format!("/task/{id}"), Value::Null).await;
        assert_eq!(fetched.status(), StatusCode::OK);
        let fetched = body_json(fetched).await;
        assert_eq!(fetched["status_code"], 0);
        assert_eq!(fetched["status"], "waiting");
    }

    #[tokio::test]
    async fn get_unknown_task_is_404() {
        let resp = send(router(), "GET", &format!("/task/{}", Uuid::new_v4()), Value::Null).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn update_task_rejects_invalid_transition() {
        let router = router();
        let created = body_json(send(router.clone(), "POST", "/task", serde_json::json!({"name": "embed", "input": {}})).await).await;
        let id = created["id"].as_str().unwrap();

        let resp = send(router, "PUT", &format!("/task/{id}"), serde_json::json!({"status_code": 2})).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn update_task_completes_after_processing() {
        let router = router();
        let created = body_json(send(router.clone(), "POST", "/task", serde_json::json!({"name": "embed", "input": {}})).await).await;
        let id = created["id"].as_str().unwrap();

        let processing = send(router.clone(), "PUT", &format!("/task/{id}"), serde_json::json!({"status_code": 1})).await;
        assert_eq!(processing.status(), StatusCode::OK);

        let completed = send(router, "PUT", &format!("/task/{id}"), serde_json::json!({"status_code": 2, "output": {"ok": true}})).await;
        assert_eq!(completed.status(), StatusCode::OK);
        let completed = body_json(completed).await;
        assert_eq!(completed["status_code"], 2);
        assert_eq!(completed["output"]["ok"], true);
    }

    #[tokio::test]
    async fn duplicate_terminal_update_is_idempotent_no_op() {
        let router = router();
        let created = body_json(send(router.clone(), "POST", "/task", serde_json::json!({"name": "embed", "input": {}})).await).await;
        let id = created["id"].as_str().unwrap();
        send(router.clone(), "PUT", &format!("/task/{id}"), serde_json::json!({"status_code": 1})).await;
        send(router.clone(), "PUT", &format!("/task/{id}"), serde_json::json!({"status_code": 2, "output": {"ok": true}})).await;

        let second = send(router, "PUT", &format!("/task/{id}"), serde_json::json!({"status_code": 2, "output": {"ok": true}})).await;
        assert_eq!(second.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn duplicate_terminal_update_with_different_output_is_rejected() {
        let router = router();
        let created = body_json(send(router.clone(), "POST", "/task", serde_json::json!({"name": "embed", "input": {}})).await).await;
        let id = created["id"].as_str().unwrap();
        send(router.clone(), "PUT", &format!("/task/{id}"), serde_json::json!({"status_code": 1})).await;
        send(router.clone(), "PUT", &format!("/task/{id}"), serde_json::json!({"status_code": 2, "output": {"ok": true}})).await;

        let second = send(router, "PUT", &format!("/task/{id}"), serde_json::json!({"status_code": 2, "output": {"ok": false}})).await;
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn consumer_upsert_then_list_then_remove() {
        let router = router();
        let upserted = send(
            router.clone(),
            "PUT",
            "/consumer",
            serde_json::json!({"topic": "chunk", "endpoint_url": "http://worker/chunk"}),
        )
        .await;
        assert_eq!(upserted.status(), StatusCode::OK);

        let listed = body_json(send(router.clone(), "GET", "/consumer", Value::Null).await).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let removed = send(
            router,
            "DELETE",
            "/consumer",
            serde_json::json!({"topic": "chunk", "endpoint_url": "http://worker/chunk"}),
        )
        .await;
        assert_eq!(removed.status(), StatusCode::NO_CONTENT);
    }
}
