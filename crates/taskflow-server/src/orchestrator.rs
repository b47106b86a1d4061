//! HTTP surface for the Index Orchestrator: the single worker endpoint the
//! broker's delivery loop POSTs `index-document` deliveries to.

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use taskflow_core::client::BrokerClient;
use taskflow_core::orchestrator::{self, PipelineDefinition};
use taskflow_db::config::OrchestratorConfig;

/// Body the broker POSTs on delivery.
#[derive(Debug, Deserialize)]
pub struct Delivery {
    pub task_id: Uuid,
    #[allow(dead_code)]
    pub name: String,
    pub input: Value,
    #[allow(dead_code)]
    pub status_callback_url: String,
}

#[derive(Clone)]
struct OrchestratorState {
    client: BrokerClient,
    config: OrchestratorConfig,
    cancel: CancellationToken,
}

pub fn build_orchestrator_router(client: BrokerClient, config: OrchestratorConfig, cancel: CancellationToken) -> Router {
    let state = OrchestratorState { client, config, cancel };
    Router::new()
        .route("/", post(accept_delivery))
        .route("/health", get(health))
        .with_state(state)
}

pub async fn run_orchestrator(
    client: BrokerClient,
    config: OrchestratorConfig,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.bind, config.port).parse()?;
    let app = build_orchestrator_router(client, config, cancel.clone());
    tracing::info!("orchestrator listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    tracing::info!("orchestrator shut down");
    Ok(())
}

async fn health() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Accept responsibility for an `index-document` task: acknowledge with 2xx
/// immediately (the worker contract), then drive the pipeline in the
/// background. The root task's own terminal state is what callers should
/// poll, not this response.
async fn accept_delivery(State(state): State<OrchestratorState>, Json(delivery): Json<Delivery>) -> Result<Response, (StatusCode, String)> {
    let definition: PipelineDefinition = serde_json::from_value(delivery.input)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("malformed pipeline definition: {e}")))?;

    let client = state.client.clone();
    let config = state.config.clone();
    let cancel = state.cancel.child_token();
    let root_id = delivery.task_id;

    tokio::spawn(async move {
        if let Err(e) = orchestrator::run_pipeline(&client, &config, root_id, definition, cancel).await {
            tracing::error!(task_id = %root_id, error = %e, "pipeline driver failed to report back to broker");
        }
    });

    Ok(StatusCode::ACCEPTED.into_response())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    #[tokio::test]
    async fn accept_delivery_rejects_malformed_input() {
        let client = BrokerClient::new(reqwest::Client::new(), "http://127.0.0.1:0");
        let config = OrchestratorConfig {
            bind: "127.0.0.1".to_string(),
            port: 0,
            ..OrchestratorConfig::default()
        };
        let router = build_orchestrator_router(client, config, CancellationToken::new());

        let body = serde_json::json!({
            "task_id": Uuid::new_v4(),
            "name": "index-document",
            "input": {"not": "a pipeline"},
            "status_callback_url": "http://broker/task/x",
        });

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
