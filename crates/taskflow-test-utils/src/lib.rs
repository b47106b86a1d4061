//! Shared test fixtures for broker/orchestrator integration tests.
//!
//! Persistence is in-memory (no Postgres, no `testcontainers`), so these
//! fixtures are just: a broker bound to an ephemeral port with its
//! background loops running, and a programmable stub HTTP worker that
//! plays back a scripted sequence of outcomes. Both shut down when dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use taskflow_core::client::{BrokerClient, TaskPatch};
use taskflow_db::config::BrokerConfig;
use taskflow_db::store::{ConsumerStore, TaskStore};

/// An in-process broker with its delivery loop and health-probe loop
/// running, bound to an ephemeral localhost port.
pub struct TestBroker {
    pub base_url: String,
    pub tasks: Arc<TaskStore>,
    pub consumers: Arc<ConsumerStore>,
    cancel: CancellationToken,
    server: JoinHandle<()>,
}

impl TestBroker {
    pub fn client(&self) -> BrokerClient {
        BrokerClient::new(reqwest::Client::new(), self.base_url.clone())
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.server.abort();
    }
}

/// Spin up a broker for the duration of a test: fast delivery/health
/// cadence so tests don't need to sleep long to observe a dispatch.
pub async fn spawn_test_broker() -> TestBroker {
    let tasks = Arc::new(TaskStore::new());
    let consumers = Arc::new(ConsumerStore::new());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind test broker listener");
    let addr = listener.local_addr().expect("listener should have a local addr");
    let base_url = format!("http://{addr}");

    let config = BrokerConfig {
        bind: addr.ip().to_string(),
        port: addr.port(),
        public_url: base_url.clone(),
        delivery_tick: std::time::Duration::from_millis(20),
        health_probe_interval: std::time::Duration::from_millis(50),
        ..BrokerConfig::default()
    };

    let cancel = CancellationToken::new();
    let http = reqwest::Client::new();

    let delivery_cancel = cancel.clone();
    tokio::spawn(taskflow_core::delivery::run(
        Arc::clone(&tasks),
        Arc::clone(&consumers),
        http.clone(),
        config.clone(),
        delivery_cancel,
    ));

    let health_cancel = cancel.clone();
    tokio::spawn(taskflow_core::consumer::health::run(
        Arc::clone(&consumers),
        http,
        config.health_probe_interval,
        config.health_failure_threshold,
        health_cancel,
    ));

    let app = taskflow_server::build_broker_router(Arc::clone(&tasks), Arc::clone(&consumers));
    let serve_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move { serve_cancel.cancelled().await })
            .await;
    });

    TestBroker { base_url, tasks, consumers, cancel, server }
}

/// What a stub worker does with its `n`th delivery (0-indexed), given that
/// delivery's `input`.
pub type StubBehavior = Arc<dyn Fn(u32, &Value) -> StubOutcome + Send + Sync>;

#[derive(Debug, Clone)]
pub enum StubOutcome {
    Succeed(Value),
    Fail(String),
    /// Reject the delivery itself (never ack 2xx), forcing the broker's
    /// redelivery/backoff path instead of a worker-reported failure.
    RejectDelivery,
}

/// Always succeed with a fixed output.
pub fn always_succeed(output: Value) -> StubBehavior {
    Arc::new(move |_, _| StubOutcome::Succeed(output.clone()))
}

/// Fail the first `n` deliveries, then succeed.
pub fn fail_then_succeed(n: u32, output: Value) -> StubBehavior {
    Arc::new(move |call, _| {
        if call < n {
            StubOutcome::Fail(format!("stub failure {}/{n}", call + 1))
        } else {
            StubOutcome::Succeed(output.clone())
        }
    })
}

/// A stub HTTP worker registered against a broker: acks each delivery and
/// reports the scripted [`StubOutcome`] back via the delivery's
/// `status_callback_url`.
pub struct StubConsumer {
    pub endpoint_url: String,
    pub health_url: String,
    server: JoinHandle<()>,
}

impl Drop for StubConsumer {
    fn drop(&mut self) {
        self.server.abort();
    }
}

#[derive(Clone)]
struct StubState {
    http: reqwest::Client,
    behavior: StubBehavior,
    call_count: Arc<AtomicU32>,
}

#[derive(serde::Deserialize)]
struct Delivery {
    #[allow(dead_code)]
    task_id: Uuid,
    #[allow(dead_code)]
    name: String,
    input: Value,
    status_callback_url: String,
}

pub async fn spawn_stub_consumer(behavior: StubBehavior) -> StubConsumer {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind stub consumer listener");
    let addr: SocketAddr = listener.local_addr().expect("listener should have a local addr");
    let endpoint_url = format!("http://{addr}/deliver");
    let health_url = format!("http://{addr}/health");

    let state = StubState {
        http: reqwest::Client::new(),
        behavior,
        call_count: Arc::new(AtomicU32::new(0)),
    };

    let app = Router::new()
        .route("/deliver", post(deliver))
        .route("/health", get(health))
        .with_state(state);

    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    StubConsumer { endpoint_url, health_url, server }
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn deliver(State(state): State<StubState>, Json(delivery): Json<Delivery>) -> StatusCode {
    let call = state.call_count.fetch_add(1, Ordering::SeqCst);
    let outcome = (state.behavior)(call, &delivery.input);

    if matches!(outcome, StubOutcome::RejectDelivery) {
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    tokio::spawn(async move {
        let url = delivery.status_callback_url;
        let processing = TaskPatch::processing("stub worker processing");
        if let Err(e) = state.http.put(&url).json(&processing).send().await {
            tracing::warn!(error = %e, "stub consumer failed to report processing");
            return;
        }

        let terminal = match outcome {
            StubOutcome::Succeed(output) => TaskPatch::completed(output),
            StubOutcome::Fail(message) => TaskPatch::failed(message),
            StubOutcome::RejectDelivery => unreachable!("handled above"),
        };
        if let Err(e) = state.http.put(&url).json(&terminal).send().await {
            tracing::warn!(error = %e, "stub consumer failed to report terminal status");
        }
    });

    StatusCode::ACCEPTED
}
