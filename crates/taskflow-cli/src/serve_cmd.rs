//! `taskflow broker serve` / `taskflow orchestrator serve`: run the broker's
//! or orchestrator's HTTP surface in the foreground until Ctrl-C.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use taskflow_core::client::BrokerClient;
use taskflow_db::config::{BrokerConfig, OrchestratorConfig};
use taskflow_db::store::{ConsumerStore, TaskStore};

pub async fn run_broker_serve() -> anyhow::Result<()> {
    let config = BrokerConfig::from_env();
    let tasks = Arc::new(TaskStore::new());
    let consumers = Arc::new(ConsumerStore::new());
    let http = reqwest::Client::new();
    let cancel = CancellationToken::new();

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        shutdown.cancel();
    });

    taskflow_server::run_broker(tasks, consumers, http, config, cancel).await
}

pub async fn run_orchestrator_serve() -> anyhow::Result<()> {
    let config = OrchestratorConfig::from_env();
    let client = BrokerClient::new(reqwest::Client::new(), config.broker_url.clone());
    let cancel = CancellationToken::new();

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        shutdown.cancel();
    });

    taskflow_server::run_orchestrator(client, config, cancel).await
}
