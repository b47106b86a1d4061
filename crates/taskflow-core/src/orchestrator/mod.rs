//! The Index Orchestrator: consumes one `index-document` task and drives
//! the declared pipeline to completion.
//!
//! Runs as a worker process registered for the `index-document` topic. It
//! never touches the task store directly — every child task it creates,
//! polls, or cancels goes through [`crate::client::BrokerClient`], the same
//! way any other worker would, keeping the broker the sole owner of task
//! state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use taskflow_db::config::OrchestratorConfig;
use taskflow_db::models::TaskStatus;

use crate::backoff;
use crate::client::{BrokerClient, CreateTaskRequest, TaskPatch};

/// Names of the two fan-out steps.
const FANOUT_STEPS: [&str; 2] = ["embed", "index"];

/// The pipeline definition carried as an `index-document` task's `input`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineDefinition {
    #[serde(default)]
    pub description: Option<String>,
    pub s3_key: String,
    pub file_id: String,
    pub workspace_id: Value,
    pub original_filename: String,
    pub steps: Vec<StepSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StepSpec {
    pub name: String,
    #[serde(default)]
    pub options: Option<Value>,
}

/// The accumulated record of step outputs threaded through the pipeline.
type Carry = Map<String, Value>;

enum StepOutcome {
    Success,
    Failed { message: String },
    Cancelled,
}

enum PollOutcome {
    Completed(Value),
    Failed(String),
    TimedOut,
    Cancelled,
}

/// Drive `definition` to completion for `root_id`, reporting the outcome
/// back onto the root task. Errors returned here are transport/protocol
/// failures talking to the broker itself, not pipeline failures — those
/// are always resolved into a root-task update and `Ok(())`.
pub async fn run_pipeline(
    client: &BrokerClient,
    config: &OrchestratorConfig,
    root_id: Uuid,
    definition: PipelineDefinition,
    cancel: CancellationToken,
) -> Result<()> {
    client
        .update_task(root_id, &TaskPatch::processing("running pipeline"))
        .await
        .context("failed to mark root task processing")?;

    let mut carry = definition_to_carry(&definition);

    for step in &definition.steps {
        if cancel.is_cancelled() || root_externally_cancelled(client, root_id).await {
            tracing::warn!(root_id = %root_id, "pipeline cancelled before step completed");
            let _ = client
                .update_task(root_id, &TaskPatch::failed("pipeline cancelled"))
                .await;
            return Ok(());
        }

        let outcome = if FANOUT_STEPS.contains(&step.name.as_str()) {
            run_fan_out_step(client, config, root_id, step, &carry, &cancel).await
        } else {
            run_fan_in_step(client, config, root_id, step, &mut carry, &cancel).await
        };

        match outcome {
            StepOutcome::Success => {
                tracing::info!(root_id = %root_id, step = %step.name, "step completed");
            }
            StepOutcome::Failed { message } => {
                let full = format!("step={} failed: {message}", step.name);
                tracing::warn!(root_id = %root_id, step = %step.name, %message, "step failed, failing root task");
                let _ = client.update_task(root_id, &TaskPatch::failed(full)).await;
                return Ok(());
            }
            StepOutcome::Cancelled => {
                let _ = client
                    .update_task(root_id, &TaskPatch::failed("pipeline cancelled"))
                    .await;
                return Ok(());
            }
        }
    }

    let chunk_count = carry
        .get("chunks")
        .and_then(|v| v.as_array())
        .map(|a| a.len())
        .unwrap_or(0);
    let output = json!({ "indexed_chunks": chunk_count, "steps_completed": definition.steps.len() });
    client
        .update_task(root_id, &TaskPatch::completed(output))
        .await
        .context("failed to mark root task completed")?;
    Ok(())
}

fn definition_to_carry(definition: &PipelineDefinition) -> Carry {
    let mut carry = Map::new();
    carry.insert("s3_key".to_string(), json!(definition.s3_key));
    carry.insert("file_id".to_string(), json!(definition.file_id));
    carry.insert("workspace_id".to_string(), definition.workspace_id.clone());
    carry.insert(
        "original_filename".to_string(),
        json!(definition.original_filename),
    );
    if let Some(description) = &definition.description {
        carry.insert("description".to_string(), json!(description));
    }
    carry
}

/// Most-processed-available artifact key: prefer `redacted_s3_key`, then
/// `parsed_s3_key`, then the original `s3_key`.
fn resolve_s3_key(carry: &Carry) -> Option<String> {
    ["redacted_s3_key", "parsed_s3_key", "s3_key"]
        .into_iter()
        .find_map(|key| carry.get(key).and_then(|v| v.as_str()).map(str::to_string))
}

/// `merge(carry, options)`: carry fields overlaid by `options`' own fields.
fn merge_input(carry: &Carry, options: Option<&Value>) -> Value {
    let mut merged = carry.clone();
    if let Some(Value::Object(options)) = options {
        for (k, v) in options {
            merged.insert(k.clone(), v.clone());
        }
    }
    Value::Object(merged)
}

fn step_timeout(step: &StepSpec, config: &OrchestratorConfig) -> Duration {
    step.options
        .as_ref()
        .and_then(|o| o.get("timeout_seconds"))
        .and_then(Value::as_u64)
        .map(Duration::from_secs)
        .unwrap_or(config.step_timeout)
}

async fn root_externally_cancelled(client: &BrokerClient, root_id: Uuid) -> bool {
    match client.get_status(root_id).await {
        Ok(view) => view.status_code == TaskStatus::Failed.code(),
        Err(_) => false,
    }
}

/// Run a fan-in step: create one child task, poll it to completion,
/// retrying on failure up to the per-step cap. On success, merges the
/// child's output into `carry`.
async fn run_fan_in_step(
    client: &BrokerClient,
    config: &OrchestratorConfig,
    root_id: Uuid,
    step: &StepSpec,
    carry: &mut Carry,
    cancel: &CancellationToken,
) -> StepOutcome {
    let mut attempt = 0u32;
    let timeout = step_timeout(step, config);

    loop {
        let mut input = carry.clone();
        if let Some(key) = resolve_s3_key(carry) {
            input.insert("s3_key".to_string(), json!(key));
        }
        let input = merge_input(&input, step.options.as_ref());

        let child = match client
            .create_task(&CreateTaskRequest {
                name: step.name.clone(),
                input,
                parent_id: Some(root_id),
                scheduled_start_at: None,
                idempotency_key: None,
            })
            .await
        {
            Ok(child) => child,
            Err(e) => return StepOutcome::Failed { message: format!("could not create child task: {e}") },
        };

        match poll_until_terminal(client, child.id, timeout, config, cancel).await {
            PollOutcome::Completed(output) => {
                if let Value::Object(fields) = output {
                    carry.extend(fields);
                }
                return StepOutcome::Success;
            }
            PollOutcome::Cancelled => return StepOutcome::Cancelled,
            PollOutcome::Failed(reason) => {
                attempt += 1;
                if attempt > config.step_retry_cap {
                    return StepOutcome::Failed {
                        message: format!("failed after {attempt} attempts: {reason}"),
                    };
                }
                sleep_with_backoff(attempt, config, cancel).await;
            }
            PollOutcome::TimedOut => {
                attempt += 1;
                if attempt > config.step_retry_cap {
                    return StepOutcome::Failed {
                        message: format!("failed after {attempt} attempts: step timeout"),
                    };
                }
                sleep_with_backoff(attempt, config, cancel).await;
            }
        }
    }
}

/// Run a fan-out step (`embed`/`index`): one child per chunk produced by
/// the most recent `chunk` step, bounded by `fanout_concurrency`. Chunk
/// outputs are not merged back into carry.
async fn run_fan_out_step(
    client: &BrokerClient,
    config: &OrchestratorConfig,
    root_id: Uuid,
    step: &StepSpec,
    carry: &Carry,
    cancel: &CancellationToken,
) -> StepOutcome {
    let chunks: Vec<Value> = carry
        .get("chunks")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    if chunks.is_empty() {
        // Fan-out with 0 chunks trivially succeeds.
        return StepOutcome::Success;
    }

    let workspace_id = carry.get("workspace_id").cloned().unwrap_or(Value::Null);
    let semaphore = Arc::new(Semaphore::new(config.fanout_concurrency.max(1)));
    let step_cancel = cancel.child_token();
    let mut joins = JoinSet::new();

    for chunk in chunks {
        let chunk_id = chunk.get("chunk_id").cloned().unwrap_or(Value::Null);
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let client = client.clone();
        let config = config.clone();
        let step_name = step.name.clone();
        let workspace_id = workspace_id.clone();
        let step_cancel_child = step_cancel.clone();

        joins.spawn(async move {
            let _permit = permit;
            run_chunk_with_retry(&client, &config, root_id, &step_name, chunk_id, workspace_id, &step_cancel_child)
                .await
        });
    }

    let mut failure: Option<String> = None;
    while let Some(joined) = joins.join_next().await {
        match joined {
            Ok(StepOutcome::Failed { message }) => {
                if failure.is_none() {
                    failure = Some(message);
                    step_cancel.cancel();
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "fan-out chunk task panicked");
                if failure.is_none() {
                    failure = Some("chunk worker task panicked".to_string());
                    step_cancel.cancel();
                }
            }
        }
    }

    match failure {
        Some(message) => StepOutcome::Failed { message },
        None => StepOutcome::Success,
    }
}

async fn run_chunk_with_retry(
    client: &BrokerClient,
    config: &OrchestratorConfig,
    root_id: Uuid,
    step_name: &str,
    chunk_id: Value,
    workspace_id: Value,
    cancel: &CancellationToken,
) -> StepOutcome {
    let mut attempt = 0u32;
    let timeout = config.step_timeout;

    loop {
        if cancel.is_cancelled() {
            return StepOutcome::Cancelled;
        }

        let input = json!({ "chunk_id": chunk_id, "workspace_id": workspace_id });
        let child = match client
            .create_task(&CreateTaskRequest {
                name: step_name.to_string(),
                input,
                parent_id: Some(root_id),
                scheduled_start_at: None,
                idempotency_key: None,
            })
            .await
        {
            Ok(child) => child,
            Err(e) => {
                return StepOutcome::Failed {
                    message: format!("could not create chunk child task: {e}"),
                }
            }
        };

        match poll_until_terminal(client, child.id, timeout, config, cancel).await {
            PollOutcome::Completed(_) => return StepOutcome::Success,
            PollOutcome::Cancelled => {
                let _ = client
                    .update_task(child.id, &TaskPatch::failed("cancelled-by-orchestrator"))
                    .await;
                return StepOutcome::Cancelled;
            }
            PollOutcome::Failed(reason) => {
                attempt += 1;
                if attempt > config.step_retry_cap {
                    return StepOutcome::Failed {
                        message: format!("failed after {attempt} attempts: {reason}"),
                    };
                }
                sleep_with_backoff(attempt, config, cancel).await;
            }
            PollOutcome::TimedOut => {
                attempt += 1;
                if attempt > config.step_retry_cap {
                    return StepOutcome::Failed {
                        message: format!("failed after {attempt} attempts: step timeout"),
                    };
                }
                sleep_with_backoff(attempt, config, cancel).await;
            }
        }
    }
}

/// Poll a child task's status until it reaches a terminal state, the step
/// timeout elapses, or `cancel` fires. Cadence starts at
/// [`OrchestratorConfig::poll_interval`] and backs off (jittered) toward
/// [`OrchestratorConfig::poll_max_backoff`] after a few polls.
async fn poll_until_terminal(
    client: &BrokerClient,
    child_id: Uuid,
    timeout: Duration,
    config: &OrchestratorConfig,
    cancel: &CancellationToken,
) -> PollOutcome {
    let deadline = Instant::now() + timeout;
    let mut poll_count = 0u32;

    loop {
        if cancel.is_cancelled() {
            return PollOutcome::Cancelled;
        }
        if Instant::now() >= deadline {
            return PollOutcome::TimedOut;
        }

        match client.get_status(child_id).await {
            Ok(view) if view.status_code == TaskStatus::Completed.code() => {
                return PollOutcome::Completed(view.output.unwrap_or(Value::Null));
            }
            Ok(view) if view.status_code == TaskStatus::Failed.code() => {
                return PollOutcome::Failed(view.status);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(child_id = %child_id, error = %e, "transient poll error, retrying");
            }
        }

        poll_count += 1;
        let wait = if poll_count <= 5 {
            backoff::jitter(config.poll_interval, 0.1)
        } else {
            backoff::exponential(config.poll_interval, poll_count - 5, 4, config.poll_max_backoff)
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = cancel.cancelled() => return PollOutcome::Cancelled,
        }
    }
}

async fn sleep_with_backoff(attempt: u32, config: &OrchestratorConfig, cancel: &CancellationToken) {
    let delay = backoff::exponential(config.poll_interval, attempt, 4, config.poll_max_backoff * 4);
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = cancel.cancelled() => {}
    }
}
