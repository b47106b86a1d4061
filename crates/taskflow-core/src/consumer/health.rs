//! Background health-probe loop: periodically GETs each consumer's
//! `health_url`, flips `ready` off after consecutive failures, flips it
//! back on on a single success.

use std::sync::Arc;
use std::time::Duration;

use taskflow_db::queries::consumers as db;
use taskflow_db::store::ConsumerStore;
use tokio_util::sync::CancellationToken;

/// Run the probe loop until `cancel` fires.
pub async fn run(
    store: Arc<ConsumerStore>,
    http: reqwest::Client,
    interval: Duration,
    failure_threshold: u32,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => {
                tracing::info!("health probe loop stopping");
                return;
            }
        }

        let consumers = db::list_consumers(&store).await;
        for consumer in consumers {
            let outcome = probe_once(&http, &consumer.health_url).await;
            match outcome {
                Ok(()) => {
                    db::record_health_success(&store, &consumer.topic, &consumer.endpoint_url)
                        .await;
                }
                Err(e) => {
                    let updated = db::record_health_failure(
                        &store,
                        &consumer.topic,
                        &consumer.endpoint_url,
                        failure_threshold,
                    )
                    .await;
                    if let Some(c) = updated {
                        if !c.ready {
                            tracing::warn!(
                                topic = %c.topic,
                                endpoint = %c.endpoint_url,
                                consecutive_failures = c.consecutive_failures,
                                error = %e,
                                "consumer marked not ready after repeated health-probe failures"
                            );
                        }
                    }
                }
            }
        }
    }
}

async fn probe_once(http: &reqwest::Client, health_url: &str) -> Result<(), String> {
    let response = http
        .get(health_url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .map_err(|e| e.to_string())?;

    if response.status().is_success() {
        Ok(())
    } else {
        Err(format!("health probe returned {}", response.status()))
    }
}
