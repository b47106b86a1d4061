//! Consumer registry: validated registration on top of
//! [`taskflow_db::store::ConsumerStore`], plus the health-probe loop that
//! keeps `ready` accurate.

pub mod health;

use anyhow::{bail, Result};

use taskflow_db::models::Consumer;
use taskflow_db::queries::consumers as db;
use taskflow_db::store::ConsumerStore;

/// Register (or refresh) a consumer. Rejects an empty `topic` or
/// `endpoint_url` as a validation error.
pub async fn register(
    store: &ConsumerStore,
    topic: String,
    endpoint_url: String,
    health_url: Option<String>,
) -> Result<Consumer> {
    if topic.trim().is_empty() {
        bail!("validation: consumer topic must not be empty");
    }
    if endpoint_url.trim().is_empty() {
        bail!("validation: consumer endpoint_url must not be empty");
    }
    Ok(db::put_consumer(store, topic, endpoint_url, health_url).await)
}

/// Deregister a consumer. Returns `true` if a row was removed.
pub async fn deregister(store: &ConsumerStore, topic: &str, endpoint_url: &str) -> bool {
    db::remove_consumer(store, topic, endpoint_url).await
}

pub async fn list(store: &ConsumerStore) -> Vec<Consumer> {
    db::list_consumers(store).await
}

/// Select the next ready consumer for `topic`, round-robin.
pub async fn select(store: &ConsumerStore, topic: &str) -> Option<Consumer> {
    db::pick_consumer(store, topic).await
}
