//! Query functions over the in-memory consumer registry.

use chrono::Utc;

use crate::models::Consumer;
use crate::store::ConsumerStore;

/// Register or refresh a consumer for `topic` at `endpoint_url`. Replaces
/// any existing registration for the same `(topic, endpoint_url)` pair,
/// resetting its failure count and marking it ready.
pub async fn put_consumer(
    store: &ConsumerStore,
    topic: String,
    endpoint_url: String,
    health_url: Option<String>,
) -> Consumer {
    let consumer = Consumer::new(topic, endpoint_url, health_url);
    store.upsert(consumer.clone()).await;
    consumer
}

pub async fn remove_consumer(store: &ConsumerStore, topic: &str, endpoint_url: &str) -> bool {
    store.remove(topic, endpoint_url).await
}

pub async fn list_consumers(store: &ConsumerStore) -> Vec<Consumer> {
    store.list().await
}

/// Pick the next ready consumer for `topic`, round-robin across ready
/// registrations.
pub async fn pick_consumer(store: &ConsumerStore, topic: &str) -> Option<Consumer> {
    store.pick_ready(topic).await
}

/// Record a successful health probe: reset the failure count and mark
/// ready, stamping `last_seen_at`.
pub async fn record_health_success(
    store: &ConsumerStore,
    topic: &str,
    endpoint_url: &str,
) -> Option<Consumer> {
    store
        .with_consumer_mut(topic, endpoint_url, |c| {
            c.consecutive_failures = 0;
            c.ready = true;
            c.last_seen_at = Utc::now();
            c.clone()
        })
        .await
}

/// Record a failed health probe, flipping `ready` to false once
/// `consecutive_failures` reaches `threshold`.
pub async fn record_health_failure(
    store: &ConsumerStore,
    topic: &str,
    endpoint_url: &str,
    threshold: u32,
) -> Option<Consumer> {
    store
        .with_consumer_mut(topic, endpoint_url, |c| {
            c.consecutive_failures += 1;
            if c.consecutive_failures >= threshold {
                c.ready = false;
            }
            c.clone()
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_pick_roundtrip() {
        let store = ConsumerStore::new();
        put_consumer(&store, "chunk".into(), "http://worker/chunk".into(), None).await;
        let picked = pick_consumer(&store, "chunk").await.expect("should pick");
        assert_eq!(picked.endpoint_url, "http://worker/chunk");
        assert_eq!(picked.health_url, "http://worker/health");
    }

    #[tokio::test]
    async fn health_failure_threshold_flips_ready() {
        let store = ConsumerStore::new();
        put_consumer(&store, "chunk".into(), "http://worker/chunk".into(), None).await;

        record_health_failure(&store, "chunk", "http://worker/chunk", 3).await;
        record_health_failure(&store, "chunk", "http://worker/chunk", 3).await;
        assert!(pick_consumer(&store, "chunk").await.is_some());

        let after_third = record_health_failure(&store, "chunk", "http://worker/chunk", 3)
            .await
            .unwrap();
        assert!(!after_third.ready);
        assert!(pick_consumer(&store, "chunk").await.is_none());
    }

    #[tokio::test]
    async fn health_success_resets_failures() {
        let store = ConsumerStore::new();
        put_consumer(&store, "chunk".into(), "http://worker/chunk".into(), None).await;
        record_health_failure(&store, "chunk", "http://worker/chunk", 3).await;
        record_health_failure(&store, "chunk", "http://worker/chunk", 3).await;

        let healed = record_health_success(&store, "chunk", "http://worker/chunk")
            .await
            .unwrap();
        assert_eq!(healed.consecutive_failures, 0);
        assert!(healed.ready);
    }

    #[tokio::test]
    async fn remove_unregisters_consumer() {
        let store = ConsumerStore::new();
        put_consumer(&store, "chunk".into(), "http://worker/chunk".into(), None).await;
        assert!(remove_consumer(&store, "chunk", "http://worker/chunk").await);
        assert_eq!(list_consumers(&store).await.len(), 0);
    }
}
