//! Event bus boundary.
//!
//! Commit events and DLQ lifecycle events are published through this trait.
//! The in-memory bus captures events for tests and cold starts; a broker
//! adapter (NATS and friends) implements the same contract.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
}

/// A published event as seen by the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedEvent {
    pub topic: String,
    pub headers: HashMap<String, String>,
    pub payload: Value,
}

#[async_trait]
pub trait EventBus: Send + Sync + std::fmt::Debug {
    async fn publish(
        &self,
        topic: &str,
        headers: HashMap<String, String>,
        payload: Value,
    ) -> Result<(), BusError>;
}

/// In-memory bus recording every published event.
#[derive(Debug, Default)]
pub struct MemoryBus {
    events: RwLock<Vec<PublishedEvent>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<PublishedEvent> {
        self.events.read().await.clone()
    }

    pub async fn events_for(&self, topic: &str) -> Vec<PublishedEvent> {
        self.events.read().await.iter().filter(|e| e.topic == topic).cloned().collect()
    }

    pub async fn clear(&self) {
        self.events.write().await.clear();
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(
        &self,
        topic: &str,
        headers: HashMap<String, String>,
        payload: Value,
    ) -> Result<(), BusError> {
        tracing::debug!(topic, "event published");
        self.events.write().await.push(PublishedEvent {
            topic: topic.to_string(),
            headers,
            payload,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn records_published_events() {
        let bus = MemoryBus::new();
        bus.publish("terminus.commit.dev.payments", HashMap::new(), json!({"n": 1}))
            .await
            .unwrap();
        bus.publish("dlq.orders.poison", HashMap::new(), json!({"n": 2})).await.unwrap();

        assert_eq!(bus.events().await.len(), 2);
        let commit = bus.events_for("terminus.commit.dev.payments").await;
        assert_eq!(commit.len(), 1);
        assert_eq!(commit[0].payload["n"], 1);
    }

    #[tokio::test]
    async fn clear_empties_the_log() {
        let bus = MemoryBus::new();
        bus.publish("t", HashMap::new(), json!({})).await.unwrap();
        bus.clear().await;
        assert!(bus.events().await.is_empty());
    }
}
