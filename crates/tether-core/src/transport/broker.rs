//! Broker abstraction
//!
//! The shared publish/subscribe broker that carries relay traffic and
//! negotiation signaling. A real MQTT binding implements `Broker`; the
//! in-process `MemoryHub` implements it for tests and single-process use.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;

/// One publication delivered to a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Publish/subscribe connection owned by one client
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publishes a payload; per-topic order from one publisher is preserved
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Subscribes to an MQTT-style filter (`+` one level, `#` the rest)
    async fn subscribe(&self, filter: &str) -> Result<mpsc::UnboundedReceiver<BrokerMessage>>;

    /// True when some subscriber currently receives publications on `topic`
    fn has_route(&self, topic: &str) -> bool;

    fn is_connected(&self) -> bool;

    async fn disconnect(&self);
}

/// MQTT topic filter matching
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
