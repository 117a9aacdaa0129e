//! In-process broker
//!
//! `MemoryHub` routes publications between every `MemoryBroker` connected
//! to it. Delivery uses unbounded channels, so per-topic order from a single
//! publisher is preserved.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

use super::broker::{Broker, BrokerMessage, topic_matches};
use crate::error::{Result, TetherError};

struct Subscription {
    client: u64,
    filter: String,
    tx: mpsc::UnboundedSender<BrokerMessage>,
}

#[derive(Default)]
struct HubInner {
    subscriptions: Mutex<Vec<Subscription>>,
    next_client: AtomicU64,
}

/// Shared in-memory broker
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new client connection to the hub
    pub fn connect(&self, username: impl Into<String>) -> MemoryBroker {
        let client = self.inner.next_client.fetch_add(1, Ordering::Relaxed);
        MemoryBroker {
            hub: self.clone(),
            client,
            username: username.into(),
            connected: AtomicBool::new(true),
        }
    }

    fn subscriptions(&self) -> std::sync::MutexGuard<'_, Vec<Subscription>> {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn route(&self, topic: &str, payload: Bytes) -> usize {
        let mut subs = self.subscriptions();
        subs.retain(|s| !s.tx.is_closed());

        let mut delivered = 0;
        for sub in subs.iter().filter(|s| topic_matches(&s.filter, topic)) {
            let message = BrokerMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            if sub.tx.send(message).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    fn has_subscriber(&self, topic: &str) -> bool {
        self.subscriptions()
            .iter()
            .any(|s| !s.tx.is_closed() && topic_matches(&s.filter, topic))
    }

    fn drop_client(&self, client: u64) {
        self.subscriptions().retain(|s| s.client != client);
    }
}

/// One client's connection to a `MemoryHub`
pub struct MemoryBroker {
    hub: MemoryHub,
    client: u64,
    username: String,
    connected: AtomicBool,
}

impl MemoryBroker {
    pub fn username(&self) -> &str {
        &self.username
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(TetherError::BrokerDisconnected);
        }
        let delivered = self.hub.route(topic, payload);
        debug!("{} published {} to {} subscribers", self.username, topic, delivered);
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<mpsc::UnboundedReceiver<BrokerMessage>> {
        if !self.is_connected() {
            return Err(TetherError::BrokerDisconnected);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub.subscriptions().push(Subscription {
            client: self.client,
            filter: filter.to_string(),
            tx,
        });
        Ok(rx)
    }

    fn has_route(&self, topic: &str) -> bool {
        self.is_connected() && self.hub.has_subscriber(topic)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!("{} disconnected from broker", self.username);
            self.hub.drop_client(self.client);
        }
    }
}

impl Drop for MemoryBroker {
    fn drop(&mut self) {
        self.hub.drop_client(self.client);
    }
}
