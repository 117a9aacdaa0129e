//! Broker relay transport
//!
//! Carries one peer's traffic over `msg/<toHost>/<fromHost>/...` topics and
//! falls back to the authenticated HTTP endpoint when nothing on the broker
//! is listening for this direction.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use super::broker::Broker;
use super::http::HttpFallback;
use crate::error::Result;
use crate::protocol::{Action, PeerRpcRequest, RpcEnvelope, Topic};

pub struct RelayTransport {
    broker: Arc<dyn Broker>,
    http: HttpFallback,
    my_host: String,
    remote_host: String,
    endpoint: Mutex<String>,
    push_live: AtomicBool,
}

impl RelayTransport {
    pub fn new(
        broker: Arc<dyn Broker>,
        http: HttpFallback,
        my_host: impl Into<String>,
        remote_host: impl Into<String>,
    ) -> Self {
        let remote_host = remote_host.into();
        Self {
            broker,
            http,
            my_host: my_host.into(),
            endpoint: Mutex::new(remote_host.clone()),
            remote_host,
            push_live: AtomicBool::new(false),
        }
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    /// Where the HTTP fallback posts; the remote host name unless overridden
    pub fn endpoint(&self) -> String {
        self.endpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Points the HTTP fallback at a configured `host:port` or url
    pub fn set_endpoint(&self, endpoint: &str) {
        let mut current = self.endpoint.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != endpoint {
            debug!("HTTP fallback for {} now {}", self.remote_host, endpoint);
            *current = endpoint.to_string();
        }
    }

    /// Records that the remote host reached us over the broker
    pub fn mark_push_live(&self) {
        if !self.push_live.swap(true, Ordering::SeqCst) {
            debug!("Push path to {} is live", self.remote_host);
        }
    }

    /// True when a broker publication will reach the remote host
    pub fn has_push_path(&self) -> bool {
        if !self.broker.is_connected() {
            return false;
        }
        self.push_live.load(Ordering::SeqCst)
            || self.broker.has_route(&self.topic(Action::Rpc).to_string())
    }

    fn topic(&self, action: Action) -> Topic {
        Topic::msg(&self.remote_host, &self.my_host, action)
    }

    /// Sends an RPC packet over the broker, or over HTTP without a push path
    ///
    /// Returns the reply envelope when the HTTP path produced one.
    pub async fn send_packet(&self, packet: &PeerRpcRequest) -> Result<Option<RpcEnvelope>> {
        if self.has_push_path() {
            let topic = self.topic(Action::Rpc).to_string();
            self.broker.publish(&topic, Bytes::from(packet.to_json()?)).await?;
            return Ok(None);
        }
        self.http.post_rpc_to(&self.endpoint(), packet).await
    }

    /// Publishes raw socket bytes tagged with the socket id
    pub async fn publish_socket_data(&self, action: Action, socket_id: &str, data: Bytes) -> Result<()> {
        let topic = Topic::msg_sub(&self.remote_host, &self.my_host, action, socket_id).to_string();
        self.broker.publish(&topic, data).await
    }

    /// Publishes an application JSON message
    pub async fn publish_json(&self, payload: Bytes) -> Result<()> {
        let topic = self.topic(Action::Json).to_string();
        self.broker.publish(&topic, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryHub;
    use serde_json::json;
    use std::time::Duration;

    fn http() -> HttpFallback {
        HttpFallback::new("http", "_hs", Duration::from_millis(200)).unwrap()
    }

    #[tokio::test]
    async fn test_publishes_when_remote_subscribed() {
        let hub = MemoryHub::new();
        let alice: Arc<dyn Broker> = Arc::new(hub.connect("alice"));
        let bob = hub.connect("bob");
        let mut rx = bob.subscribe("msg/bob/#").await.unwrap();

        let relay = RelayTransport::new(alice, http(), "alice", "bob");
        assert!(relay.has_push_path());

        let packet = PeerRpcRequest {
            msg: RpcEnvelope::request("1", "ping", vec![json!("hi")]),
            my_auth: Some("t".into()),
            to_host: "bob".into(),
            from_host: "alice".into(),
        };
        assert!(relay.send_packet(&packet).await.unwrap().is_none());

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "msg/bob/alice/rpc");
        assert_eq!(PeerRpcRequest::from_json(&msg.payload).unwrap(), packet);
    }

    #[tokio::test]
    async fn test_push_live_after_inbound_traffic() {
        let hub = MemoryHub::new();
        let alice: Arc<dyn Broker> = Arc::new(hub.connect("alice"));
        let relay = RelayTransport::new(alice.clone(), http(), "alice", "bob");

        assert!(!relay.has_push_path());
        relay.mark_push_live();
        assert!(relay.has_push_path());

        alice.disconnect().await;
        assert!(!relay.has_push_path());
    }

    #[tokio::test]
    async fn test_socket_data_topic() {
        let hub = MemoryHub::new();
        let alice: Arc<dyn Broker> = Arc::new(hub.connect("alice"));
        let bob = hub.connect("bob");
        let mut rx = bob.subscribe("msg/bob/#").await.unwrap();

        let relay = RelayTransport::new(alice, http(), "alice", "bob");
        relay
            .publish_socket_data(Action::SocketData, "s1", Bytes::from_static(b"\x00\xff"))
            .await
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "msg/bob/alice/socketData/s1");
        assert_eq!(msg.payload.as_ref(), b"\x00\xff");
    }
}
