//! RPC peer engine
//!
//! Bidirectional call/reply/notify over any transport that can carry an
//! `RpcEnvelope`. Replies are correlated by envelope id only, so the
//! transport underneath may change between a call and its reply.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Result, RpcError, TetherError};
use crate::id::{generate_auth_token, generate_id};
use crate::protocol::{PeerMethod, PeerRpcRequest, RpcEnvelope};

// ─────────────────────────────────────────────────────────────────────────────
// Seams
// ─────────────────────────────────────────────────────────────────────────────

/// Outbound side of an RPC peer
#[async_trait]
pub trait RpcSink: Send + Sync {
    /// Hands one envelope to whichever transport is live
    async fn send_envelope(&self, envelope: RpcEnvelope) -> Result<()>;
}

/// Typed handler for inbound peer calls
///
/// `C` is the caller context handed to every invocation.
#[async_trait]
pub trait RpcHandler<C: Sync + ?Sized>: Send + Sync {
    async fn handle(
        &self,
        ctx: &C,
        method: PeerMethod,
        params: Vec<Value>,
    ) -> std::result::Result<Value, RpcError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Pending Calls
// ─────────────────────────────────────────────────────────────────────────────

/// Tracks outbound calls awaiting replies
#[derive(Clone, Default)]
pub struct PendingCalls {
    calls: Arc<DashMap<String, oneshot::Sender<RpcEnvelope>>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending call
    /// Returns a receiver that will receive the reply
    pub fn register(&self, id: &str) -> oneshot::Receiver<RpcEnvelope> {
        let (tx, rx) = oneshot::channel();
        self.calls.insert(id.to_string(), tx);
        rx
    }

    /// Deliver a reply
    /// Returns true only for the first reply to a still-pending id
    pub fn resolve(&self, id: &str, reply: RpcEnvelope) -> bool {
        match self.calls.remove(id) {
            Some((_, tx)) => tx.send(reply).is_ok(),
            None => {
                debug!("Dropping late or unknown reply {}", id);
                false
            }
        }
    }

    /// Forget a pending call (timeout or send failure)
    pub fn cancel(&self, id: &str) {
        if self.calls.remove(id).is_some() {
            debug!("Cancelled pending call {}", id);
        }
    }

    pub fn count(&self) -> usize {
        self.calls.len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Auth Gate
// ─────────────────────────────────────────────────────────────────────────────

/// Where an inbound packet came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Published on the broker by the remote host
    Broker,
    /// Forwarded by the broker's HTTP front-end
    Server,
    /// Received on an open data channel
    DataChannel,
}

impl Origin {
    /// Only broker-authenticated paths may establish a token
    fn can_pin(&self) -> bool {
        matches!(self, Origin::Broker | Origin::Server)
    }
}

/// Per-peer token bookkeeping
///
/// `my_auth` is issued by this process and presented on every outbound
/// packet. The remote host's token is pinned on its first authenticated
/// contact and every later inbound call must present the same token.
#[derive(Debug)]
pub struct AuthGate {
    my_auth: String,
    remote: Mutex<Option<String>>,
}

impl AuthGate {
    pub fn new() -> Self {
        Self::with_token(generate_auth_token())
    }

    pub fn with_token(my_auth: impl Into<String>) -> Self {
        Self {
            my_auth: my_auth.into(),
            remote: Mutex::new(None),
        }
    }

    pub fn my_auth(&self) -> &str {
        &self.my_auth
    }

    pub fn remote_token(&self) -> Option<String> {
        self.remote.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Checks a presented token before any handler runs
    pub fn verify(&self, presented: Option<&str>, origin: Origin) -> std::result::Result<(), RpcError> {
        let presented = match presented {
            Some(token) if !token.is_empty() => token,
            _ => return Err(RpcError::unauthorized("missing auth token")),
        };

        let mut remote = self.remote.lock().unwrap_or_else(PoisonError::into_inner);
        match remote.as_deref() {
            Some(pinned) if pinned == presented => Ok(()),
            Some(_) => Err(RpcError::unauthorized("auth token mismatch")),
            None if origin.can_pin() => {
                *remote = Some(presented.to_string());
                Ok(())
            }
            None => Err(RpcError::unauthorized("no authenticated contact yet")),
        }
    }
}

impl Default for AuthGate {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

/// Call/notify/dispatch engine for one remote host
pub struct RpcEngine {
    host: String,
    pending: PendingCalls,
    timeout: Duration,
}

impl RpcEngine {
    pub fn new(host: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            pending: PendingCalls::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn pending(&self) -> &PendingCalls {
        &self.pending
    }

    /// Calls a remote method and waits for its reply
    pub async fn call<S: RpcSink + ?Sized>(
        &self,
        sink: &S,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Value> {
        self.call_with_timeout(sink, method, params, self.timeout).await
    }

    pub async fn call_with_timeout<S: RpcSink + ?Sized>(
        &self,
        sink: &S,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let id = generate_id();
        let rx = self.pending.register(&id);
        debug!("→ {} call {} ({})", self.host, method, id);

        let exchange = async {
            sink.send_envelope(RpcEnvelope::request(id.clone(), method, params)).await?;
            rx.await
                .map_err(|_| TetherError::PeerNotConnected(self.host.clone()))
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(reply)) => reply.into_outcome().map_err(TetherError::Rpc),
            Ok(Err(e)) => {
                self.pending.cancel(&id);
                Err(e)
            }
            Err(_) => {
                self.pending.cancel(&id);
                warn!("RPC {} to {} timed out", method, self.host);
                Err(TetherError::Timeout {
                    method: method.to_string(),
                })
            }
        }
    }

    /// Sends a notification, no reply expected
    pub async fn notify<S: RpcSink + ?Sized>(
        &self,
        sink: &S,
        method: &str,
        params: Vec<Value>,
    ) -> Result<()> {
        debug!("→ {} notify {}", self.host, method);
        sink.send_envelope(RpcEnvelope::notification(method, params)).await
    }

    /// Routes a reply to its waiting call
    pub fn receive_reply(&self, reply: RpcEnvelope) -> bool {
        match reply.id.clone() {
            Some(id) => self.pending.resolve(&id, reply),
            None => false,
        }
    }

    /// Processes one inbound packet
    ///
    /// Replies resolve pending calls. Requests and notifications are checked
    /// against the auth gate first and only then dispatched. Returns the
    /// reply envelope to send back, if any.
    pub async fn handle_packet<C, H>(
        &self,
        gate: &AuthGate,
        origin: Origin,
        packet: PeerRpcRequest,
        handler: &H,
        ctx: &C,
    ) -> Option<RpcEnvelope>
    where
        C: Sync + ?Sized,
        H: RpcHandler<C> + ?Sized,
    {
        let envelope = packet.msg;

        if envelope.is_reply() {
            self.receive_reply(envelope);
            return None;
        }

        if let Err(err) = gate.verify(packet.my_auth.as_deref(), origin) {
            warn!(
                "Rejecting {} from {}: {}",
                envelope.method.as_deref().unwrap_or("?"),
                self.host,
                err.message
            );
            return envelope.id.map(|id| RpcEnvelope::error_reply(id, err));
        }

        dispatch(handler, ctx, envelope).await
    }
}

/// Runs one request or notification against a typed handler
///
/// Unknown methods become `-32601`; handler failures become `{code, message}`.
/// Notifications never produce a reply.
pub async fn dispatch<C, H>(handler: &H, ctx: &C, envelope: RpcEnvelope) -> Option<RpcEnvelope>
where
    C: Sync + ?Sized,
    H: RpcHandler<C> + ?Sized,
{
    let RpcEnvelope {
        id, method, params, ..
    } = envelope;
    let name = method?;

    let method = match name.parse::<PeerMethod>() {
        Ok(method) => method,
        Err(_) => {
            warn!("Unknown peer method {}", name);
            return id.map(|id| RpcEnvelope::error_reply(id, RpcError::method_not_found(&name)));
        }
    };

    let outcome = handler.handle(ctx, method, params).await;
    match (id, outcome) {
        (Some(id), Ok(result)) => Some(RpcEnvelope::reply(id, result)),
        (Some(id), Err(err)) => Some(RpcEnvelope::error_reply(id, err)),
        (None, Err(err)) => {
            debug!("Notification {} failed: {}", name, err);
            None
        }
        (None, Ok(_)) => None,
    }
}
