//! Peer
//!
//! One remote host as seen from this client: the auth gate for its calls,
//! the relay transport, the data-channel negotiator and the RPC engine.
//! Outbound envelopes ride the data channel while it is open and the
//! relay otherwise; negotiation signals always go over the relay.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tether_core::protocol::{CloseSocketParams, SocketDataParams};
use tether_core::transport::RelayTransport;
use tether_core::{
    Action, AuthGate, ChannelEvent, DataChannelTransport, Frame, NegotiationState, Negotiator,
    NegotiatorConfig, Origin, PeerMethod, PeerRpcRequest, Result, RpcEngine, RpcEnvelope, RpcSink,
    Signal, SignalSink, TetherError, TransportState,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::{ClientContext, ClientEvent};
use crate::socket_map::SocketSide;

/// How a socket session forwards its local bytes
///
/// Fixed when the session starts so one direction of a socket never
/// switches transports mid-stream.
#[derive(Clone)]
pub enum SocketRoute {
    Channel(DataChannelTransport),
    Relay,
}

impl SocketRoute {
    pub fn name(&self) -> &'static str {
        match self {
            SocketRoute::Channel(_) => "data channel",
            SocketRoute::Relay => "relay",
        }
    }
}

pub struct Peer {
    host_name: String,
    my_host: String,
    auth: AuthGate,
    relay: RelayTransport,
    negotiator: Negotiator,
    engine: RpcEngine,
    use_rtc: bool,
    negotiation_timeout: Duration,
    temporary: AtomicBool,
    closed: AtomicBool,
    last_active: Mutex<Instant>,
}

impl Peer {
    pub(crate) fn new(
        ctx: &ClientContext,
        host_name: &str,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer = Arc::new_cyclic(|weak: &Weak<Peer>| {
            let signals: Arc<dyn SignalSink> = Arc::new(PeerSignals(weak.clone()));
            let negotiator = Negotiator::new(
                host_name,
                ctx.connector.clone(),
                signals,
                NegotiatorConfig::from(&ctx.config),
                events_tx,
            );
            Peer {
                host_name: host_name.to_string(),
                my_host: ctx.my_host.clone(),
                auth: AuthGate::new(),
                relay: RelayTransport::new(
                    ctx.broker.clone(),
                    ctx.http.clone(),
                    ctx.my_host.clone(),
                    host_name,
                ),
                negotiator,
                engine: RpcEngine::new(host_name, ctx.config.rpc_timeout()),
                use_rtc: ctx.config.use_rtc,
                negotiation_timeout: ctx.config.negotiation_timeout(),
                temporary: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                last_active: Mutex::new(Instant::now()),
            }
        });
        (peer, events_rx)
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn auth(&self) -> &AuthGate {
        &self.auth
    }

    pub fn relay(&self) -> &RelayTransport {
        &self.relay
    }

    pub fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    pub fn rtc_state(&self) -> NegotiationState {
        self.negotiator.state()
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_temporary(&self) {
        self.temporary.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn touch(&self) {
        *self.last_active.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the last inbound or outbound traffic
    pub fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// The transport outbound envelopes take right now
    pub fn transport(&self) -> TransportState {
        if self.is_closed() {
            return TransportState::NotConnected;
        }
        match self.negotiator.channel() {
            Some(channel) => TransportState::DataChannel(channel),
            None => TransportState::RelayOnly,
        }
    }

    pub fn socket_route(&self) -> SocketRoute {
        match self.negotiator.channel() {
            Some(channel) => SocketRoute::Channel(channel),
            None => SocketRoute::Relay,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Calls
    // ─────────────────────────────────────────────────────────────────────

    /// Calls a method on the remote host and waits for its reply
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        self.touch();
        self.engine.call(self, method, params).await
    }

    /// Sends a notification, no reply expected
    pub async fn notify(&self, method: &str, params: Vec<Value>) -> Result<()> {
        self.touch();
        self.engine.notify(self, method, params).await
    }

    /// Round-trips the remote `ping` method
    pub async fn ping(&self, greeting: &str) -> Result<String> {
        let reply = self
            .call(PeerMethod::Ping.as_str(), vec![json!(greeting)])
            .await?;
        Ok(reply.as_str().unwrap_or_default().to_string())
    }

    /// Negotiates a data channel and waits for it to open
    ///
    /// Fails when data channels are disabled, the negotiation fails or it
    /// does not settle within the negotiation timeout. A negotiation that
    /// times out is abandoned so the next call offers again. Callers fall
    /// back to the relay.
    pub async fn connect_rtc(&self) -> Result<()> {
        if !self.use_rtc {
            return Err(TetherError::Negotiation("data channels disabled".into()));
        }
        if self.is_closed() {
            return Err(TetherError::PeerNotConnected(self.host_name.clone()));
        }
        self.negotiator.start_offer().await?;
        match self.negotiator.wait_settled(self.negotiation_timeout).await {
            NegotiationState::Connected => Ok(()),
            NegotiationState::Connecting => {
                self.negotiator.abandon().await;
                Err(TetherError::Negotiation(format!(
                    "data channel to {} timed out after {:?}",
                    self.host_name, self.negotiation_timeout
                )))
            }
            state => Err(TetherError::Negotiation(format!(
                "data channel to {} {}",
                self.host_name, state
            ))),
        }
    }

    /// Sends an application JSON object over the open data channel
    pub async fn send_json(&self, message: &Value) -> Result<()> {
        if !message.is_object() {
            return Err(TetherError::InvalidParams(
                "json messages must be objects".into(),
            ));
        }
        let channel = self
            .negotiator
            .channel()
            .ok_or_else(|| TetherError::PeerNotConnected(self.host_name.clone()))?;
        self.touch();
        channel.send_json(serde_json::to_vec(message)?).await
    }

    /// Publishes an application JSON object on the broker
    pub async fn publish_json(&self, message: &Value) -> Result<()> {
        if !message.is_object() {
            return Err(TetherError::InvalidParams(
                "json messages must be objects".into(),
            ));
        }
        self.touch();
        self.relay
            .publish_json(Bytes::from(serde_json::to_vec(message)?))
            .await
    }

    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Closing peer {}", self.host_name);
            self.negotiator.close().await;
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sockets
    // ─────────────────────────────────────────────────────────────────────

    pub(crate) async fn send_socket_data(
        &self,
        route: &SocketRoute,
        side: SocketSide,
        socket_id: &str,
        data: Bytes,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(TetherError::PeerNotConnected(self.host_name.clone()));
        }
        self.touch();
        match route {
            SocketRoute::Channel(channel) => channel.send_socket_data(socket_id, &data).await,
            SocketRoute::Relay if self.relay.has_push_path() => {
                let action = match side {
                    SocketSide::Listener => Action::SocketData,
                    SocketSide::Relay => Action::RelayData,
                };
                self.relay.publish_socket_data(action, socket_id, data).await
            }
            SocketRoute::Relay => {
                let method = match side {
                    SocketSide::Listener => PeerMethod::ReceiveListenerData,
                    SocketSide::Relay => PeerMethod::ReceiveRelayData,
                };
                let params = SocketDataParams {
                    socket_id: socket_id.to_string(),
                    data: BASE64.encode(&data),
                };
                self.call(method.as_str(), vec![serde_json::to_value(params)?])
                    .await
                    .map(|_| ())
            }
        }
    }

    /// Tells the remote side that our end of a socket is gone
    pub(crate) async fn notify_socket_closed(&self, side: SocketSide, socket_id: &str) -> Result<()> {
        let method = match side {
            SocketSide::Listener => PeerMethod::CloseRelaySocket,
            SocketSide::Relay => PeerMethod::CloseListenerSocket,
        };
        let params = CloseSocketParams {
            socket_id: socket_id.to_string(),
        };
        self.notify(method.as_str(), vec![serde_json::to_value(params)?])
            .await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Inbound
    // ─────────────────────────────────────────────────────────────────────

    /// Runs one inbound packet through the auth gate and the method table
    pub(crate) async fn receive_packet(
        self: &Arc<Self>,
        ctx: &Arc<ClientContext>,
        origin: Origin,
        packet: PeerRpcRequest,
    ) -> Option<RpcEnvelope> {
        self.touch();
        let call = crate::methods::CallContext {
            peer: self.clone(),
            client: ctx.clone(),
        };
        self.engine
            .handle_packet(&self.auth, origin, packet, &ctx.methods, &call)
            .await
    }

    pub(crate) async fn send_reply(&self, reply: RpcEnvelope) {
        let id = reply.id.clone().unwrap_or_default();
        if let Err(e) = self.send_envelope(reply).await {
            warn!("Failed to reply {} to {}: {}", id, self.host_name, e);
        }
    }

    async fn handle_frame(self: &Arc<Self>, ctx: &Arc<ClientContext>, data: Bytes) {
        self.touch();
        match Frame::from_bytes(&data) {
            Ok(Frame::Rpc(bytes)) => match PeerRpcRequest::from_json(&bytes) {
                Ok(packet) => deliver(ctx.clone(), self.clone(), Origin::DataChannel, packet).await,
                Err(e) => warn!("Malformed rpc frame from {}: {}", self.host_name, e),
            },
            Ok(Frame::SocketData { socket_id, data }) => {
                ctx.sockets
                    .write(&self.host_name, &socket_id, Bytes::from(data))
                    .await;
            }
            Ok(Frame::Json(bytes)) => ctx.emit_json(&self.host_name, &bytes),
            Ok(Frame::Ping) => debug!("Data channel to {} warmed up", self.host_name),
            Err(e) => warn!("Dropping malformed frame from {}: {}", self.host_name, e),
        }
    }
}

#[async_trait]
impl RpcSink for Peer {
    async fn send_envelope(&self, envelope: RpcEnvelope) -> Result<()> {
        let signaling = envelope.method.as_deref() == Some(PeerMethod::RtcSignal.as_str());
        let packet = PeerRpcRequest {
            msg: envelope,
            my_auth: Some(self.auth.my_auth().to_string()),
            to_host: self.host_name.clone(),
            from_host: self.my_host.clone(),
        };

        match self.transport() {
            TransportState::NotConnected => Err(TetherError::PeerNotConnected(self.host_name.clone())),
            TransportState::DataChannel(channel) if !signaling => channel.send_packet(&packet).await,
            _ => {
                if let Some(reply) = self.relay.send_packet(&packet).await? {
                    self.engine.receive_reply(reply);
                }
                Ok(())
            }
        }
    }
}

/// Sends negotiation signals through the owning peer's `rtcSignal` call
struct PeerSignals(Weak<Peer>);

#[async_trait]
impl SignalSink for PeerSignals {
    async fn send_signal(&self, signal: Signal) -> Result<()> {
        let peer = self
            .0
            .upgrade()
            .ok_or_else(|| TetherError::PeerNotConnected("peer dropped".into()))?;
        peer.call(PeerMethod::RtcSignal.as_str(), vec![serde_json::to_value(signal)?])
            .await
            .map(|_| ())
    }
}

/// Hands one inbound packet to its peer
///
/// Replies and negotiation signals are applied in arrival order; every
/// other call runs on its own task so a slow handler never stalls the
/// inbound stream.
pub(crate) async fn deliver(
    ctx: Arc<ClientContext>,
    peer: Arc<Peer>,
    origin: Origin,
    packet: PeerRpcRequest,
) {
    let inline = packet.msg.is_reply()
        || packet.msg.method.as_deref() == Some(PeerMethod::RtcSignal.as_str());

    if inline {
        if let Some(reply) = peer.receive_packet(&ctx, origin, packet).await {
            tokio::spawn(async move { peer.send_reply(reply).await });
        }
        return;
    }

    tokio::spawn(async move {
        if let Some(reply) = peer.receive_packet(&ctx, origin, packet).await {
            peer.send_reply(reply).await;
        }
    });
}

/// Consumes a peer's data-channel events
///
/// When a channel that had been open goes away, every socket of that peer
/// is closed.
pub(crate) async fn run_channel_events(
    ctx: Weak<ClientContext>,
    peer: Weak<Peer>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    let mut had_channel = false;
    while let Some(event) = events.recv().await {
        let (Some(ctx), Some(peer)) = (ctx.upgrade(), peer.upgrade()) else {
            break;
        };

        match event {
            ChannelEvent::Opened(channel) => {
                had_channel = true;
                if let Err(e) = channel.ping().await {
                    debug!("Warm-up ping to {} failed: {}", peer.host_name(), e);
                }
                ctx.emit(ClientEvent::RtcStateChanged {
                    host: peer.host_name().to_string(),
                    state: NegotiationState::Connected,
                });
            }
            ChannelEvent::Message(data) => peer.handle_frame(&ctx, data).await,
            ChannelEvent::Terminal(state) => {
                ctx.emit(ClientEvent::RtcStateChanged {
                    host: peer.host_name().to_string(),
                    state,
                });
                if std::mem::take(&mut had_channel) {
                    let closed = ctx.sockets.close_host(peer.host_name(), true);
                    info!(
                        "Data channel to {} {}, closed {} sockets",
                        peer.host_name(),
                        state,
                        closed
                    );
                }
            }
        }
    }
}
