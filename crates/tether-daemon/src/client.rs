//! Tunnel Client
//!
//! Top-level instance. Owns the broker connection, the peer registry, the
//! socket map and the listeners and relays, and dispatches everything that
//! arrives on `msg/<me>/#` and `web/<me>/#`.

use bytes::Bytes;
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tether_core::host::normalize_host;
use tether_core::protocol::{SocketListenerInfo, SocketRelayInfo};
use tether_core::{
    Action, Broker, BrokerMessage, HttpFallback, ListenerConfig, MqttBroker, NegotiationState,
    Origin, PeerRpcRequest, RelayConfig, Result, RtcConnector, TetherConfig, Topic,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::listener::{ListenerHandle, SocketListeners};
use crate::methods::PeerMethods;
use crate::peer::{Peer, deliver};
use crate::registry::PeerRegistry;
use crate::relay::SocketRelays;
use crate::server_rpc;
use crate::session::TunnelStats;
use crate::socket_map::{SocketInfo, SocketMap};
use crate::web::{WebHandler, WebRequest};

/// Events from the client to its owner
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Subscribed to the broker and serving
    Connected { host_name: String },

    /// A peer object was created for a remote host
    PeerCreated { host: String },

    /// An idle peer was dropped
    PeerEvicted { host: String },

    /// A peer's data channel changed state
    RtcStateChanged {
        host: String,
        state: NegotiationState,
    },

    /// Application JSON message from a remote host
    Json { from: String, msg: Value },

    /// Error occurred
    Error { message: String },

    /// Shutdown
    Shutdown,
}

/// State shared by the client, its peers and its background tasks
pub struct ClientContext {
    pub(crate) config: TetherConfig,
    pub(crate) my_host: String,
    /// Only this sender may issue `srpc` requests
    pub(crate) server_host: String,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) http: HttpFallback,
    pub(crate) connector: Arc<dyn RtcConnector>,
    pub(crate) peers: PeerRegistry,
    pub(crate) sockets: SocketMap,
    pub(crate) relays: SocketRelays,
    pub(crate) listeners: SocketListeners,
    pub(crate) methods: PeerMethods,
    pub(crate) stats: Arc<TunnelStats>,
    web: OnceLock<Arc<dyn WebHandler>>,
    events: mpsc::Sender<ClientEvent>,
}

impl ClientContext {
    pub fn host_name(&self) -> &str {
        &self.my_host
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        if let Err(e) = self.events.try_send(event) {
            debug!("Dropping client event: {}", e);
        }
    }

    pub(crate) fn emit_json(&self, from: &str, payload: &[u8]) {
        match serde_json::from_slice::<Value>(payload) {
            Ok(msg) if msg.is_object() => self.emit(ClientEvent::Json {
                from: from.to_string(),
                msg,
            }),
            Ok(_) => warn!("Dropping non-object json message from {}", from),
            Err(e) => warn!("Malformed json message from {}: {}", from, e),
        }
    }
}

/// Reverse-tunnel client
pub struct TunnelClient {
    ctx: Arc<ClientContext>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    running: bool,
}

impl TunnelClient {
    /// Create a new client; nothing is subscribed until `start`
    pub fn new(
        config: TetherConfig,
        broker: Arc<dyn Broker>,
        connector: Arc<dyn RtcConnector>,
    ) -> Result<Self> {
        config.validate()?;
        let my_host = normalize_host(&config.host_name);
        let server_host = normalize_host(&config.server_host);
        let http = HttpFallback::new(
            config.fallback_scheme.clone(),
            config.base_path.clone(),
            config.rpc_timeout(),
        )?;
        let (events, event_rx) = mpsc::channel(256);

        let ctx = Arc::new(ClientContext {
            config,
            my_host,
            server_host,
            broker,
            http,
            connector,
            peers: PeerRegistry::new(),
            sockets: SocketMap::new(),
            relays: SocketRelays::new(),
            listeners: SocketListeners::new(),
            methods: PeerMethods,
            stats: TunnelStats::new(),
            web: OnceLock::new(),
            events,
        });

        Ok(Self {
            ctx,
            event_rx: Some(event_rx),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            running: false,
        })
    }

    /// Connect to the MQTT broker at `broker_url` and build a client on it
    pub async fn connect(config: TetherConfig, connector: Arc<dyn RtcConnector>) -> Result<Self> {
        config.validate()?;
        let broker = MqttBroker::connect(&config).await?;
        Self::new(config, Arc::new(broker), connector)
    }

    /// Routes `web/<me>/#` traffic to `handler`
    pub fn with_web_handler(self, handler: Arc<dyn WebHandler>) -> Self {
        if self.ctx.web.set(handler).is_err() {
            warn!("Web handler already set");
        }
        self
    }

    pub fn host_name(&self) -> &str {
        &self.ctx.my_host
    }

    pub fn config(&self) -> &TetherConfig {
        &self.ctx.config
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Take the event receiver
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Subscribe to the broker, start configured relays and listeners and
    /// the background loops
    pub async fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        let ctx = self.ctx.clone();
        info!("Starting Tether client {}...", ctx.my_host);

        let inbox = ctx.broker.subscribe(&format!("msg/{}/#", ctx.my_host)).await?;
        let web = ctx.broker.subscribe(&format!("web/{}/#", ctx.my_host)).await?;

        for relay in ctx.config.relays.clone() {
            ctx.relays.add(relay);
        }
        for listener in ctx.config.listeners.clone() {
            let port = listener.port;
            if let Err(e) = ctx.listeners.add(&ctx, listener).await {
                error!("Failed to start listener on port {}: {}", port, e);
                ctx.emit(ClientEvent::Error {
                    message: format!("Failed to start listener on port {}: {}", port, e),
                });
            }
        }

        self.tasks
            .spawn(run_inbox(ctx.clone(), inbox, web, self.cancel.clone()));
        self.tasks
            .spawn(run_maintenance(ctx.clone(), self.cancel.clone()));

        self.running = true;
        ctx.emit(ClientEvent::Connected {
            host_name: ctx.my_host.clone(),
        });
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Peers
    // ─────────────────────────────────────────────────────────────────────

    /// The peer for `host`, created on first use
    pub fn get_peer(&self, host: &str) -> Result<Arc<Peer>> {
        self.ctx.peers.get_or_create(&self.ctx, host)
    }

    /// A peer that is evicted as soon as it holds no sockets
    pub fn get_temporary_peer(&self, host: &str) -> Result<Arc<Peer>> {
        self.ctx.peers.get_temporary(&self.ctx, host)
    }

    /// The existing peer for `host`, if any
    pub fn peer(&self, host: &str) -> Option<Arc<Peer>> {
        self.ctx.peers.get(host)
    }

    pub fn peer_hosts(&self) -> Vec<String> {
        self.ctx.peers.hosts()
    }

    /// Runs one eviction sweep now
    pub async fn evict_idle_peers(&self) -> Vec<String> {
        self.ctx
            .peers
            .evict_idle(&self.ctx, self.ctx.config.peer_idle_timeout())
            .await
    }

    /// Publishes an application JSON object to `host` over the broker
    pub async fn publish_json(&self, host: &str, message: &Value) -> Result<()> {
        self.get_peer(host)?.publish_json(message).await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Tunnels
    // ─────────────────────────────────────────────────────────────────────

    pub async fn add_socket_listener(&self, config: ListenerConfig) -> Result<ListenerHandle> {
        self.ctx.listeners.add(&self.ctx, config).await
    }

    pub fn add_socket_relay(&self, config: RelayConfig) -> SocketRelayInfo {
        self.ctx.relays.add(config)
    }

    pub fn remove_socket_relay(&self, port: u16) -> bool {
        self.ctx.relays.remove(port)
    }

    pub fn get_socket_listeners(&self) -> Vec<SocketListenerInfo> {
        self.ctx.listeners.list()
    }

    pub fn get_socket_relays(&self) -> Vec<SocketRelayInfo> {
        self.ctx.relays.list()
    }

    pub fn sockets(&self) -> Vec<SocketInfo> {
        self.ctx.sockets.list()
    }

    pub fn socket_count(&self) -> usize {
        self.ctx.sockets.len()
    }

    pub fn stats(&self) -> Arc<TunnelStats> {
        Arc::clone(&self.ctx.stats)
    }

    /// Stop everything and release the broker
    pub async fn shutdown(&mut self) {
        let ctx = self.ctx.clone();
        info!("Shutting down Tether client {}", ctx.my_host);
        self.cancel.cancel();
        ctx.listeners.end_all();

        // signal remote ends while the peers can still reach them
        let sockets = ctx.sockets.list();
        for socket in &sockets {
            ctx.sockets.close(&socket.socket_id, false);
        }
        for socket in sockets {
            if let Some(peer) = ctx.peers.get(&socket.host) {
                if let Err(e) = peer.notify_socket_closed(socket.side, &socket.socket_id).await {
                    debug!("Could not signal close of socket {}: {}", socket.socket_id, e);
                }
            }
        }

        ctx.peers.close_all().await;
        ctx.broker.disconnect().await;
        if let Some(web) = ctx.web.get() {
            web.end().await;
        }

        self.tasks.close();
        self.tasks.wait().await;
        self.running = false;
        ctx.emit(ClientEvent::Shutdown);
    }
}

impl Drop for TunnelClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.ctx.listeners.end_all();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound dispatch
// ─────────────────────────────────────────────────────────────────────────────

async fn run_inbox(
    ctx: Arc<ClientContext>,
    mut inbox: mpsc::UnboundedReceiver<BrokerMessage>,
    mut web: mpsc::UnboundedReceiver<BrokerMessage>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(message) = inbox.recv() => dispatch(&ctx, message).await,
            Some(message) = web.recv() => dispatch(&ctx, message).await,
            else => {
                warn!("Broker subscriptions for {} closed", ctx.my_host);
                ctx.emit(ClientEvent::Error {
                    message: "broker subscriptions closed".into(),
                });
                break;
            }
        }
    }
    debug!("Inbound loop for {} stopped", ctx.my_host);
}

async fn dispatch(ctx: &Arc<ClientContext>, message: BrokerMessage) {
    let topic = match Topic::parse(&message.topic) {
        Ok(topic) => topic,
        Err(e) => {
            warn!("Dropping broker message: {}", e);
            return;
        }
    };

    match topic {
        Topic::Msg {
            to,
            from,
            action,
            sub_id,
        } => {
            if normalize_host(&to) != ctx.my_host {
                debug!("Ignoring message addressed to {}", to);
                return;
            }
            let from = normalize_host(&from);
            match (action, sub_id) {
                (Action::Rpc, _) => handle_rpc(ctx, &from, &message.payload).await,
                (Action::Json, _) => ctx.emit_json(&from, &message.payload),
                (Action::Srpc, _) if from == ctx.server_host => {
                    tokio::spawn(server_rpc::handle(ctx.clone(), from, message.payload));
                }
                (Action::Srpc, _) => {
                    warn!("Dropping srpc from {}: not the server", from);
                }
                (Action::SocketData | Action::RelayData, Some(socket_id)) => {
                    ctx.sockets.write(&from, &socket_id, message.payload).await;
                }
                (Action::SocketClose, Some(socket_id)) => {
                    ctx.sockets.close_from(&from, &socket_id);
                }
                (action, None) => {
                    warn!("{} from {} without socket id", action.as_str(), from);
                }
            }
        }
        Topic::Web {
            host,
            socket_id,
            action,
        } => match ctx.web.get() {
            Some(handler) => {
                handler
                    .handle_request(WebRequest {
                        host,
                        socket_id,
                        action,
                        payload: message.payload,
                    })
                    .await
            }
            None => debug!("No web handler for {}", message.topic),
        },
    }
}

async fn handle_rpc(ctx: &Arc<ClientContext>, from: &str, payload: &Bytes) {
    let packet = match PeerRpcRequest::from_json(payload) {
        Ok(packet) => packet,
        Err(e) => {
            warn!("Malformed rpc from {}: {}", from, e);
            return;
        }
    };
    if normalize_host(&packet.from_host) != from {
        warn!(
            "Dropping rpc from {} claiming to be {}",
            from, packet.from_host
        );
        return;
    }

    let peer = match ctx.peers.get_or_create(ctx, from) {
        Ok(peer) => peer,
        Err(e) => {
            warn!("Dropping rpc from {}: {}", from, e);
            return;
        }
    };
    peer.relay().mark_push_live();
    deliver(ctx.clone(), peer, Origin::Broker, packet).await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Maintenance
// ─────────────────────────────────────────────────────────────────────────────

/// Periodic idle-peer sweep and data-channel keepalive
async fn run_maintenance(ctx: Arc<ClientContext>, cancel: CancellationToken) {
    let mut sweep = tokio::time::interval(Duration::from_secs(
        ctx.config.eviction_interval_secs.max(1),
    ));
    let mut keepalive =
        tokio::time::interval(Duration::from_secs(ctx.config.keepalive_secs.max(1)));
    sweep.tick().await;
    keepalive.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sweep.tick() => {
                let evicted = ctx.peers.evict_idle(&ctx, ctx.config.peer_idle_timeout()).await;
                if !evicted.is_empty() {
                    debug!("Evicted {} idle peers", evicted.len());
                }
            }
            _ = keepalive.tick() => {
                for host in ctx.peers.hosts() {
                    let channel = ctx.peers.get(&host).and_then(|peer| peer.negotiator().channel());
                    if let Some(channel) = channel {
                        if let Err(e) = channel.ping().await {
                            debug!("Keepalive to {} failed: {}", host, e);
                        }
                    }
                }
            }
        }
    }
}
