//! Socket Listeners
//!
//! Outbound side of a tunnel. A listener binds a local port; every
//! accepted connection is announced to the remote host's relay with
//! `connectSocket` and then pumped through the peer.

use dashmap::{DashMap, DashSet};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tether_core::host::{is_local_host, normalize_host, strip_trailing_slash};
use tether_core::id::generate_id;
use tether_core::protocol::{ConnectSocketParams, SocketListenerInfo};
use tether_core::{ListenerConfig, PeerMethod, Result, TetherError};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::ClientContext;
use crate::session::start_session;
use crate::socket_map::SocketSide;

struct ListenerEntry {
    info: SocketListenerInfo,
    cancel: CancellationToken,
}

/// A running listener
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    local_addr: SocketAddr,
    target_host: String,
    target_port: u16,
    cancel: CancellationToken,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn target_host(&self) -> &str {
        &self.target_host
    }

    pub fn target_port(&self) -> u16 {
        self.target_port
    }

    /// Stops accepting and closes every socket this listener opened
    pub fn end(&self) {
        self.cancel.cancel();
    }

    pub fn is_ended(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Default)]
pub struct SocketListeners {
    entries: DashMap<u16, ListenerEntry>,
}

impl SocketListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `127.0.0.1:<port>` and starts accepting
    pub(crate) async fn add(
        &self,
        ctx: &Arc<ClientContext>,
        config: ListenerConfig,
    ) -> Result<ListenerHandle> {
        let target_host = strip_trailing_slash(config.target_host.trim());
        if target_host.is_empty() {
            return Err(TetherError::InvalidHost("no targetHost specified".into()));
        }
        if is_local_host(target_host, &ctx.my_host) {
            return Err(TetherError::SelfLoop(target_host.to_string()));
        }
        let endpoint = target_host.to_string();
        let target_host = normalize_host(target_host);
        let target_port = config.target_port.unwrap_or(config.port);

        let listener = TcpListener::bind(("127.0.0.1", config.port))
            .await
            .map_err(|e| TetherError::PortBindFailed {
                port: config.port,
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;
        let password = config.password.filter(|p| !p.is_empty());

        let cancel = CancellationToken::new();
        self.entries.insert(
            local_addr.port(),
            ListenerEntry {
                info: SocketListenerInfo {
                    port: local_addr.port(),
                    target_host: target_host.clone(),
                    target_port,
                    has_password: password.is_some(),
                },
                cancel: cancel.clone(),
            },
        );

        info!(
            "Listening on {} → {}:{}",
            local_addr, target_host, target_port
        );

        let accept = AcceptLoop {
            ctx: Arc::downgrade(ctx),
            listener,
            target: Target {
                host: target_host.clone(),
                endpoint,
                port: target_port,
                password,
            },
            cancel: cancel.clone(),
            opened: Arc::new(DashSet::new()),
        };
        tokio::spawn(accept.run());

        Ok(ListenerHandle {
            local_addr,
            target_host,
            target_port,
            cancel,
        })
    }

    pub fn list(&self) -> Vec<SocketListenerInfo> {
        let mut listeners: Vec<SocketListenerInfo> =
            self.entries.iter().map(|e| e.info.clone()).collect();
        listeners.sort_by_key(|listener| listener.port);
        listeners
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ends every listener
    pub(crate) fn end_all(&self) {
        for entry in self.entries.iter() {
            entry.cancel.cancel();
        }
    }

    fn remove(&self, port: u16) {
        self.entries.remove(&port);
    }
}

/// Where a listener's connections go
#[derive(Clone)]
struct Target {
    /// Normalized peer name
    host: String,
    /// Target as configured; keeps any scheme or port for the HTTP fallback
    endpoint: String,
    port: u16,
    password: Option<String>,
}

struct AcceptLoop {
    ctx: Weak<ClientContext>,
    listener: TcpListener,
    target: Target,
    cancel: CancellationToken,
    opened: Arc<DashSet<String>>,
}

impl AcceptLoop {
    async fn run(self) {
        let port = self.listener.local_addr().map(|a| a.port()).unwrap_or(0);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let Some(ctx) = self.ctx.upgrade() else { break };
                        debug!("Accepted {} on port {}", addr, port);
                        self.opened.retain(|id| ctx.sockets.contains(id));
                        tokio::spawn(open_socket(
                            ctx,
                            stream,
                            self.target.clone(),
                            self.opened.clone(),
                        ));
                    }
                    Err(e) => {
                        error!("Accept error on port {}: {}", port, e);
                    }
                }
            }
        }

        info!("Listener on port {} ended", port);
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.listeners.remove(port);
            for socket_id in self.opened.iter() {
                ctx.sockets.close(&socket_id, true);
            }
        }
    }
}

/// Tunnels one accepted connection to the remote relay
async fn open_socket(
    ctx: Arc<ClientContext>,
    stream: TcpStream,
    target: Target,
    opened: Arc<DashSet<String>>,
) {
    let peer = match ctx.peers.get_or_create(&ctx, &target.host) {
        Ok(peer) => peer,
        Err(e) => {
            warn!("No peer for {}: {}", target.host, e);
            return;
        }
    };
    if target.endpoint != target.host {
        peer.relay().set_endpoint(&target.endpoint);
    }

    if ctx.config.use_rtc && peer.negotiator().channel().is_none() {
        if let Err(e) = peer.connect_rtc().await {
            debug!("Using relay for {}: {}", target.host, e);
        }
    }

    let socket_id = generate_id();
    let handle = match start_session(
        stream,
        socket_id.clone(),
        SocketSide::Listener,
        peer.clone(),
        ctx.sockets.clone(),
        ctx.stats.clone(),
    ) {
        Ok(handle) => handle,
        Err(e) => {
            warn!("Could not register socket {}: {}", socket_id, e);
            return;
        }
    };
    opened.insert(socket_id.clone());

    let params = ConnectSocketParams {
        socket_id: socket_id.clone(),
        port: target.port,
        host_name: ctx.my_host.clone(),
        password: target.password,
    };
    let request = match serde_json::to_value(params) {
        Ok(value) => value,
        Err(e) => {
            error!("Could not encode connect request: {}", e);
            return;
        }
    };

    match peer
        .call(PeerMethod::ConnectSocket.as_str(), vec![request])
        .await
    {
        Ok(result) => {
            debug!(
                "Socket {} connected via {} ({})",
                socket_id,
                target.host,
                describe(&result)
            );
            handle.mark_ready();
        }
        Err(e) => {
            warn!("connectSocket to {}:{} failed: {}", target.host, target.port, e);
            opened.remove(&socket_id);
            handle.fail();
        }
    }
}

fn describe(result: &Value) -> String {
    match (result.get("targetHost"), result.get("targetPort")) {
        (Some(host), Some(port)) => format!("{}:{}", host.as_str().unwrap_or("?"), port),
        _ => result.to_string(),
    }
}
