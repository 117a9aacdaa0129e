//! Socket Relays
//!
//! Inbound side of a tunnel. A relay exposes one local target to remote
//! listeners; each `connectSocket` call is checked against the relay's
//! policy and password before the target is dialed.

use dashmap::DashMap;
use std::sync::Arc;
use tether_core::protocol::{ConnectSocketParams, ConnectSocketResult, SocketRelayInfo};
use tether_core::{RelayConfig, RelayPolicy, Result, TetherError};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::client::ClientContext;
use crate::peer::Peer;
use crate::session::start_session;
use crate::socket_map::SocketSide;

/// Default target host when a relay names none
pub const DEFAULT_TARGET_HOST: &str = "localhost";

#[derive(Debug, Clone)]
struct RelayEntry {
    port: u16,
    target_host: String,
    target_port: u16,
    policy: RelayPolicy,
    password: Option<String>,
}

impl RelayEntry {
    fn info(&self) -> SocketRelayInfo {
        SocketRelayInfo {
            port: self.port,
            target_host: self.target_host.clone(),
            target_port: self.target_port,
            whitelist: self.policy.whitelist.clone(),
            blacklist: self.policy.blacklist.clone(),
            has_password: self.password.is_some(),
        }
    }
}

#[derive(Default)]
pub struct SocketRelays {
    entries: DashMap<u16, RelayEntry>,
}

impl SocketRelays {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a relay, replacing any previous one on the same port
    pub fn add(&self, config: RelayConfig) -> SocketRelayInfo {
        let entry = RelayEntry {
            port: config.port,
            target_host: config
                .target_host
                .clone()
                .filter(|host| !host.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_TARGET_HOST.to_string()),
            target_port: config.target_port.unwrap_or(config.port),
            policy: config.policy(),
            password: config.password.clone().filter(|p| !p.is_empty()),
        };
        info!(
            "Relay on port {} → {}:{}",
            entry.port, entry.target_host, entry.target_port
        );
        let info = entry.info();
        self.entries.insert(config.port, entry);
        info
    }

    pub fn get(&self, port: u16) -> Option<SocketRelayInfo> {
        self.entries.get(&port).map(|entry| entry.info())
    }

    pub fn remove(&self, port: u16) -> bool {
        self.entries.remove(&port).is_some()
    }

    pub fn list(&self) -> Vec<SocketRelayInfo> {
        let mut relays: Vec<SocketRelayInfo> = self.entries.iter().map(|e| e.info()).collect();
        relays.sort_by_key(|relay| relay.port);
        relays
    }

    /// Serves a remote listener's `connectSocket` call
    ///
    /// Checks run in order: relay exists, caller allowed by policy,
    /// password matches, socket id unused. Only then is the target dialed.
    pub(crate) async fn connect_socket(
        &self,
        ctx: &Arc<ClientContext>,
        peer: &Arc<Peer>,
        params: ConnectSocketParams,
    ) -> Result<ConnectSocketResult> {
        let entry = self
            .entries
            .get(&params.port)
            .map(|entry| entry.value().clone())
            .ok_or(TetherError::NoRelay(params.port))?;

        let caller = peer.host_name();
        if !entry.policy.is_allowed(caller) {
            warn!("Relay on port {} refused {}", entry.port, caller);
            return Err(TetherError::PolicyDenied {
                host: caller.to_string(),
                port: entry.port,
            });
        }

        if let Some(password) = &entry.password {
            if params.password.as_deref() != Some(password.as_str()) {
                warn!("Bad relay password from {} for port {}", caller, entry.port);
                return Err(TetherError::Unauthorized("bad relay password".into()));
            }
        }

        if ctx.sockets.contains(&params.socket_id) {
            return Err(TetherError::SocketExists(params.socket_id));
        }

        let target = format!("{}:{}", entry.target_host, entry.target_port);
        let stream = TcpStream::connect((entry.target_host.as_str(), entry.target_port))
            .await
            .map_err(|e| TetherError::ConnectFailed {
                target: target.clone(),
                reason: e.to_string(),
            })?;

        let handle = start_session(
            stream,
            params.socket_id.clone(),
            SocketSide::Relay,
            peer.clone(),
            ctx.sockets.clone(),
            ctx.stats.clone(),
        )?;
        handle.mark_ready();
        debug!("Relay socket {} from {} → {}", params.socket_id, caller, target);

        Ok(ConnectSocketResult {
            socket_id: params.socket_id,
            target_host: entry.target_host,
            target_port: entry.target_port,
        })
    }
}
