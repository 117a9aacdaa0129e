//! Peer Registry
//!
//! At most one `Peer` per remote host, created on first use by either
//! side and evicted once it has gone quiet.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tether_core::host::normalize_host;
use tether_core::{NegotiationState, Result, TetherError};
use tracing::{debug, info};

use crate::client::{ClientContext, ClientEvent};
use crate::peer::{Peer, run_channel_events};

#[derive(Default)]
pub struct PeerRegistry {
    peers: DashMap<String, Arc<Peer>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, host: &str) -> Option<Arc<Peer>> {
        self.peers
            .get(&normalize_host(host))
            .map(|entry| entry.value().clone())
    }

    /// Returns the peer for `host`, creating it on first use
    pub(crate) fn get_or_create(&self, ctx: &Arc<ClientContext>, host: &str) -> Result<Arc<Peer>> {
        let host = normalize_host(host);
        if host.is_empty() {
            return Err(TetherError::InvalidHost("no host name specified".into()));
        }
        if host == ctx.my_host {
            return Err(TetherError::SelfLoop(host));
        }

        let peer = match self.peers.entry(host.clone()) {
            Entry::Occupied(entry) => return Ok(entry.get().clone()),
            Entry::Vacant(slot) => {
                let (peer, events) = Peer::new(ctx, &host);
                tokio::spawn(run_channel_events(
                    Arc::downgrade(ctx),
                    Arc::downgrade(&peer),
                    events,
                ));
                slot.insert(peer.clone());
                peer
            }
        };

        debug!("Created peer {}", host);
        ctx.emit(ClientEvent::PeerCreated { host });
        Ok(peer)
    }

    /// Returns a peer that is evicted as soon as it holds no sockets
    pub(crate) fn get_temporary(&self, ctx: &Arc<ClientContext>, host: &str) -> Result<Arc<Peer>> {
        let existing = self.get(host);
        let peer = self.get_or_create(ctx, host)?;
        if existing.is_none() {
            peer.mark_temporary();
        }
        Ok(peer)
    }

    pub fn hosts(&self) -> Vec<String> {
        self.peers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Removes peers with no sockets and no live data channel
    ///
    /// Temporary peers go as soon as they are unused; others once they
    /// have been idle for `idle`. With no idle timeout only temporary
    /// peers are evicted.
    pub(crate) async fn evict_idle(&self, ctx: &ClientContext, idle: Option<Duration>) -> Vec<String> {
        let candidates: Vec<Arc<Peer>> = self
            .peers
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|peer| {
                let busy = ctx.sockets.has_host(peer.host_name())
                    || matches!(
                        peer.rtc_state(),
                        NegotiationState::Connecting | NegotiationState::Connected
                    );
                let stale = peer.is_temporary() || idle.is_some_and(|idle| peer.idle_for() >= idle);
                !busy && stale
            })
            .collect();

        let mut evicted = Vec::new();
        for peer in candidates {
            let host = peer.host_name().to_string();
            let removed = self
                .peers
                .remove_if(&host, |_, current| Arc::ptr_eq(current, &peer))
                .is_some();
            if !removed {
                continue;
            }
            peer.close().await;
            info!("Evicted idle peer {}", host);
            ctx.emit(ClientEvent::PeerEvicted { host: host.clone() });
            evicted.push(host);
        }
        evicted
    }

    /// Closes and forgets every peer
    pub(crate) async fn close_all(&self) {
        let peers: Vec<Arc<Peer>> = self.peers.iter().map(|e| e.value().clone()).collect();
        self.peers.clear();
        for peer in peers {
            peer.close().await;
        }
    }
}
