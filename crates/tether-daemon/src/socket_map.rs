//! Socket Map
//!
//! Process-wide table of live tunnelled sockets keyed by socket id. Each
//! entry records the remote host that owns it and the command channel of
//! the session driving the local TCP stream. Command queues are bounded,
//! so remote bytes wait for a slow local stream instead of piling up.

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::sync::Arc;
use tether_core::{Result, TetherError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// Commands queued per socket before remote writers wait
pub const SOCKET_QUEUE: usize = 64;

/// Creates the command queue of one socket session
pub fn socket_channel() -> (mpsc::Sender<SocketCommand>, mpsc::Receiver<SocketCommand>) {
    mpsc::channel(SOCKET_QUEUE)
}

/// Queues a close without waiting
///
/// A close that finds the queue full is handed to a task so it still lands
/// behind the data already queued.
pub(crate) fn request_close(tx: &mpsc::Sender<SocketCommand>, notify_remote: bool) -> bool {
    match tx.try_send(SocketCommand::Close { notify_remote }) {
        Ok(()) => true,
        Err(TrySendError::Full(command)) => {
            let tx = tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(command).await;
            });
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Which end of the tunnel a socket belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketSide {
    /// Accepted by a local socket listener
    Listener,
    /// Dialed by a socket relay toward its target
    Relay,
}

impl SocketSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketSide::Listener => "listener",
            SocketSide::Relay => "relay",
        }
    }
}

/// Instruction for a socket session
#[derive(Debug)]
pub enum SocketCommand {
    /// Bytes from the remote side to write to the local stream
    Data(Bytes),
    /// Tear the session down
    Close { notify_remote: bool },
}

struct SocketEntry {
    host: String,
    side: SocketSide,
    tx: mpsc::Sender<SocketCommand>,
}

/// Snapshot of one registered socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketInfo {
    pub socket_id: String,
    pub host: String,
    pub side: SocketSide,
}

#[derive(Clone, Default)]
pub struct SocketMap {
    entries: Arc<DashMap<String, SocketEntry>>,
}

impl SocketMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a socket; an id that is still active is rejected
    pub fn register(
        &self,
        socket_id: &str,
        host: &str,
        side: SocketSide,
        tx: mpsc::Sender<SocketCommand>,
    ) -> Result<()> {
        match self.entries.entry(socket_id.to_string()) {
            Entry::Occupied(_) => Err(TetherError::SocketExists(socket_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(SocketEntry {
                    host: host.to_string(),
                    side,
                    tx,
                });
                Ok(())
            }
        }
    }

    pub fn contains(&self, socket_id: &str) -> bool {
        self.entries.contains_key(socket_id)
    }

    /// Forwards remote bytes to a socket owned by `host`
    ///
    /// Waits while the socket's queue is full. Data for unknown sockets, or
    /// sockets owned by another host, is dropped.
    pub async fn write(&self, host: &str, socket_id: &str, data: Bytes) -> bool {
        let tx = match self.entries.get(socket_id) {
            Some(entry) if entry.host == host => entry.tx.clone(),
            Some(_) => {
                debug!("Dropping data for socket {} from non-owner {}", socket_id, host);
                return false;
            }
            None => {
                debug!("Dropping {} bytes for unknown socket {}", data.len(), socket_id);
                return false;
            }
        };
        tx.send(SocketCommand::Data(data)).await.is_ok()
    }

    /// Asks the session behind `socket_id` to close
    pub fn close(&self, socket_id: &str, notify_remote: bool) -> bool {
        let tx = match self.entries.get(socket_id) {
            Some(entry) => entry.tx.clone(),
            None => return false,
        };
        request_close(&tx, notify_remote)
    }

    /// Closes a socket on behalf of the remote host that owns it
    pub fn close_from(&self, host: &str, socket_id: &str) -> bool {
        let owned = self
            .entries
            .get(socket_id)
            .map(|entry| entry.host == host)
            .unwrap_or(false);
        if !owned {
            debug!("Ignoring close of socket {} from {}", socket_id, host);
            return false;
        }
        self.close(socket_id, false)
    }

    /// Closes every socket owned by `host`, returning how many were asked
    pub fn close_host(&self, host: &str, notify_remote: bool) -> usize {
        let ids = self.ids_for_host(host);
        ids.iter()
            .filter(|id| self.close(id, notify_remote))
            .count()
    }

    /// Removes the entry only if it still belongs to the given session
    pub fn remove(&self, socket_id: &str, tx: &mpsc::Sender<SocketCommand>) -> bool {
        self.entries
            .remove_if(socket_id, |_, entry| entry.tx.same_channel(tx))
            .is_some()
    }

    pub fn ids_for_host(&self, host: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| entry.host == host)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn has_host(&self, host: &str) -> bool {
        self.entries.iter().any(|entry| entry.host == host)
    }

    pub fn list(&self) -> Vec<SocketInfo> {
        self.entries
            .iter()
            .map(|entry| SocketInfo {
                socket_id: entry.key().clone(),
                host: entry.host.clone(),
                side: entry.side,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
