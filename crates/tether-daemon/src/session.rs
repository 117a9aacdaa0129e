//! Socket Sessions
//!
//! Pumps bytes between one local TCP stream and the remote end of a
//! tunnel. The reader waits until the session is marked ready, then
//! forwards local bytes on the route chosen at that moment. The writer
//! applies remote bytes and close commands in arrival order.

use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tether_core::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::peer::Peer;
use crate::socket_map::{SocketCommand, SocketMap, SocketSide, request_close, socket_channel};

/// Largest chunk forwarded per read
const READ_CHUNK: usize = 16 * 1024;

/// Byte and socket counters shared by every session of a client
#[derive(Debug, Default)]
pub struct TunnelStats {
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub sockets_total: AtomicU64,
    pub sockets_active: AtomicU64,
}

impl TunnelStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn socket_opened(&self) {
        self.sockets_total.fetch_add(1, Ordering::Relaxed);
        self.sockets_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn socket_closed(&self) {
        self.sockets_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get_bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn get_bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn get_total_sockets(&self) -> u64 {
        self.sockets_total.load(Ordering::Relaxed)
    }

    pub fn get_active_sockets(&self) -> u64 {
        self.sockets_active.load(Ordering::Relaxed)
    }
}

/// Control over a session that has been registered but not started
///
/// Dropping the handle without marking it ready closes the session
/// quietly.
pub struct SessionHandle {
    socket_id: String,
    tx: mpsc::Sender<SocketCommand>,
    ready: Option<oneshot::Sender<()>>,
}

impl SessionHandle {
    pub fn socket_id(&self) -> &str {
        &self.socket_id
    }

    /// Starts forwarding local bytes to the remote side
    pub fn mark_ready(mut self) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(());
        }
    }

    /// Closes the session and tells the remote side to drop its end
    pub fn fail(mut self) {
        self.ready.take();
        request_close(&self.tx, true);
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.ready.is_some() {
            request_close(&self.tx, false);
        }
    }
}

/// Registers `socket_id` and spawns the pumps for `stream`
///
/// Registration happens before this returns so remote bytes that arrive
/// early are queued for the writer instead of being dropped.
pub(crate) fn start_session(
    stream: TcpStream,
    socket_id: String,
    side: SocketSide,
    peer: Arc<Peer>,
    sockets: SocketMap,
    stats: Arc<TunnelStats>,
) -> Result<SessionHandle> {
    let (tx, rx) = socket_channel();
    sockets.register(&socket_id, peer.host_name(), side, tx.clone())?;
    stats.socket_opened();
    debug!(
        "Socket {} ({}) opened for {}",
        socket_id,
        side.as_str(),
        peer.host_name()
    );

    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let (ready_tx, ready_rx) = oneshot::channel();

    let reader = tokio::spawn(read_loop(
        read_half,
        socket_id.clone(),
        side,
        peer.clone(),
        tx.clone(),
        ready_rx,
        stats.clone(),
    ));

    tokio::spawn(write_loop(
        write_half,
        rx,
        reader,
        socket_id.clone(),
        side,
        peer,
        sockets,
        tx.clone(),
        stats,
    ));

    Ok(SessionHandle {
        socket_id,
        tx,
        ready: Some(ready_tx),
    })
}

async fn read_loop(
    mut read: OwnedReadHalf,
    socket_id: String,
    side: SocketSide,
    peer: Arc<Peer>,
    tx: mpsc::Sender<SocketCommand>,
    ready: oneshot::Receiver<()>,
    stats: Arc<TunnelStats>,
) {
    if ready.await.is_err() {
        return;
    }

    let route = peer.socket_route();
    debug!("Socket {} forwarding over {}", socket_id, route.name());

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match read.read(&mut buf).await {
            Ok(0) => {
                debug!("Local end of socket {} closed", socket_id);
                break;
            }
            Ok(n) => {
                let data = Bytes::copy_from_slice(&buf[..n]);
                if let Err(e) = peer.send_socket_data(&route, side, &socket_id, data).await {
                    warn!("Failed to forward data for socket {}: {}", socket_id, e);
                    break;
                }
                stats.record_sent(n as u64);
            }
            Err(e) => {
                debug!("Read error on socket {}: {}", socket_id, e);
                break;
            }
        }
    }

    let _ = tx
        .send(SocketCommand::Close {
            notify_remote: true,
        })
        .await;
}

#[allow(clippy::too_many_arguments)]
async fn write_loop(
    mut write: OwnedWriteHalf,
    mut rx: mpsc::Receiver<SocketCommand>,
    reader: JoinHandle<()>,
    socket_id: String,
    side: SocketSide,
    peer: Arc<Peer>,
    sockets: SocketMap,
    tx: mpsc::Sender<SocketCommand>,
    stats: Arc<TunnelStats>,
) {
    let mut notify_remote = true;
    while let Some(command) = rx.recv().await {
        match command {
            SocketCommand::Data(data) => {
                if let Err(e) = write.write_all(&data).await {
                    debug!("Write error on socket {}: {}", socket_id, e);
                    break;
                }
                stats.record_received(data.len() as u64);
            }
            SocketCommand::Close { notify_remote: notify } => {
                notify_remote = notify;
                break;
            }
        }
    }

    reader.abort();
    let _ = write.shutdown().await;
    sockets.remove(&socket_id, &tx);
    stats.socket_closed();
    debug!("Socket {} ({}) closed", socket_id, side.as_str());

    if notify_remote {
        if let Err(e) = peer.notify_socket_closed(side, &socket_id).await {
            debug!("Could not signal close of socket {}: {}", socket_id, e);
        }
    }
}
