//! Data-channel transport
//!
//! Frames every payload as a bincode `Frame` over an open peer-to-peer
//! data channel.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use crate::error::Result;
use crate::protocol::{Frame, PeerRpcRequest};

/// An established peer-to-peer data channel
///
/// Inbound messages are delivered as `RtcEvent::Message` by the session
/// that owns the channel.
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Send one message to the peer
    async fn send(&self, data: Bytes) -> Result<()>;

    /// Check if the channel is open
    fn is_open(&self) -> bool;

    /// Close the channel
    async fn close(&self);
}

/// Framed sender over one data channel
#[derive(Clone)]
pub struct DataChannelTransport {
    channel: Arc<dyn DataChannel>,
}

impl DataChannelTransport {
    pub fn new(channel: Arc<dyn DataChannel>) -> Self {
        Self { channel }
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.channel.send(Bytes::from(frame.to_bytes()?)).await
    }

    pub async fn send_packet(&self, packet: &PeerRpcRequest) -> Result<()> {
        self.send_frame(&Frame::Rpc(packet.to_json()?)).await
    }

    pub async fn send_socket_data(&self, socket_id: &str, data: &[u8]) -> Result<()> {
        self.send_frame(&Frame::SocketData {
            socket_id: socket_id.to_string(),
            data: data.to_vec(),
        })
        .await
    }

    pub async fn send_json(&self, payload: Vec<u8>) -> Result<()> {
        self.send_frame(&Frame::Json(payload)).await
    }

    /// Warm-up frame, some stacks drop the first message on a fresh channel
    pub async fn ping(&self) -> Result<()> {
        self.send_frame(&Frame::Ping).await
    }

    pub async fn close(&self) {
        self.channel.close().await
    }
}
