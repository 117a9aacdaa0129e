//! Connector seam
//!
//! Abstracts the peer-connection stack so negotiation logic is shared
//! between the real WebRTC backend and the in-memory one.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::NegotiationState;
use crate::error::Result;
use crate::transport::DataChannel;

/// Which side of the offer/answer exchange a session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

/// Everything a session reports back, in the order it happened
pub enum RtcEvent {
    /// A local candidate was gathered
    LocalCandidate { candidate: String, mid: Option<String> },
    /// Local gathering finished
    GatheringComplete,
    /// The underlying connection changed state
    StateChange(NegotiationState),
    /// The data channel is open and ready to carry frames
    ChannelOpen(Arc<dyn DataChannel>),
    /// One message arrived on the data channel
    Message(Bytes),
    /// The data channel closed
    ChannelClosed,
}

impl std::fmt::Debug for RtcEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RtcEvent::LocalCandidate { candidate, .. } => write!(f, "LocalCandidate({})", candidate),
            RtcEvent::GatheringComplete => f.write_str("GatheringComplete"),
            RtcEvent::StateChange(state) => write!(f, "StateChange({})", state),
            RtcEvent::ChannelOpen(_) => f.write_str("ChannelOpen"),
            RtcEvent::Message(data) => write!(f, "Message({} bytes)", data.len()),
            RtcEvent::ChannelClosed => f.write_str("ChannelClosed"),
        }
    }
}

/// Creates one peer-connection session per negotiation
#[async_trait]
pub trait RtcConnector: Send + Sync {
    /// Events for the session arrive on the returned receiver
    async fn create_session(
        &self,
        role: Role,
    ) -> Result<(Arc<dyn RtcSession>, mpsc::UnboundedReceiver<RtcEvent>)>;
}

/// One peer connection
#[async_trait]
pub trait RtcSession: Send + Sync {
    /// Sets the local offer and starts gathering; returns the offer sdp
    async fn create_offer(&self) -> Result<String>;

    /// Applies a remote offer, sets the local answer; returns the answer sdp
    async fn accept_offer(&self, sdp: &str) -> Result<String>;

    /// Applies the remote answer
    async fn apply_answer(&self, sdp: &str) -> Result<()>;

    /// Applies one remote candidate; only valid once a remote description is set
    async fn add_candidate(&self, candidate: &str, mid: Option<&str>) -> Result<()>;

    /// Current local description, including any gathered candidates
    async fn local_description(&self) -> Option<String>;

    async fn close(&self);
}
