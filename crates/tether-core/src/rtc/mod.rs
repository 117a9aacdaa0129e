//! Data-channel negotiation
//!
//! Offer/answer/candidate exchange that upgrades a peer from the broker
//! relay to a direct data channel.

pub mod candidates;
pub mod connector;
pub mod memory;
pub mod negotiator;
#[cfg(feature = "webrtc")]
pub mod webrtc;

pub use candidates::{CandidateQueue, QueuedCandidate};
pub use connector::{Role, RtcConnector, RtcEvent, RtcSession};
pub use memory::MemoryRtc;
pub use negotiator::{ChannelEvent, Negotiator, NegotiatorConfig, SignalSink};
#[cfg(feature = "webrtc")]
pub use self::webrtc::WebRtcConnector;

/// Lifecycle of one peer's data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Closed,
    Failed,
}

impl NegotiationState {
    /// States that tear down the session and everything riding it
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NegotiationState::Disconnected | NegotiationState::Closed | NegotiationState::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationState::Idle => "idle",
            NegotiationState::Connecting => "connecting",
            NegotiationState::Connected => "connected",
            NegotiationState::Disconnected => "disconnected",
            NegotiationState::Closed => "closed",
            NegotiationState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
