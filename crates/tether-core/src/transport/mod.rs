//! Transports
//!
//! A peer's traffic rides either the broker relay (with HTTP fallback) or a
//! negotiated data channel. `TransportState` records which one is live.

pub mod broker;
pub mod datachannel;
pub mod http;
pub mod memory;
#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod relay;

pub use broker::{Broker, BrokerMessage, topic_matches};
pub use datachannel::{DataChannel, DataChannelTransport};
pub use http::HttpFallback;
pub use memory::{MemoryBroker, MemoryHub};
#[cfg(feature = "mqtt")]
pub use mqtt::{BrokerEndpoint, MqttBroker};
pub use relay::RelayTransport;

/// Which transport a peer sends on, chosen explicitly at send time
#[derive(Clone, Default)]
pub enum TransportState {
    /// The peer was closed; nothing may be sent
    NotConnected,
    /// Broker relay (or its HTTP fallback) only
    #[default]
    RelayOnly,
    /// An open data channel, preferred for everything but signaling
    DataChannel(DataChannelTransport),
}

impl TransportState {
    /// The data channel, if one is held and still open
    pub fn open_channel(&self) -> Option<&DataChannelTransport> {
        match self {
            TransportState::DataChannel(dc) if dc.is_open() => Some(dc),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransportState::NotConnected => "not-connected",
            TransportState::RelayOnly => "relay",
            TransportState::DataChannel(_) => "data-channel",
        }
    }
}

impl std::fmt::Debug for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
