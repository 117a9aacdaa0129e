//! Tether Core Library
//!
//! This crate provides the transport-agnostic core of Tether.
//! It includes:
//! - JSON-RPC peer engine with per-peer auth tokens
//! - Broker relay transport with HTTP fallback
//! - Data-channel transport and its negotiator
//! - Relay policy and host normalization

pub mod config;
pub mod error;
pub mod host;
pub mod id;
pub mod policy;
pub mod protocol;
pub mod rpc;
pub mod rtc;
pub mod transport;

pub use config::{ListenerConfig, RelayConfig, TetherConfig};
pub use error::{Result, RpcError, TetherError};
pub use policy::RelayPolicy;
pub use protocol::{
    Action, ConnectSocketParams, ConnectSocketResult, Frame, PeerMethod, PeerRpcRequest,
    RpcEnvelope, ServerMethod, Signal, Topic,
};
pub use rpc::{AuthGate, Origin, PendingCalls, RpcEngine, RpcHandler, RpcSink};
pub use rtc::{ChannelEvent, MemoryRtc, NegotiationState, Negotiator, NegotiatorConfig, RtcConnector, SignalSink};
pub use transport::{
    Broker, BrokerMessage, DataChannel, DataChannelTransport, HttpFallback, MemoryBroker,
    MemoryHub, RelayTransport, TransportState,
};
#[cfg(feature = "mqtt")]
pub use transport::MqttBroker;
