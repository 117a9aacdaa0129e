//! Tether Daemon
//!
//! The tunnel client: peers and their registry, socket listeners and
//! relays, the socket map, and dispatch of inbound broker traffic.

pub mod client;
pub mod listener;
pub mod methods;
pub mod peer;
pub mod registry;
pub mod relay;
mod server_rpc;
pub mod session;
pub mod socket_map;
pub mod web;

pub use client::{ClientContext, ClientEvent, TunnelClient};
pub use listener::{ListenerHandle, SocketListeners};
pub use methods::{CallContext, PeerMethods};
pub use peer::{Peer, SocketRoute};
pub use registry::PeerRegistry;
pub use relay::SocketRelays;
pub use session::{SessionHandle, TunnelStats};
pub use socket_map::{SocketCommand, SocketInfo, SocketMap, SocketSide};
pub use web::{WebHandler, WebRequest};
