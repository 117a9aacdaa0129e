//! Tether Protocol Definition
//!
//! Defines the wire formats shared by every transport: JSON-RPC envelopes,
//! the authenticated peer packet, negotiation signals, broker topics, the
//! binary data-channel frame, and the typed method tables.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::config::{ListenerConfig, RelayConfig};
use crate::error::{Result, RpcError, TetherError};

/// JSON-RPC version carried in every envelope
pub const JSONRPC_VERSION: &str = "2.0";

fn default_jsonrpc() -> String {
    JSONRPC_VERSION.to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// RPC Envelopes
// ─────────────────────────────────────────────────────────────────────────────

/// A JSON-RPC request, notification or reply
///
/// A request carries an `id` and a `method`; a notification carries only a
/// `method`; a reply carries an `id` and either `result` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcEnvelope {
    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            id: Some(id.into()),
            jsonrpc: default_jsonrpc(),
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn notification(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            id: None,
            jsonrpc: default_jsonrpc(),
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn reply(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: Some(id.into()),
            jsonrpc: default_jsonrpc(),
            method: None,
            params: Vec::new(),
            result: Some(result),
            error: None,
        }
    }

    pub fn error_reply(id: impl Into<String>, error: RpcError) -> Self {
        Self {
            id: Some(id.into()),
            jsonrpc: default_jsonrpc(),
            method: None,
            params: Vec::new(),
            result: None,
            error: Some(error),
        }
    }

    /// Carries a method and expects exactly one reply
    pub fn is_request(&self) -> bool {
        self.method.is_some() && self.id.is_some()
    }

    /// Carries a method and never gets a reply
    pub fn is_notification(&self) -> bool {
        self.method.is_some() && self.id.is_none()
    }

    /// Answers an earlier request
    pub fn is_reply(&self) -> bool {
        self.method.is_none() && self.id.is_some()
    }

    /// Converts a reply into the caller's outcome
    pub fn into_outcome(self) -> std::result::Result<Value, RpcError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| TetherError::InvalidMessage(e.to_string()))
    }
}

/// Authenticated wrapper around an envelope, used on every transport
///
/// This is also the body of the HTTP fallback `POST <base>/rpc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRpcRequest {
    pub msg: RpcEnvelope,
    #[serde(default)]
    pub my_auth: Option<String>,
    pub to_host: String,
    pub from_host: String,
}

impl PeerRpcRequest {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| TetherError::InvalidMessage(e.to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Negotiation Signals
// ─────────────────────────────────────────────────────────────────────────────

/// Payload of the `rtcSignal` method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Signal {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        candidate: String,
        #[serde(default)]
        mid: Option<String>,
    },
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
            Signal::Candidate { .. } => "candidate",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Broker Topics
// ─────────────────────────────────────────────────────────────────────────────

/// The `<action>` segment of a `msg/...` topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Json,
    Rpc,
    Srpc,
    SocketData,
    RelayData,
    SocketClose,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Json => "json",
            Action::Rpc => "rpc",
            Action::Srpc => "srpc",
            Action::SocketData => "socketData",
            Action::RelayData => "relayData",
            Action::SocketClose => "socketClose",
        }
    }
}

impl FromStr for Action {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(Action::Json),
            "rpc" => Ok(Action::Rpc),
            "srpc" => Ok(Action::Srpc),
            "socketData" => Ok(Action::SocketData),
            "relayData" => Ok(Action::RelayData),
            "socketClose" => Ok(Action::SocketClose),
            other => Err(TetherError::InvalidMessage(format!("unknown action: {}", other))),
        }
    }
}

/// A parsed broker topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    /// `msg/<toHost>/<fromHost>/<action>[/<subId>]`
    Msg {
        to: String,
        from: String,
        action: Action,
        sub_id: Option<String>,
    },
    /// `web/<hostName>/<socketId>/<action>`
    Web {
        host: String,
        socket_id: String,
        action: String,
    },
}

impl Topic {
    pub fn msg(to: &str, from: &str, action: Action) -> Self {
        Topic::Msg {
            to: to.to_string(),
            from: from.to_string(),
            action,
            sub_id: None,
        }
    }

    pub fn msg_sub(to: &str, from: &str, action: Action, sub_id: &str) -> Self {
        Topic::Msg {
            to: to.to_string(),
            from: from.to_string(),
            action,
            sub_id: Some(sub_id.to_string()),
        }
    }

    pub fn parse(topic: &str) -> Result<Self> {
        let parts: Vec<&str> = topic.split('/').collect();
        match parts.as_slice() {
            ["msg", to, from, action] => Ok(Topic::Msg {
                to: to.to_string(),
                from: from.to_string(),
                action: action.parse()?,
                sub_id: None,
            }),
            ["msg", to, from, action, sub] => Ok(Topic::Msg {
                to: to.to_string(),
                from: from.to_string(),
                action: action.parse()?,
                sub_id: Some(sub.to_string()),
            }),
            ["web", host, socket_id, action] => Ok(Topic::Web {
                host: host.to_string(),
                socket_id: socket_id.to_string(),
                action: action.to_string(),
            }),
            _ => Err(TetherError::InvalidMessage(format!("bad topic: {}", topic))),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Msg {
                to,
                from,
                action,
                sub_id: None,
            } => write!(f, "msg/{}/{}/{}", to, from, action.as_str()),
            Topic::Msg {
                to,
                from,
                action,
                sub_id: Some(sub),
            } => write!(f, "msg/{}/{}/{}/{}", to, from, action.as_str(), sub),
            Topic::Web {
                host,
                socket_id,
                action,
            } => write!(f, "web/{}/{}/{}", host, socket_id, action),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Data-Channel Frames
// ─────────────────────────────────────────────────────────────────────────────

/// Binary frame carried on a peer-to-peer data channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// A JSON-encoded `PeerRpcRequest`
    Rpc(Vec<u8>),

    /// Raw bytes for one multiplexed socket
    SocketData { socket_id: String, data: Vec<u8> },

    /// An application JSON message
    Json(Vec<u8>),

    /// Warm-up frame sent when the channel opens, ignored on receipt
    Ping,
}

impl Frame {
    /// Serialize frame to bytes using bincode
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize frame from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Method Tables
// ─────────────────────────────────────────────────────────────────────────────

/// Methods a peer exposes to other peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerMethod {
    Ping,
    RtcSignal,
    ConnectSocket,
    ReceiveListenerData,
    ReceiveRelayData,
    CloseListenerSocket,
    CloseRelaySocket,
}

impl PeerMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerMethod::Ping => "ping",
            PeerMethod::RtcSignal => "rtcSignal",
            PeerMethod::ConnectSocket => "connectSocket",
            PeerMethod::ReceiveListenerData => "receiveListenerData",
            PeerMethod::ReceiveRelayData => "receiveRelayData",
            PeerMethod::CloseListenerSocket => "closeListenerSocket",
            PeerMethod::CloseRelaySocket => "closeRelaySocket",
        }
    }
}

impl FromStr for PeerMethod {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ping" => Ok(PeerMethod::Ping),
            "rtcSignal" => Ok(PeerMethod::RtcSignal),
            "connectSocket" => Ok(PeerMethod::ConnectSocket),
            "receiveListenerData" => Ok(PeerMethod::ReceiveListenerData),
            "receiveRelayData" => Ok(PeerMethod::ReceiveRelayData),
            "closeListenerSocket" => Ok(PeerMethod::CloseListenerSocket),
            "closeRelaySocket" => Ok(PeerMethod::CloseRelaySocket),
            other => Err(TetherError::MethodNotFound(other.to_string())),
        }
    }
}

/// Methods the broker's HTTP front-end may invoke on a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerMethod {
    Ping,
    PeerRpc,
    GetSocketListeners,
    GetSocketRelays,
    AddSocketListener,
    AddSocketRelay,
}

impl ServerMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerMethod::Ping => "ping",
            ServerMethod::PeerRpc => "peerRpc",
            ServerMethod::GetSocketListeners => "getSocketListeners",
            ServerMethod::GetSocketRelays => "getSocketRelays",
            ServerMethod::AddSocketListener => "addSocketListener",
            ServerMethod::AddSocketRelay => "addSocketRelay",
        }
    }
}

impl FromStr for ServerMethod {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ping" => Ok(ServerMethod::Ping),
            "peerRpc" => Ok(ServerMethod::PeerRpc),
            "getSocketListeners" => Ok(ServerMethod::GetSocketListeners),
            "getSocketRelays" => Ok(ServerMethod::GetSocketRelays),
            "addSocketListener" => Ok(ServerMethod::AddSocketListener),
            "addSocketRelay" => Ok(ServerMethod::AddSocketRelay),
            other => Err(TetherError::MethodNotFound(other.to_string())),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tunnel Method Params
// ─────────────────────────────────────────────────────────────────────────────

/// Params of `connectSocket`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectSocketParams {
    pub socket_id: String,
    pub port: u16,
    pub host_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Result of `connectSocket`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectSocketResult {
    pub socket_id: String,
    pub target_host: String,
    pub target_port: u16,
}

/// Params of the legacy base64 data methods
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketDataParams {
    pub socket_id: String,
    pub data: String,
}

/// Params of `closeListenerSocket` / `closeRelaySocket`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseSocketParams {
    pub socket_id: String,
}

/// Entry returned by `getSocketListeners`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketListenerInfo {
    pub port: u16,
    pub target_host: String,
    pub target_port: u16,
    pub has_password: bool,
}

/// Entry returned by `getSocketRelays`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketRelayInfo {
    pub port: u16,
    pub target_host: String,
    pub target_port: u16,
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
    pub has_password: bool,
}

/// Params of the server's `addSocketListener`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddSocketListenerParams {
    pub port: u16,
    pub target_host: String,
    #[serde(default)]
    pub target_port: Option<u16>,
    #[serde(default)]
    pub password: Option<String>,
}

impl From<AddSocketListenerParams> for ListenerConfig {
    fn from(params: AddSocketListenerParams) -> Self {
        ListenerConfig {
            port: params.port,
            target_host: params.target_host,
            target_port: params.target_port,
            password: params.password,
        }
    }
}

/// Params of the server's `addSocketRelay`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddSocketRelayParams {
    pub port: u16,
    #[serde(default)]
    pub target_host: Option<String>,
    #[serde(default)]
    pub target_port: Option<u16>,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub blacklist: Vec<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl From<AddSocketRelayParams> for RelayConfig {
    fn from(params: AddSocketRelayParams) -> Self {
        RelayConfig {
            port: params.port,
            target_host: params.target_host,
            target_port: params.target_port,
            whitelist: params.whitelist,
            blacklist: params.blacklist,
            password: params.password,
        }
    }
}

/// Decodes the first positional param into a typed struct
pub fn first_param<T: serde::de::DeserializeOwned>(params: &[Value]) -> Result<T> {
    let value = params
        .first()
        .cloned()
        .ok_or_else(|| TetherError::InvalidParams("missing params".into()))?;
    serde_json::from_value(value).map_err(|e| TetherError::InvalidParams(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_kinds() {
        let req = RpcEnvelope::request("1", "ping", vec![json!("hi")]);
        assert!(req.is_request());
        let note = RpcEnvelope::notification("closeRelaySocket", vec![]);
        assert!(note.is_notification());
        let reply = RpcEnvelope::reply("1", json!("ok"));
        assert!(reply.is_reply());
        assert_eq!(reply.into_outcome().unwrap(), json!("ok"));
    }

    #[test]
    fn test_envelope_wire_shape() {
        let note = RpcEnvelope::notification("closeRelaySocket", vec![json!({"socketId": "abc"})]);
        let value: Value = serde_json::from_slice(&note.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"jsonrpc": "2.0", "method": "closeRelaySocket", "params": [{"socketId": "abc"}]})
        );

        let err = RpcEnvelope::error_reply("7", RpcError::new(401, "unauthorized"));
        let value: Value = serde_json::from_slice(&err.to_json().unwrap()).unwrap();
        assert_eq!(value["error"]["code"], json!(401));
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_envelope_rejects_garbage() {
        assert!(matches!(
            RpcEnvelope::from_json(b"{not json"),
            Err(TetherError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_peer_request_camel_case() {
        let packet = PeerRpcRequest {
            msg: RpcEnvelope::request("1", "ping", vec![]),
            my_auth: Some("token".into()),
            to_host: "bob.example.com".into(),
            from_host: "alice.example.com".into(),
        };
        let value: Value = serde_json::from_slice(&packet.to_json().unwrap()).unwrap();
        assert_eq!(value["myAuth"], json!("token"));
        assert_eq!(value["toHost"], json!("bob.example.com"));
        assert_eq!(value["fromHost"], json!("alice.example.com"));
    }

    #[test]
    fn test_signal_tagging() {
        let offer: Signal = serde_json::from_value(json!({"type": "offer", "sdp": "v=0"})).unwrap();
        assert_eq!(offer, Signal::Offer { sdp: "v=0".into() });

        let cand = Signal::Candidate {
            candidate: "candidate:1".into(),
            mid: Some("0".into()),
        };
        let value = serde_json::to_value(&cand).unwrap();
        assert_eq!(value, json!({"type": "candidate", "candidate": "candidate:1", "mid": "0"}));
        assert_eq!(cand.kind(), "candidate");
    }

    #[test]
    fn test_topic_parse_and_format() {
        let topic = Topic::parse("msg/bob.example.com/alice.example.com/socketData/s1").unwrap();
        assert_eq!(
            topic,
            Topic::msg_sub("bob.example.com", "alice.example.com", Action::SocketData, "s1")
        );
        assert_eq!(
            topic.to_string(),
            "msg/bob.example.com/alice.example.com/socketData/s1"
        );

        let web = Topic::parse("web/bob.example.com/abc/data").unwrap();
        assert!(matches!(web, Topic::Web { ref action, .. } if action == "data"));

        assert!(Topic::parse("msg/a/b/launchMissiles").is_err());
        assert!(Topic::parse("other/a").is_err());
    }

    #[test]
    fn test_frame_serialization() {
        let frame = Frame::SocketData {
            socket_id: "s1".into(),
            data: vec![0, 1, 2, 255],
        };
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(Frame::from_bytes(&bytes).unwrap(), frame);
        assert!(Frame::from_bytes(&[9, 9, 9, 9]).is_err());
    }

    #[test]
    fn test_method_names() {
        assert_eq!("rtcSignal".parse::<PeerMethod>().unwrap(), PeerMethod::RtcSignal);
        assert_eq!(PeerMethod::CloseRelaySocket.as_str(), "closeRelaySocket");
        assert!(matches!(
            "eval".parse::<PeerMethod>(),
            Err(TetherError::MethodNotFound(_))
        ));
        assert_eq!("peerRpc".parse::<ServerMethod>().unwrap(), ServerMethod::PeerRpc);
    }

    #[test]
    fn test_first_param() {
        let params = vec![json!({"socketId": "s1", "port": 22, "hostName": "alice.example.com"})];
        let parsed: ConnectSocketParams = first_param(&params).unwrap();
        assert_eq!(parsed.port, 22);
        assert!(parsed.password.is_none());
        assert!(first_param::<ConnectSocketParams>(&[]).is_err());
    }
}
