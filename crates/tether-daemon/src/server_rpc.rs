//! Server RPC
//!
//! Requests from the broker's HTTP front-end, published on
//! `msg/<me>/<server>/srpc` and answered on `msg/<server>/<me>/srpc`.
//! `peerRpc` is the inbound half of the HTTP fallback: the forwarded packet
//! goes through the same auth gate as relay traffic. Requests from any
//! sender other than the configured server are dropped before they get here.

use bytes::Bytes;
use serde_json::{Value, json};
use std::sync::Arc;
use tether_core::host::normalize_host;
use tether_core::protocol::{AddSocketListenerParams, AddSocketRelayParams, first_param};
use tether_core::{
    Action, Origin, PeerRpcRequest, RpcEnvelope, RpcError, ServerMethod, TetherError, Topic,
};
use tracing::{debug, info, warn};

use crate::client::ClientContext;

/// Handles one `srpc` publication and publishes the reply
pub(crate) async fn handle(ctx: Arc<ClientContext>, server: String, payload: Bytes) {
    let envelope = match RpcEnvelope::from_json(&payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Malformed srpc message from {}: {}", server, e);
            return;
        }
    };
    if !envelope.is_request() && !envelope.is_notification() {
        debug!("Ignoring srpc reply from {}", server);
        return;
    }

    let RpcEnvelope {
        id, method, params, ..
    } = envelope;
    let name = method.unwrap_or_default();
    let outcome = invoke(&ctx, &name, params).await;

    let Some(id) = id else {
        if let Err(err) = outcome {
            debug!("srpc notification {} failed: {}", name, err);
        }
        return;
    };
    let reply = match outcome {
        Ok(result) => RpcEnvelope::reply(id, result),
        Err(err) => RpcEnvelope::error_reply(id, err),
    };

    let topic = Topic::msg(&server, &ctx.my_host, Action::Srpc).to_string();
    let published = match reply.to_json() {
        Ok(body) => ctx.broker.publish(&topic, Bytes::from(body)).await,
        Err(e) => Err(e),
    };
    if let Err(e) = published {
        warn!("Failed to answer srpc {} from {}: {}", name, server, e);
    }
}

async fn invoke(ctx: &Arc<ClientContext>, name: &str, params: Vec<Value>) -> Result<Value, RpcError> {
    let method: ServerMethod = name.parse().map_err(|_| RpcError::method_not_found(name))?;
    debug!("↓ srpc {}", method.as_str());

    match method {
        ServerMethod::Ping => {
            let greeting = params.first().and_then(Value::as_str).unwrap_or("hello");
            Ok(json!(format!("{} back atcha from client.", greeting)))
        }
        ServerMethod::PeerRpc => {
            let packet: PeerRpcRequest = first_param(&params)?;
            peer_rpc(ctx, packet).await
        }
        ServerMethod::GetSocketListeners => Ok(serde_json::to_value(ctx.listeners.list())
            .map_err(TetherError::from)?),
        ServerMethod::GetSocketRelays => Ok(serde_json::to_value(ctx.relays.list())
            .map_err(TetherError::from)?),
        ServerMethod::AddSocketListener => {
            let request: AddSocketListenerParams = first_param(&params)?;
            let handle = ctx.listeners.add(ctx, request.into()).await?;
            info!("Server added listener on port {}", handle.local_port());
            Ok(serde_json::to_value(ctx.listeners.list()).map_err(TetherError::from)?)
        }
        ServerMethod::AddSocketRelay => {
            let request: AddSocketRelayParams = first_param(&params)?;
            let relay = ctx.relays.add(request.into());
            info!("Server added relay on port {}", relay.port);
            Ok(serde_json::to_value(ctx.relays.list()).map_err(TetherError::from)?)
        }
    }
}

/// Runs a forwarded HTTP fallback packet and returns the reply envelope
async fn peer_rpc(ctx: &Arc<ClientContext>, packet: PeerRpcRequest) -> Result<Value, RpcError> {
    if normalize_host(&packet.to_host) != ctx.my_host {
        return Err(TetherError::InvalidHost(format!(
            "packet addressed to {}",
            packet.to_host
        ))
        .into());
    }
    let peer = ctx.peers.get_or_create(ctx, &packet.from_host)?;

    match peer.receive_packet(ctx, Origin::Server, packet).await {
        Some(reply) => Ok(serde_json::to_value(reply).map_err(TetherError::from)?),
        None => Ok(Value::Null),
    }
}
