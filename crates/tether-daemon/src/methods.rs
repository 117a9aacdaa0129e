//! Peer Methods
//!
//! The method table a remote host may call on this client.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde_json::{Value, json};
use std::sync::Arc;
use tether_core::error::CODE_INTERNAL;
use tether_core::protocol::{
    CloseSocketParams, ConnectSocketParams, SocketDataParams, first_param,
};
use tether_core::{PeerMethod, RpcError, RpcHandler, Signal, TetherError};
use tracing::debug;

use crate::client::ClientContext;
use crate::peer::Peer;

/// Who is calling, and the client serving the call
pub struct CallContext {
    pub peer: Arc<Peer>,
    pub client: Arc<ClientContext>,
}

#[derive(Debug, Default)]
pub struct PeerMethods;

#[async_trait]
impl RpcHandler<CallContext> for PeerMethods {
    async fn handle(
        &self,
        ctx: &CallContext,
        method: PeerMethod,
        params: Vec<Value>,
    ) -> Result<Value, RpcError> {
        match method {
            PeerMethod::Ping => {
                let greeting = params
                    .first()
                    .and_then(Value::as_str)
                    .unwrap_or("hello");
                Ok(json!(format!(
                    "{} back atcha, {}.",
                    greeting, ctx.client.my_host
                )))
            }

            PeerMethod::RtcSignal => {
                if !ctx.client.config.use_rtc {
                    return Err(RpcError::new(CODE_INTERNAL, "data channels disabled"));
                }
                let signal: Signal = first_param(&params)?;
                ctx.peer.negotiator().handle_signal(signal).await?;
                Ok(json!("rtcSignal ok"))
            }

            PeerMethod::ConnectSocket => {
                let request: ConnectSocketParams = first_param(&params)?;
                let result = ctx
                    .client
                    .relays
                    .connect_socket(&ctx.client, &ctx.peer, request)
                    .await?;
                Ok(serde_json::to_value(result).map_err(TetherError::from)?)
            }

            PeerMethod::ReceiveListenerData | PeerMethod::ReceiveRelayData => {
                let request: SocketDataParams = first_param(&params)?;
                let data = BASE64
                    .decode(request.data.as_bytes())
                    .map_err(|e| TetherError::InvalidParams(e.to_string()))?;
                ctx.client
                    .sockets
                    .write(ctx.peer.host_name(), &request.socket_id, Bytes::from(data))
                    .await;
                Ok(json!("ok"))
            }

            PeerMethod::CloseListenerSocket | PeerMethod::CloseRelaySocket => {
                let request: CloseSocketParams = first_param(&params)?;
                debug!(
                    "{} closed socket {}",
                    ctx.peer.host_name(),
                    request.socket_id
                );
                ctx.client
                    .sockets
                    .close_from(ctx.peer.host_name(), &request.socket_id);
                Ok(json!("ok"))
            }
        }
    }
}
