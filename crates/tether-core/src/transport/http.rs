//! HTTP fallback transport
//!
//! Used when no push path to the remote host exists: the authenticated
//! packet is POSTed to the remote host's well-known RPC endpoint and the
//! response body is the reply envelope.

use std::time::Duration;
use tracing::debug;

use crate::error::{Result, TetherError};
use crate::protocol::{PeerRpcRequest, RpcEnvelope};

/// Client for `POST <scheme>://<host>/<base>/rpc`
#[derive(Clone)]
pub struct HttpFallback {
    client: reqwest::Client,
    scheme: String,
    base_path: String,
}

impl HttpFallback {
    pub fn new(scheme: impl Into<String>, base_path: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            scheme: scheme.into(),
            base_path: base_path.into().trim_matches('/').to_string(),
        })
    }

    /// Endpoint for a host; hosts given as full urls keep their scheme
    pub fn rpc_url(&self, host: &str) -> String {
        let host = host.trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            format!("{}/{}/rpc", host, self.base_path)
        } else {
            format!("{}://{}/{}/rpc", self.scheme, host, self.base_path)
        }
    }

    /// Posts one packet to its `to_host`
    pub async fn post_rpc(&self, packet: &PeerRpcRequest) -> Result<Option<RpcEnvelope>> {
        self.post_rpc_to(&packet.to_host, packet).await
    }

    /// Posts one packet to `endpoint`, a host, `host:port` or url
    ///
    /// Returns the reply envelope when the body has one.
    pub async fn post_rpc_to(&self, endpoint: &str, packet: &PeerRpcRequest) -> Result<Option<RpcEnvelope>> {
        let url = self.rpc_url(endpoint);
        debug!(
            "↑ REST {} {}",
            url,
            packet.msg.method.as_deref().unwrap_or("reply")
        );

        let response = self.client.post(&url).json(packet).send().await?;
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(TetherError::Http(format!("{} returned {}", url, status)));
        }

        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(None);
        }
        RpcEnvelope::from_json(&body).map(Some)
    }
}
