//! Web Handler
//!
//! Collaborator seam for `web/<host>/<socketId>/<action>` traffic, the
//! plain HTTP requests the broker front-end proxies to this host.

use async_trait::async_trait;
use bytes::Bytes;

/// One publication on a `web/...` topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebRequest {
    pub host: String,
    pub socket_id: String,
    pub action: String,
    pub payload: Bytes,
}

#[async_trait]
pub trait WebHandler: Send + Sync {
    async fn handle_request(&self, request: WebRequest);

    /// Called once when the client shuts down
    async fn end(&self) {}
}
