//! HTTP fallback against a real endpoint
//!
//! Serves `POST /_hs/rpc` with axum and checks that packets reach it when
//! the broker has no route to the remote host.

use axum::Router;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, extract::State};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_core::{HttpFallback, MemoryHub, PeerRpcRequest, RelayTransport, RpcEnvelope};
use tokio::net::TcpListener;

type Seen = Arc<Mutex<Vec<PeerRpcRequest>>>;

async fn answer_ping(
    State(seen): State<Seen>,
    Json(packet): Json<PeerRpcRequest>,
) -> Json<RpcEnvelope> {
    let id = packet.msg.id.clone().unwrap_or_default();
    let greeting = packet.msg.params.first().cloned().unwrap_or(json!("hello"));
    seen.lock().unwrap().push(packet);
    Json(RpcEnvelope::reply(
        id,
        json!(format!("{} back atcha", greeting.as_str().unwrap_or("?"))),
    ))
}

async fn serve(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn ping_packet(to_host: &str) -> PeerRpcRequest {
    PeerRpcRequest {
        msg: RpcEnvelope::request("call-1", "ping", vec![json!("hi")]),
        my_auth: Some("alice-token".into()),
        to_host: to_host.to_string(),
        from_host: "alice.test".into(),
    }
}

fn fallback() -> HttpFallback {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
    HttpFallback::new("http", "_hs", Duration::from_secs(2)).unwrap()
}

#[tokio::test]
async fn test_post_rpc_returns_reply() {
    let seen: Seen = Arc::default();
    let addr = serve(
        Router::new()
            .route("/_hs/rpc", post(answer_ping))
            .with_state(seen.clone()),
    )
    .await;

    let reply = fallback()
        .post_rpc(&ping_packet(&addr.to_string()))
        .await
        .unwrap()
        .expect("reply envelope");

    assert_eq!(reply.id.as_deref(), Some("call-1"));
    assert_eq!(reply.into_outcome().unwrap(), json!("hi back atcha"));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].my_auth.as_deref(), Some("alice-token"));
    assert_eq!(seen[0].from_host, "alice.test");
}

#[tokio::test]
async fn test_post_rpc_empty_body_is_no_reply() {
    let addr = serve(Router::new().route("/_hs/rpc", post(|| async { StatusCode::OK }))).await;

    let reply = fallback()
        .post_rpc(&ping_packet(&addr.to_string()))
        .await
        .unwrap();
    assert!(reply.is_none());
}

#[tokio::test]
async fn test_post_rpc_error_status_fails() {
    let addr = serve(Router::new().route(
        "/_hs/rpc",
        post(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
    ))
    .await;

    let result = fallback().post_rpc(&ping_packet(&addr.to_string())).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_relay_uses_http_without_push_path() {
    let seen: Seen = Arc::default();
    let addr = serve(
        Router::new()
            .route("/_hs/rpc", post(answer_ping))
            .with_state(seen.clone()),
    )
    .await;

    // nobody on the hub subscribes for the remote host
    let hub = MemoryHub::new();
    let relay = RelayTransport::new(
        Arc::new(hub.connect("alice.test")),
        fallback(),
        "alice.test",
        addr.to_string(),
    );
    assert!(!relay.has_push_path());

    let reply = relay
        .send_packet(&ping_packet(&addr.to_string()))
        .await
        .unwrap()
        .expect("reply over http");
    assert_eq!(reply.into_outcome().unwrap(), json!("hi back atcha"));
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_relay_posts_to_configured_endpoint() {
    let seen: Seen = Arc::default();
    let addr = serve(
        Router::new()
            .route("/_hs/rpc", post(answer_ping))
            .with_state(seen.clone()),
    )
    .await;

    // the peer is known by name; the endpoint keeps the port it was configured with
    let hub = MemoryHub::new();
    let relay = RelayTransport::new(
        Arc::new(hub.connect("alice.test")),
        fallback(),
        "alice.test",
        "bob.test",
    );
    assert_eq!(relay.endpoint(), "bob.test");
    relay.set_endpoint(&format!("http://{}", addr));

    let reply = relay
        .send_packet(&ping_packet("bob.test"))
        .await
        .unwrap()
        .expect("reply over http");
    assert_eq!(reply.into_outcome().unwrap(), json!("hi back atcha"));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].to_host, "bob.test");
}
