//! End-to-end tunnel tests
//!
//! Two clients share an in-memory broker and an in-memory data-channel
//! stack; the tunnels themselves run over real loopback TCP sockets.
//!
//! Data path:
//! TCP client -> alice listener -> (relay | data channel) -> bob relay -> echo server

use async_trait::async_trait;
use axum::Router;
use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tether_core::{
    Broker, ListenerConfig, MemoryBroker, MemoryHub, MemoryRtc, PeerRpcRequest, RelayConfig,
    RpcEnvelope, TetherConfig, TetherError, TransportState,
};
use tether_daemon::{ClientEvent, Peer, TunnelClient, WebHandler, WebRequest};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn start_client(
    hub: &MemoryHub,
    rtc: &MemoryRtc,
    host: &str,
    use_rtc: bool,
) -> (TunnelClient, mpsc::Receiver<ClientEvent>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,tether_core=debug,tether_daemon=debug")
        .with_test_writer()
        .try_init();

    let config = TetherConfig::new()
        .with_host_name(host)
        .with_rtc(use_rtc)
        .with_rpc_timeout_ms(2_000)
        .with_negotiation_timeout_ms(2_000);
    let mut client =
        TunnelClient::new(config, Arc::new(hub.connect(host)), Arc::new(rtc.clone()))
            .unwrap();
    let events = client.take_event_receiver().unwrap();
    client.start().await.unwrap();
    (client, events)
}

/// Echo server that copies every connection back to itself
async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = socket.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

/// alice listens locally and forwards to bob, whose relay reaches the echo server
async fn tunnel_pair(
    use_rtc: bool,
) -> (
    MemoryRtc,
    (TunnelClient, mpsc::Receiver<ClientEvent>),
    (TunnelClient, mpsc::Receiver<ClientEvent>),
    SocketAddr,
) {
    let hub = MemoryHub::new();
    let rtc = MemoryRtc::new();
    let alice = start_client(&hub, &rtc, "alice.test", use_rtc).await;
    let bob = start_client(&hub, &rtc, "bob.test", use_rtc).await;

    let echo = start_echo_server().await;
    bob.0
        .add_socket_relay(RelayConfig::new(echo.port()).with_target("127.0.0.1", echo.port()));
    let handle = alice
        .0
        .add_socket_listener(ListenerConfig::new(0, "bob.test").with_target_port(echo.port()))
        .await
        .unwrap();

    (rtc, alice, bob, handle.local_addr())
}

async fn round_trip(stream: &mut TcpStream, message: &[u8]) -> Vec<u8> {
    stream.write_all(message).await.unwrap();
    let mut buf = vec![0u8; message.len()];
    timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    buf
}

async fn next_event<F>(events: &mut mpsc::Receiver<ClientEvent>, wanted: F) -> ClientEvent
where
    F: Fn(&ClientEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(event) if wanted(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn eventually<F: Fn() -> bool>(check: F) {
    timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition never held");
}

async fn rpc_error_code(peer: &Peer, method: &str, params: Vec<Value>) -> i64 {
    match peer.call(method, params).await {
        Err(TetherError::Rpc(err)) => err.code,
        other => panic!("expected a remote error, got {:?}", other),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tunnels
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tunnel_over_relay() {
    let (_rtc, (alice, _), (bob, _), listen_addr) = tunnel_pair(false).await;

    let mut stream = TcpStream::connect(listen_addr).await.unwrap();
    assert_eq!(round_trip(&mut stream, b"hello tether").await, b"hello tether");
    assert_eq!(round_trip(&mut stream, b"again").await, b"again");

    let peer = alice.peer("bob.test").expect("peer created by listener");
    assert!(matches!(peer.transport(), TransportState::RelayOnly));
    assert_eq!(alice.socket_count(), 1);
    assert_eq!(bob.socket_count(), 1);
    assert!(alice.stats().get_total_sockets() >= 1);

    // closing the client tears down both ends
    drop(stream);
    eventually(|| alice.socket_count() == 0 && bob.socket_count() == 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_large_payload_keeps_order() {
    let (_rtc, (_alice, _), (_bob, _), listen_addr) = tunnel_pair(false).await;

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let stream = TcpStream::connect(listen_addr).await.unwrap();
    let (mut rd, mut wr) = stream.into_split();

    let outbound = payload.clone();
    let writer = tokio::spawn(async move {
        wr.write_all(&outbound).await.unwrap();
        wr
    });

    let mut received = vec![0u8; payload.len()];
    timeout(Duration::from_secs(10), rd.read_exact(&mut received))
        .await
        .expect("payload timed out")
        .unwrap();
    assert_eq!(received, payload);
    let _ = writer.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tunnel_over_data_channel() {
    let (rtc, (alice, mut alice_events), (bob, mut bob_events), listen_addr) =
        tunnel_pair(true).await;

    let mut stream = TcpStream::connect(listen_addr).await.unwrap();
    assert_eq!(round_trip(&mut stream, b"over the channel").await, b"over the channel");

    let peer = alice.peer("bob.test").unwrap();
    assert!(matches!(peer.transport(), TransportState::DataChannel(_)));
    next_event(&mut alice_events, |e| {
        matches!(e, ClientEvent::RtcStateChanged { host, state } if host == "bob.test" && state.as_str() == "connected")
    })
    .await;

    // application json rides the channel
    peer.send_json(&json!({ "kind": "hello" })).await.unwrap();
    let event = next_event(&mut bob_events, |e| matches!(e, ClientEvent::Json { .. })).await;
    match event {
        ClientEvent::Json { from, msg } => {
            assert_eq!(from, "alice.test");
            assert_eq!(msg["kind"], "hello");
        }
        _ => unreachable!(),
    }

    // losing the channel closes every socket that rode it
    rtc.sever_all();
    let mut buf = [0u8; 16];
    let read = timeout(WAIT, stream.read(&mut buf)).await.expect("socket stayed open");
    assert!(matches!(read, Ok(0) | Err(_)));
    eventually(|| alice.socket_count() == 0 && bob.socket_count() == 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_refused_negotiation_falls_back_to_relay() {
    let hub = MemoryHub::new();
    let rtc = MemoryRtc::new();
    let (alice, _) = start_client(&hub, &rtc, "alice.test", true).await;
    let (bob, _) = start_client(&hub, &rtc, "bob.test", false).await;

    let echo = start_echo_server().await;
    bob.add_socket_relay(RelayConfig::new(echo.port()).with_target("127.0.0.1", echo.port()));
    let listen_addr = alice
        .add_socket_listener(ListenerConfig::new(0, "bob.test").with_target_port(echo.port()))
        .await
        .unwrap()
        .local_addr();

    // bob refuses rtcSignal, so each connection fails fast instead of
    // waiting out the negotiation timeout
    for message in [&b"first"[..], &b"second"[..]] {
        let started = std::time::Instant::now();
        let mut stream = TcpStream::connect(listen_addr).await.unwrap();
        assert_eq!(round_trip(&mut stream, message).await, message);
        assert!(started.elapsed() < Duration::from_secs(2));

        let peer = alice.peer("bob.test").unwrap();
        assert_eq!(peer.rtc_state().as_str(), "failed");
        assert!(matches!(peer.transport(), TransportState::RelayOnly));
    }
}

/// Stand-in for the broker's HTTP front-end: each `POST /_hs/rpc` is
/// forwarded to its `to_host` as an `srpc` `peerRpc` and the inner reply
/// becomes the response body
#[derive(Clone)]
struct FrontEnd {
    servers: Arc<HashMap<String, MemoryBroker>>,
    next_id: Arc<AtomicU64>,
}

async fn forward_rpc(State(front): State<FrontEnd>, Json(packet): Json<PeerRpcRequest>) -> Response {
    let Some(server) = front.servers.get(&packet.to_host) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let id = format!("fwd-{}", front.next_id.fetch_add(1, Ordering::SeqCst));
    let mut replies = server
        .subscribe(&format!("msg/server/{}/srpc", packet.to_host))
        .await
        .unwrap();
    let request = RpcEnvelope::request(id.as_str(), "peerRpc", vec![serde_json::to_value(&packet).unwrap()]);
    server
        .publish(
            &format!("msg/{}/server/srpc", packet.to_host),
            request.to_json().unwrap().into(),
        )
        .await
        .unwrap();

    let reply = loop {
        let message = replies.recv().await.expect("subscription closed");
        let reply = RpcEnvelope::from_json(&message.payload).unwrap();
        if reply.id.as_deref() == Some(id.as_str()) {
            break reply;
        }
    };
    match reply.into_outcome() {
        Ok(Value::Null) => StatusCode::OK.into_response(),
        Ok(inner) => Json(inner).into_response(),
        Err(_) => StatusCode::BAD_GATEWAY.into_response(),
    }
}

async fn serve_front_end(servers: HashMap<String, MemoryBroker>) -> SocketAddr {
    let front = FrontEnd {
        servers: Arc::new(servers),
        next_id: Arc::default(),
    };
    let router = Router::new()
        .route("/_hs/rpc", post(forward_rpc))
        .with_state(front);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tunnel_over_http_fallback() {
    // separate brokers: neither side can push to the other
    let hub_a = MemoryHub::new();
    let hub_b = MemoryHub::new();
    let rtc = MemoryRtc::new();
    let (alice, _) = start_client(&hub_a, &rtc, "alice.test", false).await;
    let (bob, _) = start_client(&hub_b, &rtc, "bob.test", false).await;

    let front = serve_front_end(HashMap::from([
        ("alice.test".to_string(), hub_a.connect("server")),
        ("bob.test".to_string(), hub_b.connect("server")),
    ]))
    .await;
    let endpoint = format!("http://{}", front);
    let to_bob = alice.get_peer("bob.test").unwrap();
    to_bob.relay().set_endpoint(&endpoint);
    bob.get_peer("alice.test").unwrap().relay().set_endpoint(&endpoint);

    let echo = start_echo_server().await;
    bob.add_socket_relay(RelayConfig::new(echo.port()).with_target("127.0.0.1", echo.port()));
    let listen_addr = alice
        .add_socket_listener(ListenerConfig::new(0, "bob.test").with_target_port(echo.port()))
        .await
        .unwrap()
        .local_addr();

    // bytes travel as base64 receiveListenerData / receiveRelayData calls
    let mut stream = TcpStream::connect(listen_addr).await.unwrap();
    assert_eq!(round_trip(&mut stream, b"over http").await, b"over http");
    let binary: Vec<u8> = (0..=255u8).collect();
    assert_eq!(round_trip(&mut stream, &binary).await, binary);

    assert!(!to_bob.relay().has_push_path());
    assert!(matches!(to_bob.transport(), TransportState::RelayOnly));
    assert_eq!(alice.socket_count(), 1);
    assert_eq!(bob.socket_count(), 1);

    drop(stream);
    eventually(|| alice.socket_count() == 0 && bob.socket_count() == 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_listener_target_url_sets_fallback_endpoint() {
    let hub = MemoryHub::new();
    let rtc = MemoryRtc::new();
    let (alice, _) = start_client(&hub, &rtc, "alice.test", false).await;
    let (bob, _) = start_client(&hub, &rtc, "bob.test", false).await;

    let echo = start_echo_server().await;
    bob.add_socket_relay(RelayConfig::new(echo.port()).with_target("127.0.0.1", echo.port()));
    let listen_addr = alice
        .add_socket_listener(
            ListenerConfig::new(0, "https://bob.test:8443/").with_target_port(echo.port()),
        )
        .await
        .unwrap()
        .local_addr();
    assert_eq!(alice.get_socket_listeners()[0].target_host, "bob.test");

    let mut stream = TcpStream::connect(listen_addr).await.unwrap();
    assert_eq!(round_trip(&mut stream, b"ping").await, b"ping");

    // the peer keeps its plain name; only the HTTP fallback uses the url
    let peer = alice.peer("bob.test").unwrap();
    assert_eq!(peer.relay().remote_host(), "bob.test");
    assert_eq!(peer.relay().endpoint(), "https://bob.test:8443");
}

#[tokio::test]
async fn test_listener_rejects_self_loop() {
    let hub = MemoryHub::new();
    let rtc = MemoryRtc::new();
    let (alice, _) = start_client(&hub, &rtc, "alice.test", false).await;

    for target in ["alice.test", "localhost", "ALICE.test/"] {
        let result = alice
            .add_socket_listener(ListenerConfig::new(0, target).with_target_port(80))
            .await;
        assert!(
            matches!(result, Err(TetherError::SelfLoop(_))),
            "{} was accepted",
            target
        );
    }
    assert!(alice.get_socket_listeners().is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// connectSocket checks
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_socket_checks() {
    let hub = MemoryHub::new();
    let rtc = MemoryRtc::new();
    let (alice, _) = start_client(&hub, &rtc, "alice.test", false).await;
    let (bob, _) = start_client(&hub, &rtc, "bob.test", false).await;
    let echo = start_echo_server().await;

    bob.add_socket_relay(RelayConfig::new(7001).with_whitelist(&["*.example.com"]));
    bob.add_socket_relay(
        RelayConfig::new(7002)
            .with_target("127.0.0.1", echo.port())
            .with_password("pw"),
    );
    bob.add_socket_relay(RelayConfig::new(7004).with_target("127.0.0.1", echo.port()));

    let peer = alice.get_peer("bob.test").unwrap();
    let params = |id: &str, port: u16| json!({ "socketId": id, "port": port, "hostName": "alice.test" });

    assert_eq!(rpc_error_code(&peer, "connectSocket", vec![params("s1", 7001)]).await, 403);
    assert_eq!(rpc_error_code(&peer, "connectSocket", vec![params("s2", 7002)]).await, 401);
    assert_eq!(rpc_error_code(&peer, "connectSocket", vec![params("s3", 7003)]).await, 500);

    let mut with_password = params("s4", 7002);
    with_password["password"] = json!("pw");
    let result = peer.call("connectSocket", vec![with_password]).await.unwrap();
    assert_eq!(result["socketId"], "s4");
    assert_eq!(result["targetPort"], echo.port());

    peer.call("connectSocket", vec![params("dup", 7004)]).await.unwrap();
    assert_eq!(rpc_error_code(&peer, "connectSocket", vec![params("dup", 7004)]).await, 409);
    assert_eq!(bob.socket_count(), 2);
}

// ─────────────────────────────────────────────────────────────────────────────
// Peer RPC
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_ping_and_unknown_method() {
    let hub = MemoryHub::new();
    let rtc = MemoryRtc::new();
    let (alice, _) = start_client(&hub, &rtc, "alice.test", false).await;
    let (_bob, _) = start_client(&hub, &rtc, "bob.test", false).await;

    let peer = alice.get_peer("bob.test").unwrap();
    assert_eq!(peer.ping("hi").await.unwrap(), "hi back atcha, bob.test.");
    assert_eq!(rpc_error_code(&peer, "noSuchMethod", vec![]).await, -32601);
}

#[tokio::test]
async fn test_forged_token_is_rejected() {
    let hub = MemoryHub::new();
    let rtc = MemoryRtc::new();
    let (alice, _) = start_client(&hub, &rtc, "alice.test", false).await;
    let (_bob, _) = start_client(&hub, &rtc, "bob.test", false).await;

    // bob pins alice's token on first contact
    let peer = alice.get_peer("bob.test").unwrap();
    peer.ping("hi").await.unwrap();

    let forger = hub.connect("alice.test");
    let mut replies = forger.subscribe("msg/alice.test/bob.test/rpc").await.unwrap();
    let packet = PeerRpcRequest {
        msg: RpcEnvelope::request("forged-1", "ping", vec![json!("hi")]),
        my_auth: Some("not-alices-token".into()),
        to_host: "bob.test".into(),
        from_host: "alice.test".into(),
    };
    forger
        .publish(
            "msg/bob.test/alice.test/rpc",
            packet.to_json().unwrap().into(),
        )
        .await
        .unwrap();

    let reply = timeout(WAIT, async {
        loop {
            let message = replies.recv().await.expect("subscription closed");
            let packet = PeerRpcRequest::from_json(&message.payload).unwrap();
            if packet.msg.id.as_deref() == Some("forged-1") {
                return packet.msg;
            }
        }
    })
    .await
    .expect("no reply to forged call");
    assert_eq!(reply.error.expect("error reply").code, 401);

    // the real peer is unaffected
    assert_eq!(peer.ping("still").await.unwrap(), "still back atcha, bob.test.");
}

#[tokio::test]
async fn test_json_messages() {
    let hub = MemoryHub::new();
    let rtc = MemoryRtc::new();
    let (alice, _) = start_client(&hub, &rtc, "alice.test", false).await;
    let (_bob, mut bob_events) = start_client(&hub, &rtc, "bob.test", false).await;

    alice
        .publish_json("bob.test", &json!({ "kind": "status", "ok": true }))
        .await
        .unwrap();
    let event = next_event(&mut bob_events, |e| matches!(e, ClientEvent::Json { .. })).await;
    match event {
        ClientEvent::Json { from, msg } => {
            assert_eq!(from, "alice.test");
            assert_eq!(msg["ok"], true);
        }
        _ => unreachable!(),
    }

    let peer = alice.get_peer("bob.test").unwrap();
    assert!(matches!(
        peer.send_json(&json!({ "kind": "x" })).await,
        Err(TetherError::PeerNotConnected(_))
    ));
    assert!(matches!(
        peer.send_json(&json!([1, 2])).await,
        Err(TetherError::InvalidParams(_))
    ));
}

// ─────────────────────────────────────────────────────────────────────────────
// Server RPC
// ─────────────────────────────────────────────────────────────────────────────

async fn server_call(
    server: &tether_core::MemoryBroker,
    replies: &mut mpsc::UnboundedReceiver<tether_core::BrokerMessage>,
    id: &str,
    method: &str,
    params: Vec<Value>,
) -> RpcEnvelope {
    let request = RpcEnvelope::request(id, method, params);
    server
        .publish("msg/alice.test/server/srpc", request.to_json().unwrap().into())
        .await
        .unwrap();
    timeout(WAIT, async {
        loop {
            let message = replies.recv().await.expect("subscription closed");
            let reply = RpcEnvelope::from_json(&message.payload).unwrap();
            if reply.id.as_deref() == Some(id) {
                return reply;
            }
        }
    })
    .await
    .expect("no srpc reply")
}

#[tokio::test]
async fn test_server_rpc() {
    let hub = MemoryHub::new();
    let rtc = MemoryRtc::new();
    let (alice, _) = start_client(&hub, &rtc, "alice.test", false).await;
    alice.add_socket_relay(RelayConfig::new(8080).with_password("pw"));

    let server = hub.connect("server");
    let mut replies = server.subscribe("msg/server/alice.test/srpc").await.unwrap();

    let reply = server_call(&server, &mut replies, "s1", "ping", vec![json!("hey")]).await;
    assert_eq!(reply.into_outcome().unwrap(), "hey back atcha from client.");

    let reply = server_call(&server, &mut replies, "s2", "getSocketRelays", vec![]).await;
    let relays = reply.into_outcome().unwrap();
    assert_eq!(relays[0]["port"], 8080);
    assert_eq!(relays[0]["hasPassword"], true);

    let reply = server_call(&server, &mut replies, "s3", "getSocketListeners", vec![]).await;
    assert_eq!(reply.into_outcome().unwrap(), json!([]));

    // forwarded HTTP fallback packet
    let packet = PeerRpcRequest {
        msg: RpcEnvelope::request("p1", "ping", vec![json!("yo")]),
        my_auth: Some("bob-token".into()),
        to_host: "alice.test".into(),
        from_host: "bob.test".into(),
    };
    let reply = server_call(
        &server,
        &mut replies,
        "s4",
        "peerRpc",
        vec![serde_json::to_value(&packet).unwrap()],
    )
    .await;
    let inner = reply.into_outcome().unwrap();
    assert_eq!(inner["id"], "p1");
    assert_eq!(inner["result"], "yo back atcha, alice.test.");

    // the token seen first is now pinned
    let mut forged = packet.clone();
    forged.msg = RpcEnvelope::request("p2", "ping", vec![json!("yo")]);
    forged.my_auth = Some("someone-else".into());
    let reply = server_call(
        &server,
        &mut replies,
        "s5",
        "peerRpc",
        vec![serde_json::to_value(&forged).unwrap()],
    )
    .await;
    let inner = reply.into_outcome().unwrap();
    assert_eq!(inner["error"]["code"], 401);

    let reply = server_call(&server, &mut replies, "s6", "dropTables", vec![]).await;
    assert_eq!(reply.error.unwrap().code, -32601);
}

#[tokio::test]
async fn test_server_adds_listeners_and_relays() {
    let hub = MemoryHub::new();
    let rtc = MemoryRtc::new();
    let (alice, _) = start_client(&hub, &rtc, "alice.test", false).await;

    let server = hub.connect("server");
    let mut replies = server.subscribe("msg/server/alice.test/srpc").await.unwrap();

    let reply = server_call(
        &server,
        &mut replies,
        "a1",
        "addSocketRelay",
        vec![json!({ "port": 9090, "targetPort": 9091, "whitelist": ["*.test"] })],
    )
    .await;
    let relays = reply.into_outcome().unwrap();
    assert_eq!(relays[0]["port"], 9090);
    assert_eq!(relays[0]["targetHost"], "localhost");
    assert_eq!(relays[0]["targetPort"], 9091);
    assert_eq!(relays[0]["whitelist"], json!(["*.test"]));
    assert_eq!(alice.get_socket_relays().len(), 1);

    let reply = server_call(
        &server,
        &mut replies,
        "a2",
        "addSocketListener",
        vec![json!({ "port": 0, "targetHost": "bob.test", "targetPort": 9090 })],
    )
    .await;
    let listeners = reply.into_outcome().unwrap();
    assert_eq!(listeners.as_array().unwrap().len(), 1);
    assert_eq!(listeners[0]["targetHost"], "bob.test");
    assert_eq!(listeners[0]["targetPort"], 9090);
    assert_eq!(alice.get_socket_listeners().len(), 1);

    // a listener pointing back at this client is refused
    let reply = server_call(
        &server,
        &mut replies,
        "a3",
        "addSocketListener",
        vec![json!({ "port": 0, "targetHost": "alice.test" })],
    )
    .await;
    assert!(reply.error.is_some());
    assert_eq!(alice.get_socket_listeners().len(), 1);

    let reply = server_call(&server, &mut replies, "a4", "addSocketRelay", vec![json!({})]).await;
    assert_eq!(reply.error.unwrap().code, -32602);
}

#[tokio::test]
async fn test_srpc_only_from_server() {
    let hub = MemoryHub::new();
    let rtc = MemoryRtc::new();
    let (alice, _) = start_client(&hub, &rtc, "alice.test", false).await;

    let mallory = hub.connect("mallory.test");
    let mut replies = mallory.subscribe("msg/mallory.test/#").await.unwrap();

    let request = RpcEnvelope::request(
        "m1",
        "addSocketRelay",
        vec![json!({ "port": 22, "targetHost": "127.0.0.1" })],
    );
    mallory
        .publish("msg/alice.test/mallory.test/srpc", request.to_json().unwrap().into())
        .await
        .unwrap();

    // the real server still gets answers, so alice is listening
    let server = hub.connect("server");
    let mut server_replies = server.subscribe("msg/server/alice.test/srpc").await.unwrap();
    let reply = server_call(&server, &mut server_replies, "s1", "ping", vec![json!("hey")]).await;
    assert!(reply.error.is_none());

    assert!(alice.get_socket_relays().is_empty());
    assert!(
        timeout(Duration::from_millis(200), replies.recv()).await.is_err(),
        "mallory got an srpc reply"
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_peer_lookup_and_eviction() {
    let hub = MemoryHub::new();
    let rtc = MemoryRtc::new();
    let (alice, mut events) = start_client(&hub, &rtc, "alice.test", false).await;

    assert!(matches!(alice.get_peer(""), Err(TetherError::InvalidHost(_))));
    assert!(matches!(alice.get_peer("Alice.Test"), Err(TetherError::SelfLoop(_))));

    let bob = alice.get_peer("BOB.test").unwrap();
    assert_eq!(bob.host_name(), "bob.test");
    assert!(Arc::ptr_eq(&bob, &alice.get_peer("bob.test").unwrap()));

    let carol = alice.get_temporary_peer("carol.test").unwrap();
    assert!(carol.is_temporary());

    let evicted = alice.evict_idle_peers().await;
    assert_eq!(evicted, vec!["carol.test".to_string()]);
    assert!(carol.is_closed());
    assert!(alice.peer("carol.test").is_none());
    assert!(alice.peer("bob.test").is_some());

    next_event(&mut events, |e| matches!(e, ClientEvent::PeerEvicted { host } if host == "carol.test")).await;
}

#[tokio::test]
async fn test_connect_needs_a_reachable_broker() {
    let config = TetherConfig::new()
        .with_host_name("alice.test")
        .with_broker_url("mqtt://127.0.0.1:9")
        .with_broker_secret("secret");
    let result = TunnelClient::connect(config, Arc::new(MemoryRtc::new())).await;
    assert!(matches!(result, Err(TetherError::Broker(_))));

    let config = TetherConfig::new()
        .with_host_name("alice.test")
        .with_broker_url("ftp://broker.test");
    let result = TunnelClient::connect(config, Arc::new(MemoryRtc::new())).await;
    assert!(matches!(result, Err(TetherError::ConfigError(_))));
}

#[tokio::test]
async fn test_shutdown_ends_listeners() {
    let hub = MemoryHub::new();
    let rtc = MemoryRtc::new();
    let (mut alice, mut events) = start_client(&hub, &rtc, "alice.test", false).await;

    let handle = alice
        .add_socket_listener(ListenerConfig::new(0, "bob.test").with_target_port(22))
        .await
        .unwrap();
    assert_eq!(alice.get_socket_listeners().len(), 1);
    assert_eq!(alice.get_socket_listeners()[0].port, handle.local_port());

    alice.shutdown().await;
    assert!(!alice.is_running());
    assert!(handle.is_ended());
    next_event(&mut events, |e| matches!(e, ClientEvent::Shutdown)).await;
    eventually(|| alice.get_socket_listeners().is_empty()).await;
}

#[derive(Default)]
struct RecordingWeb {
    requests: std::sync::Mutex<Vec<WebRequest>>,
    ended: AtomicBool,
}

#[async_trait]
impl WebHandler for RecordingWeb {
    async fn handle_request(&self, request: WebRequest) {
        self.requests.lock().unwrap().push(request);
    }

    async fn end(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_web_requests_reach_handler() {
    let hub = MemoryHub::new();
    let web = Arc::new(RecordingWeb::default());
    let config = TetherConfig::new().with_host_name("alice.test").with_rtc(false);
    let mut alice = TunnelClient::new(
        config,
        Arc::new(hub.connect("alice.test")),
        Arc::new(MemoryRtc::new()),
    )
    .unwrap()
    .with_web_handler(web.clone());
    alice.start().await.unwrap();

    let server = hub.connect("server");
    server
        .publish("web/alice.test/sock-1/data", "GET / HTTP/1.1\r\n\r\n".into())
        .await
        .unwrap();

    eventually(|| web.requests.lock().unwrap().len() == 1).await;
    {
        let requests = web.requests.lock().unwrap();
        assert_eq!(requests[0].host, "alice.test");
        assert_eq!(requests[0].socket_id, "sock-1");
        assert_eq!(requests[0].action, "data");
        assert!(requests[0].payload.starts_with(b"GET /"));
    }

    alice.shutdown().await;
    assert!(web.ended.load(Ordering::SeqCst));
}
