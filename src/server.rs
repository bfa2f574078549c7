//! Server Lifecycle, §4.13.
//!
//! Owns every listener, background task, and registry the rest of the
//! crate needs, and runs the fixed five-step graceful-drain sequence on
//! `stop`. A `Config` snapshot is taken once at construction and never
//! mutates — reconfiguration means building a new `Server`.

use crate::admission::{AdmissionController, AdmissionLimits, IpBanConfig};
use crate::auth::{self, AUTH_TIMEOUT, MAX_DATA_SESSIONS};
use crate::bandwidth::BandwidthLimiter;
use crate::client::Client;
use crate::client_manager::ClientManager;
use crate::codec::{read_frame, write_frame, Message, TunnelKind};
use crate::config::Config;
use crate::error::{AuthError, ErrorCode, ServerError};
use crate::inspect::Inspector;
use crate::persistence::{ApiTokenRepo, CustomDomainRepo};
use crate::port_allocator::PortAllocator;
use crate::router::{self, RouterState};
use crate::stream_pool::StreamPool;
use crate::subdomain;
use crate::tcp_manager::TcpTunnelManager;
use crate::tls::CertManager;
use crate::transport::{negotiate_compression, Session, SessionMode, Stream};
use crate::tunnel::{Tunnel, TunnelResource};
use crate::udp_manager::UdpTunnelManager;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const STOP_BUDGET: Duration = Duration::from_secs(12);
const HTTP_DRAIN_DEADLINE: Duration = Duration::from_secs(10);
const POST_GOAWAY_SLEEP: Duration = Duration::from_secs(2);
const PING_TIMEOUT: Duration = Duration::from_secs(90);

/// Optional external collaborators the core consumes but runs fine with
/// none configured at all (in-memory / self-signed defaults).
#[derive(Default)]
pub struct ServerDeps {
    pub token_repo: Option<Arc<dyn ApiTokenRepo>>,
    pub custom_domains: Option<Arc<dyn CustomDomainRepo>>,
    pub exchange_repo: Option<Arc<dyn crate::persistence::ExchangeRepo>>,
    pub cert_manager: Option<Arc<dyn CertManager>>,
}

pub struct Server {
    config: Arc<Config>,
    deps: ServerDeps,
    client_manager: Arc<ClientManager>,
    admission: Arc<AdmissionController>,
    tcp_ports: Arc<PortAllocator>,
    udp_ports: Arc<PortAllocator>,
    inspector: Arc<Inspector>,
    cancel: CancellationToken,
    /// HTTP/HTTPS listener tasks: joined with a deadline in Stop step 2.
    drain_tasks: AsyncMutex<Vec<tokio::task::JoinHandle<()>>>,
    /// Everything else (control-accept loop, cleanup ticker): aborted
    /// outright in Stop step 5, no drain needed.
    background_tasks: AsyncMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Server {
    pub fn new(config: Config, deps: ServerDeps) -> Self {
        let config = Arc::new(config);
        let admission = Arc::new(AdmissionController::new(
            IpBanConfig {
                auth_threshold: config.server.ip_ban.auth_threshold,
                auth_window: Duration::from_secs(config.server.ip_ban.auth_window_secs),
                flood_threshold: config.server.ip_ban.flood_threshold,
                flood_window: Duration::from_secs(config.server.ip_ban.flood_window_secs),
                ban_duration: Duration::from_secs(config.server.ip_ban.ban_duration_secs),
                max_ban_duration: Duration::from_secs(config.server.ip_ban.max_ban_duration_secs),
                cleanup_idle: Duration::from_secs(600),
            },
            config.server.ip_ban.enabled,
            AdmissionLimits::new(
                config.server.accept_rate_global,
                config.server.accept_rate_per_ip,
                config.server.max_control_conns,
                config.server.max_conns_per_ip,
            ),
        ));
        let tcp_ports = Arc::new(PortAllocator::new(
            config.server.tcp_port_range.min,
            config.server.tcp_port_range.max,
        ));
        let udp_ports = Arc::new(PortAllocator::new(
            config.server.udp_port_range.min,
            config.server.udp_port_range.max,
        ));
        let inspector = Arc::new(Inspector::new(
            config.inspect.max_entries,
            config.inspect.max_body_size,
            deps.exchange_repo.clone(),
        ));
        Self {
            config,
            deps,
            client_manager: Arc::new(ClientManager::new()),
            admission,
            tcp_ports,
            udp_ports,
            inspector,
            cancel: CancellationToken::new(),
            drain_tasks: AsyncMutex::new(Vec::new()),
            background_tasks: AsyncMutex::new(Vec::new()),
        }
    }

    pub fn client_manager(&self) -> &Arc<ClientManager> {
        &self.client_manager
    }

    pub fn inspector(&self) -> &Arc<Inspector> {
        &self.inspector
    }

    /// Start: bring up listeners and background tasks, §4.13 Start.
    pub async fn start(self: &Arc<Self>) -> Result<(), ServerError> {
        // 1. Control listener: TLS if configured, else plain TCP with
        // SO_REUSEPORT on Linux.
        let control_listener =
            bind_reuseport(self.config.server.bind_address, self.config.server.control_port)
                .map_err(ServerError::Io)?;
        info!(port = self.config.server.control_port, "control listener bound");

        let this = self.clone();
        let cancel = self.cancel.clone();
        self.background_tasks
            .lock()
            .await
            .push(tokio::spawn(async move { this.control_accept_loop(control_listener, cancel).await }));

        // 2. HTTP, and HTTPS if a cert manager exists and an HTTPS port is
        // configured.
        let http_router_state = Arc::new(RouterState {
            client_manager: self.client_manager.clone(),
            base_domain: self.config.domain.base.clone(),
            custom_domains: self.deps.custom_domains.clone(),
            inspector: self.inspector.clone(),
            inspect_enabled: self.config.inspect.enabled,
            cert_manager: self.deps.cert_manager.clone(),
            is_tls: false,
        });
        let http_app = router::build(http_router_state);

        let http_addr = SocketAddr::new(self.config.server.bind_address, self.config.server.http_port);
        let http_listener = TcpListener::bind(http_addr).await.map_err(ServerError::Io)?;
        info!(port = self.config.server.http_port, "http listener bound");

        let cancel = self.cancel.clone();
        let make_service = http_app.into_make_service_with_connect_info::<SocketAddr>();
        self.drain_tasks.lock().await.push(tokio::spawn(async move {
            let server = axum::serve(http_listener, make_service)
                .with_graceful_shutdown(async move { cancel.cancelled().await });
            if let Err(e) = server.await {
                error!(error = %e, "http server exited with error");
            }
        }));

        if let Some(cert_manager) = self.deps.cert_manager.clone() {
            let https_router_state = Arc::new(RouterState {
                client_manager: self.client_manager.clone(),
                base_domain: self.config.domain.base.clone(),
                custom_domains: self.deps.custom_domains.clone(),
                inspector: self.inspector.clone(),
                inspect_enabled: self.config.inspect.enabled,
                cert_manager: Some(cert_manager.clone()),
                is_tls: true,
            });
            let https_app = router::build(https_router_state);
            let https_addr =
                SocketAddr::new(self.config.server.bind_address, self.config.tls.https_port);
            let https_listener = TcpListener::bind(https_addr).await.map_err(ServerError::Io)?;
            info!(port = self.config.tls.https_port, "https listener bound");
            let cancel = self.cancel.clone();
            self.drain_tasks.lock().await.push(tokio::spawn(serve_https(
                https_listener,
                cert_manager,
                https_app,
                cancel,
            )));
        }

        // 3. Control-accept task is already spawned above; spawn the
        // admission cleanup ticker.
        let admission = self.admission.clone();
        let cancel = self.cancel.clone();
        self.background_tasks.lock().await.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(300));
            loop {
                tokio::select! {
                    _ = ticker.tick() => admission.cleanup(),
                    _ = cancel.cancelled() => return,
                }
            }
        }));

        Ok(())
    }

    async fn control_accept_loop(&self, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                accepted = listener.accept() => {
                    let Ok((socket, peer)) = accepted else { continue };
                    let client_manager = self.client_manager.clone();
                    let admission = self.admission.clone();
                    let config = self.config.clone();
                    let token_repo = self.deps.token_repo.clone();
                    let handles = self.server_handles();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        handle_control_connection(
                            socket, peer, client_manager, admission, config, token_repo, handles, cancel,
                        )
                        .await;
                    });
                }
            }
        }
    }

    fn server_handles(&self) -> ServerHandles {
        ServerHandles { tcp_ports: self.tcp_ports.clone(), udp_ports: self.udp_ports.clone() }
    }

    /// Stop: the fixed five-step graceful drain, §4.13, bounded to
    /// `STOP_BUDGET` overall.
    pub async fn stop(&self) {
        let _ = tokio::time::timeout(STOP_BUDGET, self.stop_inner()).await;
    }

    async fn stop_inner(&self) {
        // Step 1: close all accepting listeners. Cancelling here stops the
        // control-accept loop and fires axum's graceful_shutdown futures.
        self.cancel.cancel();

        // Step 2: with a 10s deadline, let HTTP/HTTPS finish in-flight work.
        let drain = self.drain_tasks.lock().await.drain(..).collect::<Vec<_>>();
        if tokio::time::timeout(HTTP_DRAIN_DEADLINE, futures::future::join_all(drain)).await.is_err() {
            warn!("http/https listeners did not drain within 10s, proceeding");
        }

        // Step 3: each client's control_loop observes this same cancellation
        // and, on its own cancellation branch, writes server_shutdown to the
        // control stream it already owns and goes away on every session —
        // writing from here instead would mean opening a stream nobody is
        // reading. This sleep just bounds how long we wait for that to land.
        tokio::time::sleep(POST_GOAWAY_SLEEP).await;

        // Step 4: cancel the server context (already done), close every client.
        self.client_manager.close_all();

        // Step 5: close the cert manager and IP-ban manager, then reclaim
        // whatever background tasks are still running.
        if let Some(cert_manager) = &self.deps.cert_manager {
            cert_manager.stop().await;
        }
        for task in self.background_tasks.lock().await.drain(..) {
            task.abort();
        }
    }
}

async fn serve_https(
    listener: TcpListener,
    cert_manager: Arc<dyn CertManager>,
    app: axum::Router,
    cancel: CancellationToken,
) {
    let tls_config = match cert_manager.tls_config().await {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load tls config, https listener not starting");
            return;
        }
    };
    let acceptor = TlsAcceptor::from(tls_config);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => {
                let Ok((socket, _peer)) = accepted else { continue };
                let acceptor = acceptor.clone();
                let app = app.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(socket).await {
                        Ok(s) => s,
                        Err(e) => {
                            debug!(error = %e, "tls handshake failed");
                            return;
                        }
                    };
                    let io = TokioIo::new(tls_stream);
                    let service = TowerToHyperService::new(app);
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        debug!(error = %e, "https connection ended with error");
                    }
                });
            }
        }
    }
}

struct ServerHandles {
    tcp_ports: Arc<PortAllocator>,
    udp_ports: Arc<PortAllocator>,
}

async fn handle_control_connection(
    socket: tokio::net::TcpStream,
    peer: SocketAddr,
    client_manager: Arc<ClientManager>,
    admission: Arc<AdmissionController>,
    config: Arc<Config>,
    token_repo: Option<Arc<dyn ApiTokenRepo>>,
    handles: ServerHandles,
    cancel: CancellationToken,
) {
    let guard = match admission.admit(peer.ip(), false) {
        Ok(guard) => guard,
        Err(e) => {
            debug!(peer = %peer, error = %e, "control connection rejected by admission control");
            return;
        }
    };

    let negotiated = match negotiate_compression(socket, config.server.compression_enabled).await {
        Ok(n) => n,
        Err(e) => {
            warn!(peer = %peer, error = %e, "compression negotiation failed");
            return;
        }
    };

    let session_cancel = CancellationToken::new();
    let session =
        Arc::new(Session::new(negotiated, SessionMode::Server, config.server.yamux_window_size, session_cancel));

    let Some(mut control_stream) = session.accept_stream().await else {
        debug!(peer = %peer, "control connection closed before control stream opened");
        return;
    };

    let message = match tokio::time::timeout(AUTH_TIMEOUT, read_frame(&mut control_stream)).await {
        Ok(Ok(Some(m))) => m,
        _ => {
            debug!(peer = %peer, "no auth frame within timeout");
            return;
        }
    };

    match message {
        Message::Auth { token } => {
            let outcome = match auth::resolve_token(&token, &config.auth, token_repo.as_deref()).await {
                Ok(o) => o,
                Err(e) => {
                    admission.record_auth_failure(peer.ip());
                    let _ = write_frame(&mut control_stream, &auth_failure_message(&config, e)).await;
                    return;
                }
            };

            let client_id = Uuid::new_v4().to_string();
            let session_secret = auth::generate_session_secret();
            let bandwidth =
                BandwidthLimiter::new((outcome.plan.bandwidth_mbps as u64).saturating_mul(125_000));
            let client_cancel = CancellationToken::new();
            let stream_pool = StreamPool::spawn(session.clone(), client_cancel);

            let client = Arc::new(Client::new(
                client_id.clone(),
                peer,
                outcome.user_id.clone(),
                false,
                outcome.plan.clone(),
                outcome.token_record,
                session_secret.clone(),
                session.clone(),
                stream_pool,
                bandwidth,
            ));

            let auth_result = Message::AuthResult {
                success: true,
                error: None,
                error_code: None,
                client_id: client_id.clone(),
                max_tunnels: outcome.plan.max_tunnels,
                server_base_name: config.domain.base.clone(),
                session_id: client_id.clone(),
                session_secret,
                min_client_version: "1.0.0".into(),
                capabilities: crate::codec::AuthResultCapabilities {
                    inspector_enabled: outcome.plan.inspector_enabled,
                },
            };
            if write_frame(&mut control_stream, &auth_result).await.is_err() {
                return;
            }

            client_manager.add(client.clone());
            control_loop(client.clone(), control_stream, &client_manager, &handles, &config, cancel).await;
            client_manager.remove(&client.id);
        }
        Message::JoinSession { client_id, session_secret } => {
            match client_manager.get(&client_id) {
                Some(client) if auth::verify_session_secret(&client.session_secret, &session_secret) => {
                    let result = if client.data_session_count().await >= MAX_DATA_SESSIONS {
                        Message::JoinSessionResult {
                            success: false,
                            error: Some("data session limit reached".into()),
                        }
                    } else if client.add_data_session(session.clone()).await.is_ok() {
                        Message::JoinSessionResult { success: true, error: None }
                    } else {
                        Message::JoinSessionResult {
                            success: false,
                            error: Some("data session limit reached".into()),
                        }
                    };
                    let _ = write_frame(&mut control_stream, &result).await;
                }
                _ => {
                    admission.record_auth_failure(peer.ip());
                    let _ = write_frame(
                        &mut control_stream,
                        &Message::JoinSessionResult {
                            success: false,
                            error: Some("unknown client or bad session secret".into()),
                        },
                    )
                    .await;
                }
            }
        }
        _ => debug!(peer = %peer, "first control frame was not auth or join_session"),
    }

    drop(guard);
}

fn auth_failure_message(config: &Config, e: AuthError) -> Message {
    Message::AuthResult {
        success: false,
        error: Some(e.to_string()),
        error_code: Some(match e {
            AuthError::TokenExpired => ErrorCode::TokenExpired,
            AuthError::PermissionDenied | AuthError::InvalidToken => ErrorCode::PermissionDenied,
        }),
        client_id: String::new(),
        max_tunnels: 0,
        server_base_name: config.domain.base.clone(),
        session_id: String::new(),
        session_secret: String::new(),
        min_client_version: "1.0.0".into(),
        capabilities: Default::default(),
    }
}

/// Drives one authenticated client's control stream: tunnel
/// requests/closes and pings, until the stream closes or the client goes
/// 90s without sending any frame.
async fn control_loop(
    client: Arc<Client>,
    mut control_stream: Stream,
    client_manager: &Arc<ClientManager>,
    handles: &ServerHandles,
    config: &Arc<Config>,
    server_cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            m = tokio::time::timeout(PING_TIMEOUT, read_frame(&mut control_stream)) => m,
            _ = client.cancel.cancelled() => break,
            _ = server_cancel.cancelled() => {
                let _guard = client.control_write_lock.lock().await;
                let _ = write_frame(
                    &mut control_stream,
                    &Message::ServerShutdown { reason: "server shutting down".into() },
                )
                .await;
                drop(_guard);
                for session in client.all_sessions().await {
                    session.go_away();
                }
                break;
            }
        };

        let message = match message {
            Ok(Ok(Some(m))) => m,
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                debug!(client_id = %client.id, error = %e, "control stream read error");
                break;
            }
            Err(_) => {
                info!(client_id = %client.id, "client timed out (no frame within 90s)");
                client.close();
                break;
            }
        };
        client.touch_ping();

        match message {
            Message::Ping => {
                let _guard = client.control_write_lock.lock().await;
                let _ = write_frame(&mut control_stream, &Message::Pong).await;
            }
            Message::TunnelRequest { kind, subdomain, port, agent_local_port, name, request_id } => {
                handle_tunnel_request(
                    &client,
                    &mut control_stream,
                    client_manager,
                    handles,
                    config,
                    kind,
                    subdomain,
                    port,
                    agent_local_port,
                    name,
                    request_id,
                )
                .await;
            }
            Message::TunnelClose { tunnel_id } => {
                if let Some(tunnel) = client.remove_tunnel(&tunnel_id).await {
                    release_tunnel_resources(client_manager, handles, &tunnel);
                    let _guard = client.control_write_lock.lock().await;
                    let _ = write_frame(&mut control_stream, &Message::TunnelClosed { tunnel_id }).await;
                }
            }
            other => debug!(client_id = %client.id, message = ?other, "unexpected control message"),
        }
    }

    for tunnel in client.snapshot_tunnels().await {
        release_tunnel_resources(client_manager, handles, &tunnel);
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_tunnel_request(
    client: &Arc<Client>,
    control_stream: &mut Stream,
    client_manager: &Arc<ClientManager>,
    handles: &ServerHandles,
    config: &Arc<Config>,
    kind: TunnelKind,
    requested_subdomain: Option<String>,
    port: Option<u16>,
    agent_local_port: u16,
    name: Option<String>,
    request_id: u64,
) {
    if client.plan.max_tunnels >= 0 && client.tunnel_count().await as i64 >= client.plan.max_tunnels {
        send_tunnel_error(client, control_stream, ErrorCode::TunnelLimit, "tunnel limit reached", request_id)
            .await;
        return;
    }

    let tunnel_id = Uuid::new_v4().to_string();
    let (resource, url_or_addr) = match kind {
        TunnelKind::Http => {
            let candidate = requested_subdomain.unwrap_or_else(|| tunnel_id[..8].to_string());
            let normalized = subdomain::normalize(&candidate);
            if !subdomain::is_valid(&normalized) {
                send_tunnel_error(
                    client,
                    control_stream,
                    ErrorCode::SubdomainInvalid,
                    "invalid subdomain",
                    request_id,
                )
                .await;
                return;
            }
            if let Some(record) = &client.token_record {
                if !record.subdomain_allowed(&normalized) {
                    send_tunnel_error(
                        client,
                        control_stream,
                        ErrorCode::PermissionDenied,
                        "subdomain not allowed for this token",
                        request_id,
                    )
                    .await;
                    return;
                }
            }
            if !client_manager.reserve_subdomain(&normalized, &tunnel_id) {
                send_tunnel_error(
                    client,
                    control_stream,
                    ErrorCode::SubdomainTaken,
                    "subdomain already in use",
                    request_id,
                )
                .await;
                return;
            }
            let url = format!("http://{}.{}", normalized, config.domain.base);
            (TunnelResource::Http { subdomain: normalized }, url)
        }
        TunnelKind::Tcp | TunnelKind::Udp => {
            let allocator = if kind == TunnelKind::Tcp { &handles.tcp_ports } else { &handles.udp_ports };
            let allocated = match allocator.allocate(port.unwrap_or(0)) {
                Ok(p) => p,
                Err(_) => {
                    send_tunnel_error(
                        client,
                        control_stream,
                        ErrorCode::PortUnavailable,
                        "no port available",
                        request_id,
                    )
                    .await;
                    return;
                }
            };
            let proto = if kind == TunnelKind::Tcp { "tcp" } else { "udp" };
            if !client_manager.reserve_port(proto, allocated, &tunnel_id) {
                allocator.release(allocated);
                send_tunnel_error(
                    client,
                    control_stream,
                    ErrorCode::PortUnavailable,
                    "port already in use",
                    request_id,
                )
                .await;
                return;
            }
            let addr = format!("{}:{}", config.server.bind_address, allocated);
            let resource = if kind == TunnelKind::Tcp {
                TunnelResource::Tcp { port: allocated }
            } else {
                TunnelResource::Udp { port: allocated }
            };
            (resource, addr)
        }
    };

    let tunnel = Arc::new(Tunnel::new(
        tunnel_id.clone(),
        client.id.clone(),
        kind,
        resource,
        agent_local_port,
        name,
        config.server.max_concurrent_requests_per_tunnel,
    ));

    // TCP/UDP managers bind their own listener socket inside `serve()`, so
    // the spawned task itself is responsible for unwinding the port
    // reservation if that bind fails.
    match kind {
        TunnelKind::Tcp => {
            let bind_port = tunnel.port().expect("tcp tunnel always has a port");
            let bind_addr = config.server.bind_address;
            let buffer_size = config.server.tcp_buffer_size;
            let task_client = client.clone();
            let task_tunnel = tunnel.clone();
            let task_cancel = client.cancel.clone();
            let client_manager = client_manager.clone();
            let tcp_ports = handles.tcp_ports.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    TcpTunnelManager::serve(bind_addr, bind_port, task_client, task_tunnel, buffer_size, task_cancel)
                        .await
                {
                    warn!(port = bind_port, error = %e, "tcp tunnel listener ended with error");
                }
                client_manager.release_port("tcp", bind_port);
                tcp_ports.release(bind_port);
            });
        }
        TunnelKind::Udp => {
            let bind_port = tunnel.port().expect("udp tunnel always has a port");
            let bind_addr = config.server.bind_address;
            let task_client = client.clone();
            let task_tunnel = tunnel.clone();
            let task_cancel = client.cancel.clone();
            let client_manager = client_manager.clone();
            let udp_ports = handles.udp_ports.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    UdpTunnelManager::serve(bind_addr, bind_port, task_client, task_tunnel, task_cancel).await
                {
                    warn!(port = bind_port, error = %e, "udp tunnel listener ended with error");
                }
                client_manager.release_port("udp", bind_port);
                udp_ports.release(bind_port);
            });
        }
        TunnelKind::Http => {}
    }

    client.insert_tunnel(tunnel.clone()).await;
    let _guard = client.control_write_lock.lock().await;
    let _ = write_frame(control_stream, &Message::TunnelCreated { tunnel_id, kind, url_or_addr, request_id }).await;
}

async fn send_tunnel_error(
    client: &Arc<Client>,
    control_stream: &mut Stream,
    code: ErrorCode,
    message: &str,
    request_id: u64,
) {
    let _guard = client.control_write_lock.lock().await;
    let _ = write_frame(control_stream, &Message::TunnelError { code, message: message.into(), request_id }).await;
}

fn release_tunnel_resources(client_manager: &Arc<ClientManager>, handles: &ServerHandles, tunnel: &Tunnel) {
    match &tunnel.resource {
        TunnelResource::Http { subdomain } => client_manager.release_subdomain(subdomain),
        TunnelResource::Tcp { port } => {
            client_manager.release_port("tcp", *port);
            handles.tcp_ports.release(*port);
        }
        TunnelResource::Udp { port } => {
            client_manager.release_port("udp", *port);
            handles.udp_ports.release(*port);
        }
    }
}

fn bind_reuseport(addr: std::net::IpAddr, port: u16) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    #[cfg(target_os = "linux")]
    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::new(addr, port).into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}
