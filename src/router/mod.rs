//! HTTP Router, §4.8.
//!
//! Demultiplexes inbound HTTP(S) requests by Host header — either a
//! `{subdomain}.{base_domain}` name or a registered custom domain — onto
//! the matching tunnel's agent, proxying the request over a multiplexed
//! stream via an HTTP/1 client connection. First-time browser visitors to
//! an HTTP tunnel see a one-time interstitial warning page.

mod interstitial;

use crate::bandwidth::ThrottledIo;
use crate::client::Client;
use crate::client_manager::ClientManager;
use crate::codec::write_stream_header;
use crate::inspect::Inspector;
use crate::persistence::CustomDomainRepo;
use crate::subdomain;
use crate::tls::CertManager;
use crate::tunnel::Tunnel;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper_util::rt::TokioIo;
use rand::RngCore;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct RouterState {
    pub client_manager: Arc<ClientManager>,
    pub base_domain: String,
    pub custom_domains: Option<Arc<dyn CustomDomainRepo>>,
    pub inspector: Arc<Inspector>,
    pub inspect_enabled: bool,
    pub cert_manager: Option<Arc<dyn CertManager>>,
    /// Whether this `Router` instance is bound behind the HTTPS listener,
    /// for `X-Forwarded-Proto`. The HTTP and HTTPS listeners each get
    /// their own [`RouterState`] with this set accordingly.
    pub is_tls: bool,
}

pub fn build(state: Arc<RouterState>) -> axum::Router {
    axum::Router::new()
        .route("/healthz", axum::routing::get(|| async { "ok" }))
        .fallback(handle_request)
        .with_state(state)
}

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

async fn handle_request(
    State(state): State<Arc<RouterState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    if let Some(token) = req.uri().path().strip_prefix(ACME_CHALLENGE_PREFIX) {
        return handle_acme_challenge(&state, token).await;
    }

    let Some(host) = req.headers().get(header::HOST).and_then(|v| v.to_str().ok()).map(String::from)
    else {
        return (StatusCode::BAD_REQUEST, "missing Host header").into_response();
    };

    let Some((subdomain, is_custom_domain)) = resolve_subdomain(&state, &host).await else {
        return (StatusCode::NOT_FOUND, "no tunnel for this host").into_response();
    };

    let Some(tunnel_id) = state.client_manager.lookup_subdomain(&subdomain) else {
        return (StatusCode::NOT_FOUND, "no tunnel for this host").into_response();
    };
    let Some((client, tunnel)) = state.client_manager.find_tunnel(&tunnel_id).await else {
        return (StatusCode::SERVICE_UNAVAILABLE, "tunnel agent disconnected").into_response();
    };

    if interstitial::should_show(req.method(), req.headers(), &subdomain, client.is_admin, is_custom_domain) {
        let path_and_query = req.uri().path_and_query().map(|p| p.as_str()).unwrap_or("/");
        if let Some(query) = req.uri().query() {
            if query.split('&').any(|kv| kv == "_fxt_consent=1") {
                let clean_query: Vec<&str> =
                    query.split('&').filter(|kv| *kv != "_fxt_consent=1").collect();
                let clean_path = if clean_query.is_empty() {
                    req.uri().path().to_string()
                } else {
                    format!("{}?{}", req.uri().path(), clean_query.join("&"))
                };
                return interstitial::consent_redirect(&subdomain, &clean_path);
            }
        }
        let continue_href = if path_and_query.contains('?') {
            format!("{path_and_query}&_fxt_consent=1")
        } else {
            format!("{path_and_query}?_fxt_consent=1")
        };
        return interstitial::page(&subdomain, &continue_href, req.headers());
    }

    proxy_request(&state, client, tunnel, remote_addr, &host, req).await
}

async fn handle_acme_challenge(state: &RouterState, token: &str) -> Response {
    let Some(cert_manager) = &state.cert_manager else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match cert_manager.handle_acme_challenge(token).await {
        Some(body) => (StatusCode::OK, body).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Returns the resolved subdomain plus whether it was resolved via a
/// registered custom domain (as opposed to `{subdomain}.{base_domain}`),
/// since the interstitial gate treats the two differently.
async fn resolve_subdomain(state: &RouterState, host: &str) -> Option<(String, bool)> {
    if let Some(sub) = subdomain::extract_from_host(host, &state.base_domain) {
        return Some((sub, false));
    }
    let repo = state.custom_domains.as_ref()?;
    let normalized = subdomain::normalize_host(host);
    repo.find_by_domain(&normalized).await.map(|record| (record.subdomain, true))
}

fn generate_trace_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

async fn proxy_request(
    state: &RouterState,
    client: Arc<Client>,
    tunnel: Arc<Tunnel>,
    remote_addr: SocketAddr,
    forwarded_host: &str,
    mut req: Request,
) -> Response {
    let permit = match tunnel.request_slots.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return (StatusCode::SERVICE_UNAVAILABLE, "tunnel closed").into_response(),
    };

    let trace_id = generate_trace_id();
    req.headers_mut()
        .insert("x-trace-id", HeaderValue::from_str(&trace_id).unwrap_or(HeaderValue::from_static("")));

    let mut stream = match client.stream_pool.try_take() {
        Some(s) => s,
        None => match client.primary_session().open_stream().await {
            Ok(s) => s,
            Err(e) => {
                warn!(tunnel_id = %tunnel.id, error = %e, "failed to open proxy stream");
                return (StatusCode::BAD_GATEWAY, "could not reach tunnel agent").into_response();
            }
        },
    };
    if let Err(e) = write_stream_header(&mut stream, &tunnel.id, &remote_addr.to_string()).await {
        warn!(tunnel_id = %tunnel.id, error = %e, "failed to write stream header");
        return (StatusCode::BAD_GATEWAY, "could not reach tunnel agent").into_response();
    }
    let stream = ThrottledIo::new(stream, client.bandwidth.clone());
    let io = TokioIo::new(stream);

    let wants_upgrade = req.headers().get(header::UPGRADE).is_some();
    let browser_upgrade = wants_upgrade.then(|| hyper::upgrade::on(&mut req));

    let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(tunnel_id = %tunnel.id, error = %e, "http/1 handshake with agent failed");
            return (StatusCode::BAD_GATEWAY, "tunnel agent handshake failed").into_response();
        }
    };
    let conn_task = tokio::spawn(conn.with_upgrades());

    let method = req.method().clone();
    let uri_path = req.uri().path_and_query().map(|p| p.as_str().to_string()).unwrap_or_default();
    let req_headers = req.headers().clone();
    let (parts, body) = req.into_parts();
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "failed to buffer request body");
            return (StatusCode::BAD_REQUEST, "could not read request body").into_response();
        }
    };

    let mut outbound = hyper::Request::from_parts(parts, http_body_util::Full::new(body_bytes.clone()));
    let client_ip = remote_addr.ip().to_string();
    let xff = match outbound.headers().get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {client_ip}"),
        None => client_ip,
    };
    let proto = if state.is_tls { "https" } else { "http" };
    let headers = outbound.headers_mut();
    headers.insert(header::HOST, HeaderValue::from_str(&tunnel_agent_host(&tunnel)).unwrap_or(HeaderValue::from_static("tunnel")));
    if let Ok(v) = HeaderValue::from_str(&xff) {
        headers.insert("x-forwarded-for", v);
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static(proto));
    if let Ok(v) = HeaderValue::from_str(forwarded_host) {
        headers.insert("x-forwarded-host", v);
    }

    let started = std::time::SystemTime::now();
    let start_instant = std::time::Instant::now();

    let response = match sender.send_request(outbound).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(tunnel_id = %tunnel.id, error = %e, "agent request failed");
            return (StatusCode::BAD_GATEWAY, "tunnel agent request failed").into_response();
        }
    };

    let status = response.status();

    if wants_upgrade && status == StatusCode::SWITCHING_PROTOCOLS {
        let Some(browser_upgrade) = browser_upgrade else {
            return (StatusCode::BAD_GATEWAY, "agent upgraded a non-upgrade request").into_response();
        };
        return handle_upgrade(tunnel, browser_upgrade, response, permit, conn_task).await;
    }

    let (resp_parts, resp_body) = response.into_parts();
    let resp_bytes = match resp_body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(tunnel_id = %tunnel.id, error = %e, "failed to buffer agent response");
            return (StatusCode::BAD_GATEWAY, "tunnel agent response error").into_response();
        }
    };

    if state.inspect_enabled {
        record_exchange(
            state,
            &tunnel,
            Some(trace_id),
            None,
            &method,
            &uri_path,
            status.as_u16(),
            remote_addr,
            &req_headers,
            &resp_parts.headers,
            body_bytes,
            resp_bytes.clone(),
            started,
            start_instant.elapsed().as_millis() as u64,
        )
        .await;
    }

    tunnel.record_bytes_in(resp_bytes.len() as u64);
    drop(permit);
    (resp_parts.status, resp_parts.headers, Body::from(resp_bytes)).into_response()
}

fn tunnel_agent_host(tunnel: &Tunnel) -> String {
    format!("127.0.0.1:{}", tunnel.agent_local_port)
}

#[allow(clippy::too_many_arguments)]
async fn record_exchange(
    state: &RouterState,
    tunnel: &Tunnel,
    trace_id: Option<String>,
    replay_ref: Option<u128>,
    method: &axum::http::Method,
    path: &str,
    status: u16,
    remote_addr: SocketAddr,
    req_headers: &axum::http::HeaderMap,
    resp_headers: &axum::http::HeaderMap,
    req_body: Bytes,
    resp_body: Bytes,
    started: std::time::SystemTime,
    duration_ms: u64,
) -> u128 {
    let to_pairs = |headers: &axum::http::HeaderMap| {
        headers
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect::<Vec<_>>()
    };
    state
        .inspector
        .record(
            &tunnel.id,
            trace_id,
            replay_ref,
            method.to_string(),
            path.to_string(),
            status,
            remote_addr.ip(),
            to_pairs(req_headers),
            to_pairs(resp_headers),
            req_body.to_vec(),
            resp_body.to_vec(),
            started,
            duration_ms,
        )
        .await
}

/// `Replay(subdomain, request)`, §4.8.3: opens a fresh stream to the
/// tunnel currently serving `subdomain`, writes `req` verbatim, and
/// returns the agent's response. The result is recorded as a new
/// captured exchange with `replay_ref` pointing at `original_id`.
pub async fn replay(state: &RouterState, subdomain: &str, original_id: u128, mut req: Request) -> Response {
    let Some(tunnel_id) = state.client_manager.lookup_subdomain(subdomain) else {
        return (StatusCode::NOT_FOUND, "no tunnel for this subdomain").into_response();
    };
    let Some((client, tunnel)) = state.client_manager.find_tunnel(&tunnel_id).await else {
        return (StatusCode::SERVICE_UNAVAILABLE, "tunnel agent disconnected").into_response();
    };

    let trace_id = generate_trace_id();
    req.headers_mut()
        .insert("x-trace-id", HeaderValue::from_str(&trace_id).unwrap_or(HeaderValue::from_static("")));

    let mut stream = match client.stream_pool.try_take() {
        Some(s) => s,
        None => match client.primary_session().open_stream().await {
            Ok(s) => s,
            Err(e) => {
                warn!(tunnel_id = %tunnel.id, error = %e, "failed to open replay stream");
                return (StatusCode::BAD_GATEWAY, "could not reach tunnel agent").into_response();
            }
        },
    };
    let remote_addr: SocketAddr = ([127, 0, 0, 1], 0).into();
    if let Err(e) = write_stream_header(&mut stream, &tunnel.id, &remote_addr.to_string()).await {
        warn!(tunnel_id = %tunnel.id, error = %e, "failed to write replay stream header");
        return (StatusCode::BAD_GATEWAY, "could not reach tunnel agent").into_response();
    }
    let stream = ThrottledIo::new(stream, client.bandwidth.clone());
    let io = TokioIo::new(stream);

    let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(tunnel_id = %tunnel.id, error = %e, "http/1 handshake with agent failed");
            return (StatusCode::BAD_GATEWAY, "tunnel agent handshake failed").into_response();
        }
    };
    tokio::spawn(conn);

    let method = req.method().clone();
    let uri_path = req.uri().path_and_query().map(|p| p.as_str().to_string()).unwrap_or_default();
    let req_headers = req.headers().clone();
    let (parts, body) = req.into_parts();
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "failed to buffer replay request body");
            return (StatusCode::BAD_REQUEST, "could not read request body").into_response();
        }
    };
    let mut outbound = hyper::Request::from_parts(parts, http_body_util::Full::new(body_bytes.clone()));
    outbound.headers_mut().insert(header::HOST, HeaderValue::from_str(&tunnel_agent_host(&tunnel)).unwrap_or(HeaderValue::from_static("tunnel")));

    let started = std::time::SystemTime::now();
    let start_instant = std::time::Instant::now();

    let response = match sender.send_request(outbound).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(tunnel_id = %tunnel.id, error = %e, "replay request failed");
            return (StatusCode::BAD_GATEWAY, "tunnel agent request failed").into_response();
        }
    };
    let status = response.status();
    let (resp_parts, resp_body) = response.into_parts();
    let resp_bytes = match resp_body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(tunnel_id = %tunnel.id, error = %e, "failed to buffer replay response");
            return (StatusCode::BAD_GATEWAY, "tunnel agent response error").into_response();
        }
    };

    if state.inspect_enabled {
        record_exchange(
            state,
            &tunnel,
            Some(trace_id),
            Some(original_id),
            &method,
            &uri_path,
            status.as_u16(),
            remote_addr,
            &req_headers,
            &resp_parts.headers,
            body_bytes,
            resp_bytes.clone(),
            started,
            start_instant.elapsed().as_millis() as u64,
        )
        .await;
    }

    (resp_parts.status, resp_parts.headers, Body::from(resp_bytes)).into_response()
}

/// Splices the browser's upgraded connection to the agent's upgraded
/// connection once both sides have confirmed the 101 response.
async fn handle_upgrade(
    tunnel: Arc<Tunnel>,
    browser_upgrade: hyper::upgrade::OnUpgrade,
    mut agent_response: hyper::Response<hyper::body::Incoming>,
    permit: tokio::sync::OwnedSemaphorePermit,
    conn_task: tokio::task::JoinHandle<Result<(), hyper::Error>>,
) -> Response {
    let response_headers = agent_response.headers().clone();
    let agent_upgrade = hyper::upgrade::on(&mut agent_response);
    let tunnel_id = tunnel.id.clone();

    tokio::spawn(async move {
        let agent_upgraded = match agent_upgrade.await {
            Ok(u) => u,
            Err(e) => {
                warn!(tunnel_id = %tunnel_id, error = %e, "agent upgrade failed");
                drop(permit);
                return;
            }
        };
        let browser_upgraded = match browser_upgrade.await {
            Ok(u) => u,
            Err(e) => {
                warn!(tunnel_id = %tunnel_id, error = %e, "browser upgrade failed");
                drop(permit);
                return;
            }
        };
        let mut agent_io = TokioIo::new(agent_upgraded);
        let mut browser_io = TokioIo::new(browser_upgraded);
        if let Err(e) = tokio::io::copy_bidirectional(&mut browser_io, &mut agent_io).await {
            debug!(tunnel_id = %tunnel_id, error = %e, "upgraded connection copy ended");
        }
        let _ = conn_task.await;
        drop(permit);
    });

    let mut builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in response_headers.iter() {
        builder = builder.header(name, value);
    }
    builder.body(Body::empty()).unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
