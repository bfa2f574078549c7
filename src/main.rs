//! # Tunnel Relay Server
//!
//! A multiplexed reverse-tunnel relay: agents dial in over a yamux
//! control connection and expose local TCP/UDP/HTTP services, which the
//! server makes reachable at a public port or subdomain.
//!
//! ## Architecture
//!
//! ```text
//! Public client ──TCP/HTTP──► Relay Server ──yamux stream──► Agent ──► Local Service
//! ```
//!
//! ## Modules
//!
//! - [`server`]    — listener lifecycle, control protocol, graceful drain
//! - [`router`]    — HTTP(S) Host-based demultiplexing and proxying
//! - [`tcp_manager`] / [`udp_manager`] — public TCP/UDP tunnel relaying
//! - [`client`] / [`client_manager`] — per-connection state and registries
//! - [`api`]       — admin REST endpoints

use fxtunnel_server::api;
use fxtunnel_server::config::Config;
use fxtunnel_server::persistence::memory::{InMemoryApiTokenRepo, InMemoryCustomDomainRepo, InMemoryExchangeRepo};
use fxtunnel_server::server::{Server, ServerDeps};
use fxtunnel_server::tls::{CertManager, SelfSignedCertManager, StaticCertManager};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

/// Command-line flags for the tunnel relay server.
#[derive(Parser, Debug)]
#[command(name = "fxtunnel-server", version, about = "Reverse-tunnel relay server")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "FXTUNNEL_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    /// Port the admin REST API listens on. Set to 0 to disable it.
    #[arg(long, env = "FXTUNNEL_ADMIN_PORT", default_value_t = 9090)]
    admin_port: u16,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fxtunnel_server=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, path = %cli.config.display(), "failed to load config");
            std::process::exit(1);
        }
    };
    if let Err(e) = config.validate() {
        error!(error = %e, "invalid config");
        std::process::exit(1);
    }

    let cert_manager: Option<Arc<dyn CertManager>> = if config.tls.enabled {
        match StaticCertManager::load(&config.tls) {
            Ok(cm) => Some(Arc::new(cm)),
            Err(e) => {
                error!(error = %e, "failed to load tls certificate, falling back to self-signed");
                match SelfSignedCertManager::generate(&config.domain.base) {
                    Ok(cm) => Some(Arc::new(cm)),
                    Err(e) => {
                        error!(error = %e, "failed to generate self-signed certificate");
                        None
                    }
                }
            }
        }
    } else {
        None
    };

    let deps = ServerDeps {
        token_repo: Some(Arc::new(InMemoryApiTokenRepo::default())),
        custom_domains: if config.custom_domains.enabled {
            Some(Arc::new(InMemoryCustomDomainRepo::default()))
        } else {
            None
        },
        exchange_repo: Some(Arc::new(InMemoryExchangeRepo::default())),
        cert_manager,
    };

    let server = Arc::new(Server::new(config, deps));
    if let Err(e) = server.start().await {
        error!(error = %e, "failed to start server");
        std::process::exit(1);
    }
    info!("tunnel server started");

    let admin_task = if cli.admin_port != 0 {
        let api_state = api::ApiState {
            client_manager: server.client_manager().clone(),
            inspector: server.inspector().clone(),
        };
        let app = Router::new()
            .route("/healthz", get(api::healthz))
            .route("/api/clients", get(api::list_clients))
            .route("/api/stats", get(api::stats))
            .route("/api/tunnels/{tunnel_id}/exchanges", get(api::tunnel_exchanges))
            .layer(CorsLayer::permissive())
            .with_state(api_state);
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], cli.admin_port));
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                info!(%addr, "admin api listening");
                Some(tokio::spawn(async move {
                    let _ = axum::serve(listener, app).await;
                }))
            }
            Err(e) => {
                error!(error = %e, "failed to bind admin api port");
                None
            }
        }
    } else {
        None
    };

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining connections");
    server.stop().await;
    if let Some(task) = admin_task {
        task.abort();
    }
    info!("tunnel server stopped");
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
