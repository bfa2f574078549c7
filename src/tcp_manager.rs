//! TCP Tunnel Manager, §4.9.
//!
//! Binds a public TCP port allocated by [`crate::port_allocator::PortAllocator`]
//! and relays every accepted connection to the owning agent over a fresh
//! multiplexed stream, copying bytes bidirectionally through the client's
//! bandwidth limiter.

use crate::bandwidth::ThrottledIo;
use crate::client::Client;
use crate::codec::write_stream_header;
use crate::tunnel::Tunnel;
use socket2::{SockRef, TcpKeepalive};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_CONSECUTIVE_ACCEPT_ERRORS: u32 = 10;
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub struct TcpTunnelManager;

impl TcpTunnelManager {
    /// Binds `port` and drives its accept loop until `cancel` fires or the
    /// listener has failed `MAX_CONSECUTIVE_ACCEPT_ERRORS` times in a row.
    /// Returns once the loop exits; the caller is responsible for
    /// releasing the port from the allocator afterward.
    pub async fn serve(
        bind_addr: std::net::IpAddr,
        port: u16,
        client: Arc<Client>,
        tunnel: Arc<Tunnel>,
        buffer_size: usize,
        cancel: CancellationToken,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind((bind_addr, port)).await?;
        info!(port, tunnel_id = %tunnel.id, "tcp tunnel listening");

        let mut consecutive_errors = 0u32;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(port, "tcp tunnel accept loop cancelled");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            consecutive_errors = 0;
                            tune_socket(&socket);
                            let client = client.clone();
                            let tunnel = tunnel.clone();
                            let cancel = cancel.clone();
                            tokio::spawn(async move {
                                if let Err(e) = relay_one(socket, peer, client, tunnel, buffer_size, cancel).await {
                                    debug!(error = %e, "tcp tunnel connection ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            consecutive_errors += 1;
                            warn!(port, error = %e, consecutive_errors, "tcp accept error");
                            if consecutive_errors >= MAX_CONSECUTIVE_ACCEPT_ERRORS {
                                return Err(e);
                            }
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }
    }
}

const SOCKET_BUFFER_SIZE: usize = 256 * 1024;

fn tune_socket(socket: &TcpStream) {
    let sock_ref = SockRef::from(socket);
    let _ = sock_ref.set_nodelay(true);
    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(30));
    let _ = sock_ref.set_tcp_keepalive(&keepalive);
    let _ = sock_ref.set_recv_buffer_size(SOCKET_BUFFER_SIZE);
    let _ = sock_ref.set_send_buffer_size(SOCKET_BUFFER_SIZE);
}

async fn relay_one(
    socket: TcpStream,
    peer: std::net::SocketAddr,
    client: Arc<Client>,
    tunnel: Arc<Tunnel>,
    buffer_size: usize,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let stream = match client.stream_pool.try_take() {
        Some(s) => s,
        None => client
            .primary_session()
            .open_stream()
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))?,
    };
    let mut stream = stream;
    write_stream_header(&mut stream, &tunnel.id, &peer.to_string())
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    let mut agent_stream = ThrottledIo::new(stream, client.bandwidth.clone());

    let (mut public_rd, mut public_wr) = tokio::io::split(socket);
    let (mut agent_rd, mut agent_wr) = tokio::io::split(&mut agent_stream);

    // Each direction shuts down its write half as soon as its copy ends,
    // so the peer sees EOF and its own copy unblocks — both run to
    // completion together instead of one being abandoned mid-flight.
    let to_agent = async {
        let result = tokio::io::copy_buf(
            &mut tokio::io::BufReader::with_capacity(buffer_size, &mut public_rd),
            &mut agent_wr,
        )
        .await;
        let _ = agent_wr.shutdown().await;
        result
    };
    let to_public = async {
        let result = tokio::io::copy_buf(
            &mut tokio::io::BufReader::with_capacity(buffer_size, &mut agent_rd),
            &mut public_wr,
        )
        .await;
        let _ = public_wr.shutdown().await;
        result
    };

    tokio::select! {
        _ = cancel.cancelled() => {}
        (agent_result, public_result) = async { tokio::join!(to_agent, to_public) } => {
            if let Ok(n) = agent_result { tunnel.record_bytes_in(n); }
            if let Ok(n) = public_result { tunnel.record_bytes_out(n); }
        }
    }
    Ok(())
}
