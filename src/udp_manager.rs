//! UDP Tunnel Manager, §4.10.
//!
//! UDP has no connection to hold open, so every datagram travels over the
//! client's multiplexed stream framed as `[u16 len][u32 addr_hash][payload]`.
//! The server keeps a hash -> `SocketAddr` map per tunnel so it can route
//! an agent's reply datagram back to the right sender without shipping
//! full addresses both ways. A 30s idle read deadline on the agent-facing
//! stream reclaims tunnels whose agent has gone silent.

use crate::bandwidth::ThrottledIo;
use crate::client::Client;
use crate::codec::write_stream_header;
use crate::tunnel::Tunnel;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_DATAGRAM_SIZE: usize = 65507;

/// FNV-1a over the string form of a `SocketAddr`. Collisions would
/// misroute a reply datagram, which is an acceptable failure mode for UDP
/// (the sender just doesn't get an answer) — not worth a real address
/// table keyed any more expensively for this volume of traffic.
fn hash_addr(addr: &SocketAddr) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for byte in addr.to_string().bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}

pub struct UdpTunnelManager;

impl UdpTunnelManager {
    pub async fn serve(
        bind_addr: std::net::IpAddr,
        port: u16,
        client: Arc<Client>,
        tunnel: Arc<Tunnel>,
        cancel: CancellationToken,
    ) -> std::io::Result<()> {
        let socket = Arc::new(UdpSocket::bind((bind_addr, port)).await?);
        info!(port, tunnel_id = %tunnel.id, "udp tunnel listening");

        let stream = match client.stream_pool.try_take() {
            Some(s) => s,
            None => client
                .primary_session()
                .open_stream()
                .await
                .map_err(|e| std::io::Error::other(e.to_string()))?,
        };
        let mut stream = stream;
        write_stream_header(&mut stream, &tunnel.id, &format!("udp:{port}"))
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let stream = ThrottledIo::new(stream, client.bandwidth.clone());
        let (agent_rd, agent_wr) = tokio::io::split(stream);

        let addr_by_hash: Arc<DashMap<u32, SocketAddr>> = Arc::new(DashMap::new());

        let inbound = {
            let socket = socket.clone();
            let addr_by_hash = addr_by_hash.clone();
            let tunnel = tunnel.clone();
            let cancel = cancel.clone();
            tokio::spawn(inbound_loop(socket, agent_wr, addr_by_hash, tunnel, cancel))
        };
        let outbound = {
            let socket = socket.clone();
            let tunnel = tunnel.clone();
            let cancel = cancel.clone();
            tokio::spawn(outbound_loop(socket, agent_rd, addr_by_hash, tunnel, cancel))
        };

        tokio::select! {
            _ = inbound => {}
            _ = outbound => {}
        }
        debug!(port, "udp tunnel loops ended");
        Ok(())
    }
}

/// Public socket -> agent stream.
async fn inbound_loop<W: tokio::io::AsyncWrite + Unpin>(
    socket: Arc<UdpSocket>,
    mut agent_wr: W,
    addr_by_hash: Arc<DashMap<u32, SocketAddr>>,
    tunnel: Arc<Tunnel>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let recv = tokio::select! {
            r = socket.recv_from(&mut buf) => r,
            _ = cancel.cancelled() => return,
        };
        let (n, peer) = match recv {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "udp recv_from failed");
                continue;
            }
        };
        let hash = hash_addr(&peer);
        addr_by_hash.insert(hash, peer);

        let Ok(len) = u16::try_from(n) else {
            warn!(n, "oversized udp datagram dropped");
            continue;
        };
        if agent_wr.write_all(&len.to_be_bytes()).await.is_err()
            || agent_wr.write_all(&hash.to_be_bytes()).await.is_err()
            || agent_wr.write_all(&buf[..n]).await.is_err()
            || agent_wr.flush().await.is_err()
        {
            return;
        }
        tunnel.record_bytes_in(n as u64);
    }
}

/// Agent stream -> public socket.
async fn outbound_loop<R: tokio::io::AsyncRead + Unpin>(
    socket: Arc<UdpSocket>,
    mut agent_rd: R,
    addr_by_hash: Arc<DashMap<u32, SocketAddr>>,
    tunnel: Arc<Tunnel>,
    cancel: CancellationToken,
) {
    loop {
        let mut header = [0u8; 6];
        let read = tokio::select! {
            r = tokio::time::timeout(IDLE_READ_TIMEOUT, agent_rd.read_exact(&mut header)) => r,
            _ = cancel.cancelled() => return,
        };
        match read {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => return, // EOF or stream error
            Err(_) => {
                debug!(tunnel_id = %tunnel.id, "udp tunnel idle timeout");
                return;
            }
        }
        let len = u16::from_be_bytes([header[0], header[1]]) as usize;
        let hash = u32::from_be_bytes([header[2], header[3], header[4], header[5]]);
        let mut payload = vec![0u8; len];
        if agent_rd.read_exact(&mut payload).await.is_err() {
            return;
        }
        if let Some(addr) = addr_by_hash.get(&hash) {
            let _ = socket.send_to(&payload, *addr).await;
            tunnel.record_bytes_out(payload.len() as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_for_the_same_address() {
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        assert_eq!(hash_addr(&addr), hash_addr(&addr));
    }

    #[test]
    fn hash_differs_for_different_ports() {
        let a: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:5001".parse().unwrap();
        assert_ne!(hash_addr(&a), hash_addr(&b));
    }
}
