//! A single exposed tunnel: one HTTP subdomain, or one TCP/UDP port,
//! owned by exactly one [`crate::client::Client`].

use crate::codec::TunnelKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;

/// Kind-specific resources a tunnel holds for the lifetime of its lease.
pub enum TunnelResource {
    Http { subdomain: String },
    Tcp { port: u16 },
    Udp { port: u16 },
}

pub struct Tunnel {
    pub id: String,
    pub owner_client_id: String,
    pub kind: TunnelKind,
    pub resource: TunnelResource,
    pub agent_local_port: u16,
    pub name: Option<String>,
    pub created_at: Instant,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    /// Bounds concurrent in-flight HTTP requests per tunnel
    /// (`server.max_concurrent_requests_per_tunnel`); unused by TCP/UDP.
    /// `Arc`-wrapped so the router can hold an owned permit across a
    /// spawned WebSocket-upgrade copy task.
    pub request_slots: Arc<Semaphore>,
}

impl Tunnel {
    pub fn new(
        id: String,
        owner_client_id: String,
        kind: TunnelKind,
        resource: TunnelResource,
        agent_local_port: u16,
        name: Option<String>,
        max_concurrent_requests: usize,
    ) -> Self {
        Self {
            id,
            owner_client_id,
            kind,
            resource,
            agent_local_port,
            name,
            created_at: Instant::now(),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            request_slots: Arc::new(Semaphore::new(max_concurrent_requests.max(1))),
        }
    }

    pub fn record_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub fn subdomain(&self) -> Option<&str> {
        match &self.resource {
            TunnelResource::Http { subdomain } => Some(subdomain),
            _ => None,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match &self.resource {
            TunnelResource::Tcp { port } | TunnelResource::Udp { port } => Some(*port),
            TunnelResource::Http { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_counters_accumulate() {
        let tunnel = Tunnel::new(
            "t1".into(),
            "c1".into(),
            TunnelKind::Http,
            TunnelResource::Http { subdomain: "bench".into() },
            3000,
            None,
            100,
        );
        tunnel.record_bytes_in(10);
        tunnel.record_bytes_in(5);
        tunnel.record_bytes_out(2);
        assert_eq!(tunnel.bytes_in(), 15);
        assert_eq!(tunnel.bytes_out(), 2);
        assert_eq!(tunnel.subdomain(), Some("bench"));
        assert_eq!(tunnel.port(), None);
    }
}
