//! Request Inspector, §4.11.
//!
//! Keeps a bounded, in-memory ring of recent HTTP exchanges per tunnel so
//! a dashboard can show "what just hit my tunnel" without a database.
//! Persistence (if an [`ExchangeRepo`] is configured) is a fire-and-forget
//! side effect, never on the proxying hot path.

use crate::persistence::{ExchangeRecord, ExchangeRepo};
use rand::RngCore;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct Exchange {
    /// Random 128-bit ID, not a sequential counter — stable identity for
    /// a `replay_ref` to point back at regardless of ring eviction order.
    pub id: u128,
    pub tunnel_id: String,
    pub trace_id: Option<String>,
    pub replay_ref: Option<u128>,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub remote_ip: std::net::IpAddr,
    pub request_headers: Vec<(String, String)>,
    pub response_headers: Vec<(String, String)>,
    pub request_body: Vec<u8>,
    pub response_body: Vec<u8>,
    /// True size of the request body as declared, which may exceed
    /// `request_body.len()` once truncated to `max_body_size`.
    pub request_body_size: usize,
    /// True size of the response body; reported size is
    /// `max(captured_len, declared_content_length)` per §4.8.2.
    pub response_body_size: usize,
    pub started_at: std::time::SystemTime,
    pub duration_ms: u64,
}

fn random_id() -> u128 {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    u128::from_be_bytes(bytes)
}

struct Ring {
    entries: VecDeque<Exchange>,
    capacity: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self { entries: VecDeque::with_capacity(capacity.min(256)), capacity }
    }

    fn push(&mut self, exchange: Exchange) -> Exchange {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(exchange.clone());
        exchange
    }
}

pub struct Inspector {
    max_entries: usize,
    max_body_size: usize,
    rings: RwLock<HashMap<String, Ring>>,
    repo: Option<Arc<dyn ExchangeRepo>>,
}

impl Inspector {
    pub fn new(max_entries: usize, max_body_size: usize, repo: Option<Arc<dyn ExchangeRepo>>) -> Self {
        Self { max_entries, max_body_size, rings: RwLock::new(HashMap::new()), repo }
    }

    fn truncate(&self, body: Vec<u8>) -> Vec<u8> {
        if body.len() > self.max_body_size {
            body[..self.max_body_size].to_vec()
        } else {
            body
        }
    }

    /// Records an exchange for `tunnel_id`, evicting the oldest entry if
    /// the per-tunnel ring is full, and fires off persistence without
    /// waiting for it. Returns the stored exchange's ID, so a caller
    /// building a replay can set `replay_ref` on the next call.
    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        tunnel_id: &str,
        trace_id: Option<String>,
        replay_ref: Option<u128>,
        method: String,
        path: String,
        status: u16,
        remote_ip: std::net::IpAddr,
        request_headers: Vec<(String, String)>,
        response_headers: Vec<(String, String)>,
        request_body: Vec<u8>,
        response_body: Vec<u8>,
        started_at: std::time::SystemTime,
        duration_ms: u64,
    ) -> u128 {
        let request_body_size = request_body.len();
        let response_body_size = response_body.len();
        let exchange = Exchange {
            id: random_id(),
            tunnel_id: tunnel_id.to_string(),
            trace_id,
            replay_ref,
            method,
            path,
            status,
            remote_ip,
            request_headers,
            response_headers,
            request_body: self.truncate(request_body),
            response_body: self.truncate(response_body),
            request_body_size,
            response_body_size,
            started_at,
            duration_ms,
        };

        let stored = {
            let mut rings = self.rings.write().await;
            let ring = rings.entry(tunnel_id.to_string()).or_insert_with(|| Ring::new(self.max_entries));
            ring.push(exchange)
        };
        let id = stored.id;

        if let Some(repo) = &self.repo {
            let repo = repo.clone();
            let tunnel_id = tunnel_id.to_string();
            tokio::spawn(async move {
                repo.record(ExchangeRecord {
                    tunnel_id,
                    method: stored.method,
                    path: stored.path,
                    status: stored.status,
                    remote_ip: stored.remote_ip,
                    request_body: stored.request_body,
                    response_body: stored.response_body,
                    request_headers: stored.request_headers,
                    response_headers: stored.response_headers,
                    started_at: stored.started_at,
                    duration_ms: stored.duration_ms,
                })
                .await;
            });
        }

        id
    }

    pub async fn recent(&self, tunnel_id: &str, limit: usize) -> Vec<Exchange> {
        let rings = self.rings.read().await;
        rings
            .get(tunnel_id)
            .map(|ring| ring.entries.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub async fn clear(&self, tunnel_id: &str) {
        self.rings.write().await.remove(tunnel_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> std::net::IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn ring_evicts_oldest_past_capacity() {
        let inspector = Inspector::new(2, 1024, None);
        for i in 0..3 {
            inspector
                .record(
                    "t1",
                    None,
                    None,
                    "GET".into(),
                    format!("/{i}"),
                    200,
                    ip(),
                    vec![],
                    vec![],
                    vec![],
                    vec![],
                    std::time::SystemTime::now(),
                    1,
                )
                .await;
        }
        let recent = inspector.recent("t1", 10).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].path, "/2");
        assert_eq!(recent[1].path, "/1");
    }

    #[tokio::test]
    async fn bodies_are_truncated_to_max_size() {
        let inspector = Inspector::new(10, 4, None);
        inspector
            .record(
                "t1",
                None,
                None,
                "POST".into(),
                "/".into(),
                200,
                ip(),
                vec![],
                vec![],
                b"0123456789".to_vec(),
                vec![],
                std::time::SystemTime::now(),
                1,
            )
            .await;
        let recent = inspector.recent("t1", 1).await;
        assert_eq!(recent[0].request_body, b"0123");
    }
}
