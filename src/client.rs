//! An authenticated agent: its primary control session, any joined data
//! sessions, the tunnels it owns, and the stream pool built on top of
//! those sessions.

use crate::auth::MAX_DATA_SESSIONS;
use crate::bandwidth::BandwidthLimiter;
use crate::plan::{ApiTokenRecord, Plan};
use crate::stream_pool::StreamPool;
use crate::transport::Session;
use crate::tunnel::Tunnel;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

pub struct Client {
    pub id: String,
    pub remote_addr: SocketAddr,
    pub user_id: String,
    pub is_admin: bool,
    pub plan: Plan,
    pub token_record: Option<ApiTokenRecord>,
    pub connected_at: SystemTime,
    last_ping_unix_ms: AtomicI64,
    pub session_secret: String,

    primary_session: Arc<Session>,
    data_sessions: Mutex<Vec<Arc<Session>>>,

    tunnels: RwLock<HashMap<String, Arc<Tunnel>>>,
    pub stream_pool: StreamPool,

    pub cancel: CancellationToken,
    /// Serializes writes to the primary control stream; every
    /// `Message` send takes this so server->agent frames never interleave.
    pub control_write_lock: Mutex<()>,

    pub bandwidth: BandwidthLimiter,
    closed: AtomicBool,
}

impl Client {
    pub fn new(
        id: String,
        remote_addr: SocketAddr,
        user_id: String,
        is_admin: bool,
        plan: Plan,
        token_record: Option<ApiTokenRecord>,
        session_secret: String,
        primary_session: Arc<Session>,
        stream_pool: StreamPool,
        bandwidth: BandwidthLimiter,
    ) -> Self {
        Self {
            id,
            remote_addr,
            user_id,
            is_admin,
            plan,
            token_record,
            connected_at: SystemTime::now(),
            last_ping_unix_ms: AtomicI64::new(now_ms()),
            session_secret,
            primary_session,
            data_sessions: Mutex::new(Vec::new()),
            tunnels: RwLock::new(HashMap::new()),
            stream_pool,
            cancel: CancellationToken::new(),
            control_write_lock: Mutex::new(()),
            bandwidth,
            closed: AtomicBool::new(false),
        }
    }

    pub fn primary_session(&self) -> &Arc<Session> {
        &self.primary_session
    }

    pub fn touch_ping(&self) {
        self.last_ping_unix_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn millis_since_last_ping(&self) -> i64 {
        now_ms() - self.last_ping_unix_ms.load(Ordering::Relaxed)
    }

    /// Adds a joined data session, enforcing the per-client cap.
    pub async fn add_data_session(&self, session: Arc<Session>) -> Result<(), ()> {
        let mut sessions = self.data_sessions.lock().await;
        if sessions.len() >= MAX_DATA_SESSIONS {
            return Err(());
        }
        sessions.push(session);
        Ok(())
    }

    pub async fn data_session_count(&self) -> usize {
        self.data_sessions.lock().await.len()
    }

    /// All sessions (primary first) available for the stream pool to pull
    /// connections from.
    pub async fn all_sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions = vec![self.primary_session.clone()];
        sessions.extend(self.data_sessions.lock().await.iter().cloned());
        sessions
    }

    pub async fn insert_tunnel(&self, tunnel: Arc<Tunnel>) {
        self.tunnels.write().await.insert(tunnel.id.clone(), tunnel);
    }

    pub async fn remove_tunnel(&self, tunnel_id: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.write().await.remove(tunnel_id)
    }

    pub async fn get_tunnel(&self, tunnel_id: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.read().await.get(tunnel_id).cloned()
    }

    pub async fn tunnel_count(&self) -> usize {
        self.tunnels.read().await.len()
    }

    pub async fn snapshot_tunnels(&self) -> Vec<Arc<Tunnel>> {
        self.tunnels.read().await.values().cloned().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Idempotent: cancels everything this client owns. Safe to call from
    /// multiple places (ping timeout, explicit disconnect, server
    /// shutdown) concurrently.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.primary_session.go_away();
    }
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_millis() as i64
}
