//! Admin REST API, §4.14 (supplemental).
//!
//! A small read-only surface over the live `ClientManager`/`Inspector`
//! state, in the same style as the teacher's original `/api/agents`
//! endpoint: plain `Json<Vec<_>>` DTOs, no auth of their own (operators
//! are expected to keep this port off the public internet or behind
//! their own reverse proxy).

use crate::client_manager::{ClientManager, ClientManagerStats};
use crate::inspect::Inspector;
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone)]
pub struct ApiState {
    pub client_manager: Arc<ClientManager>,
    pub inspector: Arc<Inspector>,
}

/// Response item representing one connected client and its tunnels.
#[derive(Serialize)]
pub struct ClientListItem {
    pub client_id: String,
    pub user_id: String,
    pub remote_addr: String,
    pub tunnel_count: usize,
}

/// `GET /api/clients` — every currently connected client.
pub async fn list_clients(State(state): State<ApiState>) -> Json<Vec<ClientListItem>> {
    let mut items = Vec::new();
    for client in state.client_manager.snapshot() {
        items.push(ClientListItem {
            client_id: client.id.clone(),
            user_id: client.user_id.clone(),
            remote_addr: client.remote_addr.to_string(),
            tunnel_count: client.tunnel_count().await,
        });
    }
    Json(items)
}

/// `GET /api/stats` — connected client and total tunnel counts.
pub async fn stats(State(state): State<ApiState>) -> Json<ClientManagerStats> {
    Json(state.client_manager.stats().await)
}

/// `GET /healthz` — liveness probe for the admin API, distinct from the
/// public router's `/healthz`.
pub async fn healthz() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
pub struct RecentQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    20
}

#[derive(Serialize)]
pub struct ExchangeItem {
    pub method: String,
    pub path: String,
    pub status: u16,
    pub remote_ip: String,
    pub duration_ms: u64,
}

/// `GET /api/tunnels/:tunnel_id/exchanges` — recent inspected HTTP
/// exchanges for one tunnel, most-recent-first.
pub async fn tunnel_exchanges(
    State(state): State<ApiState>,
    Path(tunnel_id): Path<String>,
    Query(query): Query<RecentQuery>,
) -> Json<Vec<ExchangeItem>> {
    let items = state
        .inspector
        .recent(&tunnel_id, query.limit)
        .await
        .into_iter()
        .map(|e| ExchangeItem {
            method: e.method,
            path: e.path,
            status: e.status,
            remote_ip: e.remote_ip.to_string(),
            duration_ms: e.duration_ms,
        })
        .collect::<Vec<_>>();
    Json(items)
}
