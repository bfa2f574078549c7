//! Client Manager, §4.6: the server's single source of truth for which
//! agents are connected and what they own.
//!
//! Reads and mutations go through `DashMap`s so lookups never block on a
//! global lock the way the teacher's `AppState` kept a `DashMap` of
//! agents. Operations that need a consistent view across several clients
//! (e.g. "close every tunnel for this user") snapshot the relevant ids
//! first and then act, rather than holding a lock across awaits — the
//! lock order is always Server -> ClientManager -> Client -> Tunnel, and
//! never the reverse.

use crate::client::Client;
use crate::tunnel::Tunnel;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Default)]
pub struct ClientManager {
    clients: DashMap<String, Arc<Client>>,
    by_user: DashMap<String, HashSet<String>>,
    /// subdomain -> tunnel id, enforcing global uniqueness (§4.8).
    subdomains: DashMap<String, String>,
    /// "tcp:{port}" / "udp:{port}" -> tunnel id, enforcing the port
    /// allocator's exclusivity at the routing layer too.
    ports: DashMap<String, String>,
}

impl ClientManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, client: Arc<Client>) {
        self.by_user.entry(client.user_id.clone()).or_default().insert(client.id.clone());
        self.clients.insert(client.id.clone(), client);
    }

    pub fn remove(&self, client_id: &str) -> Option<Arc<Client>> {
        let removed = self.clients.remove(client_id).map(|(_, c)| c);
        if let Some(client) = &removed {
            if let Some(mut ids) = self.by_user.get_mut(&client.user_id) {
                ids.remove(client_id);
                if ids.is_empty() {
                    drop(ids);
                    self.by_user.remove(&client.user_id);
                }
            }
            client.close();
        }
        removed
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<Client>> {
        self.clients.get(client_id).map(|c| c.clone())
    }

    pub fn snapshot(&self) -> Vec<Arc<Client>> {
        self.clients.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn clients_for_user(&self, user_id: &str) -> Vec<Arc<Client>> {
        self.by_user
            .get(user_id)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// All tunnels owned by `user_id`'s clients, across every connection.
    pub async fn tunnels_for_user(&self, user_id: &str) -> Vec<Arc<Tunnel>> {
        let mut out = Vec::new();
        for client in self.clients_for_user(user_id) {
            out.extend(client.snapshot_tunnels().await);
        }
        out
    }

    /// Every tunnel across every connected client — admin view.
    pub async fn all_tunnels(&self) -> Vec<Arc<Tunnel>> {
        let mut out = Vec::new();
        for client in self.snapshot() {
            out.extend(client.snapshot_tunnels().await);
        }
        out
    }

    pub async fn total_tunnel_count(&self) -> usize {
        let mut total = 0;
        for client in self.snapshot() {
            total += client.tunnel_count().await;
        }
        total
    }

    /// Closes a tunnel if `requester_user_id` owns it or `is_admin`.
    /// Returns `true` if a tunnel was found and closed.
    pub async fn close_tunnel(
        &self,
        tunnel_id: &str,
        requester_user_id: &str,
        is_admin: bool,
    ) -> bool {
        for client in self.snapshot() {
            if !is_admin && client.user_id != requester_user_id {
                continue;
            }
            if client.remove_tunnel(tunnel_id).await.is_some() {
                return true;
            }
        }
        false
    }

    /// Signals every connected client to disconnect (used by graceful
    /// shutdown, §4.13). Does not wait for them to actually leave.
    pub fn close_all(&self) {
        for entry in self.clients.iter() {
            entry.value().close();
        }
    }

    /// Atomically reserves `subdomain` for `tunnel_id`. Returns `false`
    /// (without side effect) if it's already taken.
    pub fn reserve_subdomain(&self, subdomain: &str, tunnel_id: &str) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.subdomains.entry(subdomain.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(e) => {
                e.insert(tunnel_id.to_string());
                true
            }
        }
    }

    pub fn release_subdomain(&self, subdomain: &str) {
        self.subdomains.remove(subdomain);
    }

    pub fn lookup_subdomain(&self, subdomain: &str) -> Option<String> {
        self.subdomains.get(subdomain).map(|v| v.clone())
    }

    fn port_key(proto: &str, port: u16) -> String {
        format!("{proto}:{port}")
    }

    pub fn reserve_port(&self, proto: &str, port: u16, tunnel_id: &str) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.ports.entry(Self::port_key(proto, port)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(e) => {
                e.insert(tunnel_id.to_string());
                true
            }
        }
    }

    pub fn release_port(&self, proto: &str, port: u16) {
        self.ports.remove(&Self::port_key(proto, port));
    }

    pub fn lookup_port(&self, proto: &str, port: u16) -> Option<String> {
        self.ports.get(&Self::port_key(proto, port)).map(|v| v.clone())
    }

    /// Resolves a subdomain or port-registered tunnel id to the owning
    /// client and tunnel, scanning connected clients. Used on the request
    /// path once the registry above has already narrowed to a single
    /// tunnel id.
    pub async fn find_tunnel(&self, tunnel_id: &str) -> Option<(Arc<Client>, Arc<Tunnel>)> {
        for client in self.snapshot() {
            if let Some(tunnel) = client.get_tunnel(tunnel_id).await {
                return Some((client, tunnel));
            }
        }
        None
    }

    pub async fn stats(&self) -> ClientManagerStats {
        let clients = self.snapshot();
        let mut tunnels = 0;
        for client in &clients {
            tunnels += client.tunnel_count().await;
        }
        ClientManagerStats { connected_clients: clients.len(), total_tunnels: tunnels }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ClientManagerStats {
    pub connected_clients: usize,
    pub total_tunnels: usize,
}
