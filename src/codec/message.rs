//! Control-stream message types (§4.1 table).

use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelKind {
    Http,
    Tcp,
    Udp,
}

impl std::fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelKind::Http => write!(f, "http"),
            TunnelKind::Tcp => write!(f, "tcp"),
            TunnelKind::Udp => write!(f, "udp"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AuthResultCapabilities {
    pub inspector_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub code: ErrorCode,
    pub message: String,
    pub fatal: bool,
}

/// Every message exchanged on a control stream, in either direction.
///
/// Tagged internally (`{"type": "...", ...}` equivalent under bincode,
/// which encodes the variant index) so a single frame type covers both
/// directions — see the direction column in the spec's message table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// A->S: initial auth attempt.
    Auth { token: String },
    /// S->A: result of an Auth attempt. Always the first server->agent
    /// message on a primary control stream; nothing else may precede it.
    AuthResult {
        success: bool,
        error: Option<String>,
        error_code: Option<ErrorCode>,
        client_id: String,
        max_tunnels: i64,
        server_base_name: String,
        session_id: String,
        session_secret: String,
        min_client_version: String,
        capabilities: AuthResultCapabilities,
    },
    /// A->S: join an existing client's session pool as a data connection.
    JoinSession { client_id: String, session_secret: String },
    /// S->A: result of a JoinSession attempt.
    JoinSessionResult { success: bool, error: Option<String> },
    /// A->S: request a new tunnel.
    TunnelRequest {
        kind: TunnelKind,
        /// Desired subdomain (HTTP) or desired port (TCP/UDP), caller's choice.
        subdomain: Option<String>,
        port: Option<u16>,
        agent_local_port: u16,
        name: Option<String>,
        request_id: u64,
    },
    /// S->A: tunnel created successfully.
    TunnelCreated {
        tunnel_id: String,
        kind: TunnelKind,
        /// URL for HTTP tunnels, "host:port" for TCP/UDP.
        url_or_addr: String,
        request_id: u64,
    },
    /// S->A: tunnel request failed; recoverable.
    TunnelError { code: ErrorCode, message: String, request_id: u64 },
    /// A->S: close a tunnel the agent owns.
    TunnelClose { tunnel_id: String },
    /// S->A: acknowledges a tunnel has been torn down (agent- or
    /// server-initiated).
    TunnelClosed { tunnel_id: String },
    /// A<->S: keepalive.
    Ping,
    Pong,
    /// S->A: cooperative shutdown notice.
    ServerShutdown { reason: String },
    /// S->A: protocol-level error. `fatal=true` means the session is closed
    /// right after this frame is sent.
    Error(ErrorFrame),
}

impl Message {
    pub fn error(code: ErrorCode, message: impl Into<String>, fatal: bool) -> Self {
        Message::Error(ErrorFrame { code, message: message.into(), fatal })
    }
}
