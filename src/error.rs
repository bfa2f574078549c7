//! Crate-wide error types.
//!
//! Each component exposes its own narrow error enum; [`ServerError`]
//! composes them for code paths that cross component boundaries (mainly
//! the control-connection loop and `Server` lifecycle).

use thiserror::Error;

/// Stable wire identifiers sent to the agent in `tunnel_error` / `auth_result`
/// frames. These strings are part of the protocol and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ProtocolError,
    PermissionDenied,
    TokenExpired,
    TunnelLimit,
    PortUnavailable,
    SubdomainTaken,
    SubdomainInvalid,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ProtocolError => "protocol_error",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::TokenExpired => "token_expired",
            ErrorCode::TunnelLimit => "tunnel_limit",
            ErrorCode::PortUnavailable => "port_unavailable",
            ErrorCode::SubdomainTaken => "subdomain_taken",
            ErrorCode::SubdomainInvalid => "subdomain_invalid",
        }
    }
}

#[derive(Debug, Error)]
pub enum PortAllocError {
    #[error("requested port {0} is out of the configured range")]
    OutOfRange(u16),
    #[error("port {0} is already in use")]
    InUse(u16),
    #[error("no free port in the configured range")]
    Exhausted,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame exceeds maximum size ({0} > {1})")]
    FrameTooLarge(u32, u32),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("session closed")]
    Closed,
    #[error("go-away already sent")]
    GoneAway,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("multiplexer error: {0}")]
    Mux(String),
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("source ip is banned")]
    Banned,
    #[error("accept rate exceeded")]
    RateLimited,
    #[error("connection capacity exceeded")]
    CapacityExceeded,
}

#[derive(Debug, Error, Clone)]
pub enum AuthError {
    #[error("token expired")]
    TokenExpired,
    #[error("permission denied")]
    PermissionDenied,
    #[error("invalid token")]
    InvalidToken,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    PortAlloc(#[from] PortAllocError),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error("{0}")]
    Other(String),
}
