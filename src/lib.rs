//! Library surface for the tunnel relay server, used by integration
//! tests and by anything embedding the server in-process.

pub mod admission;
pub mod api;
pub mod auth;
pub mod bandwidth;
pub mod client;
pub mod client_manager;
pub mod codec;
pub mod config;
pub mod error;
pub mod inspect;
pub mod persistence;
pub mod plan;
pub mod port_allocator;
pub mod router;
pub mod server;
pub mod stream_pool;
pub mod subdomain;
pub mod tcp_manager;
pub mod tls;
pub mod transport;
pub mod tunnel;
pub mod udp_manager;
