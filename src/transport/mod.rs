//! Transport (Multiplexer), §4.2.
//!
//! One duplex TCP connection is turned into many independent ordered byte
//! streams using [`yamux`]. Stream #1 (the first stream either side opens)
//! is always the control channel; every other stream is a data stream.
//!
//! Compression negotiation happens before the multiplexer ever sees the
//! socket: each side writes one capability byte, and if both agree, the
//! raw `TcpStream` is wrapped in a zstd encoder/decoder pair first.

mod compression;
mod session;
mod stream;

pub use compression::negotiate_compression;
pub use session::{Session, SessionMode};
pub use stream::Stream;

/// Keepalive ping interval for the control channel (§4.2).
pub const KEEPALIVE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);
/// Write timeout applied to control-stream writes (§4.2).
pub const WRITE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
/// Default per-stream receive window (§4.2), overridable via
/// `server.yamux_window_size`.
pub const DEFAULT_RECEIVE_WINDOW: u32 = 4 * 1024 * 1024;
