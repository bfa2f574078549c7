//! A single multiplexed data or control stream.
//!
//! `yamux::Stream` implements the `futures` crate's `AsyncRead`/`AsyncWrite`
//! traits; the rest of this codebase is written against `tokio::io`'s
//! traits (matching every example in the retrieval pack). [`Stream`]
//! bridges the two with `tokio_util::compat`, so everywhere else in the
//! crate a stream just looks like any other `tokio::io::AsyncRead +
//! AsyncWrite` value.

use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt};

/// An open multiplexed stream, readable/writable via `tokio::io`.
pub type Stream = Compat<yamux::Stream>;

pub(crate) fn wrap(inner: yamux::Stream) -> Stream {
    inner.compat()
}
