//! A multiplexed session over one underlying duplex connection.

use super::stream::{wrap, Stream};
use crate::error::TransportError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use yamux::{Connection, Mode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// We expect the remote to open stream #1 (the control stream) — this
    /// is the role the server plays on every control connection.
    Server,
    /// We open stream #1 ourselves.
    Client,
}

/// One multiplexed connection. Owns a background task that drives the
/// yamux connection (required for the protocol to make progress even when
/// we never read/write directly on it) and forwards any stream the remote
/// opens into an internal queue.
pub struct Session {
    control: yamux::Control,
    inbound: tokio::sync::Mutex<mpsc::Receiver<yamux::Stream>>,
    driver: tokio::task::JoinHandle<()>,
    going_away: Arc<AtomicBool>,
}

impl Session {
    /// Wrap an accepted/dialed IO object as a multiplexed session and spawn
    /// its driver task. `window_size` sets the yamux per-stream receive
    /// window (`server.yamux_window_size`).
    pub fn new<IO>(io: IO, mode: SessionMode, window_size: u32, cancel: CancellationToken) -> Self
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut cfg = yamux::Config::default();
        cfg.set_receive_window(window_size);

        let yamux_mode = match mode {
            SessionMode::Server => Mode::Server,
            SessionMode::Client => Mode::Client,
        };
        let conn = Connection::new(io.compat(), cfg, yamux_mode);
        let control = conn.control();

        let (tx, rx) = mpsc::channel(32);
        let driver = tokio::spawn(drive(conn, tx, cancel));

        Session {
            control,
            inbound: tokio::sync::Mutex::new(rx),
            driver,
            going_away: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Open a new outbound stream. Used by the server to start proxying a
    /// public connection, and by the stream pool refiller.
    pub async fn open_stream(&self) -> Result<Stream, TransportError> {
        if self.going_away.load(Ordering::Acquire) {
            return Err(TransportError::GoneAway);
        }
        let mut control = self.control.clone();
        let stream = control
            .open_stream()
            .await
            .map_err(|e| TransportError::Mux(e.to_string()))?;
        Ok(wrap(stream))
    }

    /// Accept the next stream the remote side opened. The first call on a
    /// freshly dialed server-mode session returns the control stream.
    pub async fn accept_stream(&self) -> Option<Stream> {
        let mut rx = self.inbound.lock().await;
        rx.recv().await.map(wrap)
    }

    /// Signal that no more streams will be opened locally; in-flight
    /// streams are left to finish normally. The caller is responsible for
    /// giving them time to drain (§4.13 Stop waits 2s after issuing
    /// go-away on every session) before dropping the `Session`.
    pub fn go_away(&self) {
        self.going_away.store(true, Ordering::Release);
        let mut control = self.control.clone();
        tokio::spawn(async move {
            if let Err(e) = control.close().await {
                debug!(error = %e, "error closing yamux control during go-away");
            }
        });
    }

    pub fn is_going_away(&self) -> bool {
        self.going_away.load(Ordering::Acquire)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

async fn drive<IO>(
    mut conn: yamux::Connection<tokio_util::compat::Compat<IO>>,
    inbound_tx: mpsc::Sender<yamux::Stream>,
    cancel: CancellationToken,
) where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("yamux driver cancelled");
                return;
            }
            next = conn.next_stream() => {
                match next {
                    Ok(Some(stream)) => {
                        if inbound_tx.send(stream).await.is_err() {
                            // No one is accepting anymore; keep driving so
                            // outbound opens and pings still work, but drop
                            // the new inbound stream.
                            continue;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "yamux connection error");
                        return;
                    }
                    Ok(None) => {
                        debug!("yamux connection closed");
                        return;
                    }
                }
            }
        }
    }
}
