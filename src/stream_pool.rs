//! Stream Pool, §4.7.
//!
//! Keeps a small number of already-open multiplexed streams warm per
//! client so that proxying a new public connection doesn't pay a
//! round-trip to open one on the hot path. A background task refills the
//! pool toward its target size whenever it dips, backing off when the
//! client has gone away or stream opens start failing.

use crate::transport::{Session, Stream};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const POOL_SIZE: usize = 24;
const REFILL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(50);
const ERROR_BACKOFF: std::time::Duration = std::time::Duration::from_millis(100);

pub struct StreamPool {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Stream>>>,
    refiller: tokio::task::JoinHandle<()>,
}

impl StreamPool {
    /// Spawns the background refiller against `session`. The pool shares
    /// `cancel` with its owning client so it stops trying once the client
    /// disconnects.
    pub fn spawn(session: Arc<Session>, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(POOL_SIZE);
        let refiller = tokio::spawn(refill_loop(session, tx, cancel));
        Self { rx: Arc::new(tokio::sync::Mutex::new(rx)), refiller }
    }

    /// Takes a warm stream if one is ready, without waiting for the
    /// refiller. Callers needing a stream right now and willing to pay the
    /// open latency should fall back to `session.open_stream()` directly
    /// on `None`.
    pub fn try_take(&self) -> Option<Stream> {
        self.rx.try_lock().ok().and_then(|mut rx| rx.try_recv().ok())
    }

    pub async fn take(&self) -> Option<Stream> {
        self.rx.lock().await.recv().await
    }
}

impl Drop for StreamPool {
    fn drop(&mut self) {
        self.refiller.abort();
    }
}

async fn refill_loop(session: Arc<Session>, tx: mpsc::Sender<Stream>, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() || session.is_going_away() {
            return;
        }
        if tx.is_closed() {
            return;
        }
        if tx.capacity() == 0 {
            tokio::select! {
                _ = tokio::time::sleep(REFILL_INTERVAL) => continue,
                _ = cancel.cancelled() => return,
            }
        }
        match session.open_stream().await {
            Ok(stream) => {
                if tx.send(stream).await.is_err() {
                    return;
                }
                tokio::select! {
                    _ = tokio::time::sleep(REFILL_INTERVAL) => {}
                    _ = cancel.cancelled() => return,
                }
            }
            Err(e) => {
                debug!(error = %e, "stream pool refill failed, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    _ = cancel.cancelled() => return,
                }
            }
        }
    }
}
