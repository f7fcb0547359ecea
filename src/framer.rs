//! Stream framer: writer-side batching, heartbeat, and flush state machine.
//!
//! The framer accumulates outgoing bytes into a pending frame keyed by
//! `(file, event)` and writes encoded frames into an [`AsyncWrite`] sink.
//! A pending frame is flushed when its data reaches the frame-size
//! threshold, when the batch window elapses, or on an explicit flush. When
//! the sink has been idle for a full heartbeat interval an empty heartbeat
//! frame keeps the connection alive.
//!
//! # Architecture
//!
//! ```text
//! FileFollower ──► send() ──► pending frame ──► sink (HTTP response body)
//!                                 ▲
//!                  batch timer ───┤
//!                  heartbeats ────┘   (one background task)
//! ```
//!
//! A framer is single-use: create, [`run`](StreamFramer::run), send, then
//! [`destroy`](StreamFramer::destroy). Sink write errors are sticky: once a
//! write fails, the exit token fires and every later send returns the stored
//! error. The framer never shuts the sink down; its owner closes it.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::{encode_frame, StreamFrame};

/// Default maximum idle time between sink writes.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Default maximum time a non-empty pending frame may wait before flushing.
pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_millis(200);

/// Default pending-data threshold that forces an immediate flush.
pub const DEFAULT_FRAME_SIZE: usize = 64 * 1024;

/// Boxed sink the framer writes encoded frames into.
pub type FrameSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Configuration for a [`StreamFramer`].
#[derive(Debug, Clone)]
pub struct FramerConfig {
    /// A heartbeat frame is emitted if the sink has been idle this long.
    pub heartbeat_interval: Duration,
    /// A non-empty pending frame is flushed after waiting this long.
    pub batch_window: Duration,
    /// A pending frame is flushed as soon as its data reaches this size.
    pub frame_size: usize,
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            batch_window: DEFAULT_BATCH_WINDOW,
            frame_size: DEFAULT_FRAME_SIZE,
        }
    }
}

/// Frame being accumulated before its flush.
struct Pending {
    file: String,
    event: String,
    offset: i64,
    data: BytesMut,
}

/// State shared between callers and the background task.
struct Inner {
    sink: FrameSink,
    pending: Option<Pending>,
    last_write: Instant,
    sink_err: Option<Arc<std::io::Error>>,
    destroyed: bool,
}

/// Writer-side framing state machine. See the module docs for the contract.
pub struct StreamFramer {
    inner: Arc<Mutex<Inner>>,
    config: FramerConfig,
    /// Deadline for the batch-window flush; re-armed on every send.
    batch_deadline: Arc<watch::Sender<Option<Instant>>>,
    shutdown: CancellationToken,
    exit: CancellationToken,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StreamFramer {
    /// Create a framer writing into `sink` with the given thresholds.
    pub fn new(sink: FrameSink, config: FramerConfig) -> Self {
        let (batch_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                sink,
                pending: None,
                last_write: Instant::now(),
                sink_err: None,
                destroyed: false,
            })),
            config,
            batch_deadline: Arc::new(batch_tx),
            shutdown: CancellationToken::new(),
            exit: CancellationToken::new(),
            task: std::sync::Mutex::new(None),
        }
    }

    /// Start background heartbeating and batch-timer flushing.
    ///
    /// Must be called exactly once before [`send`](Self::send); further
    /// calls are ignored.
    pub fn run(&self) {
        let mut slot = self.task.lock().expect("framer task lock poisoned");
        if slot.is_some() {
            debug!("framer already running");
            return;
        }

        let inner = Arc::clone(&self.inner);
        let config = self.config.clone();
        let batch_tx = Arc::clone(&self.batch_deadline);
        let batch_rx = self.batch_deadline.subscribe();
        let shutdown = self.shutdown.clone();
        let exit = self.exit.clone();
        *slot = Some(tokio::spawn(run_loop(
            inner, config, batch_tx, batch_rx, shutdown, exit,
        )));
    }

    /// Token that fires once the framer has stopped, either after
    /// [`destroy`](Self::destroy) or after a sink write error.
    pub fn exit_token(&self) -> CancellationToken {
        self.exit.clone()
    }

    /// Append `data` to the pending frame keyed by `(file, event)`.
    ///
    /// A pending frame with a different key is flushed first. The pending
    /// frame's offset is pinned when the frame is created and always refers
    /// to the position of the first byte in its data. Reaching the
    /// frame-size threshold flushes before returning.
    pub async fn send(&self, file: &str, event: &str, data: &[u8], offset: i64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        check_usable(&inner)?;

        let key_changed = inner
            .pending
            .as_ref()
            .is_some_and(|p| p.file != file || p.event != event);
        if key_changed {
            flush_locked(&mut inner, &self.exit).await?;
        }

        match inner.pending.as_mut() {
            Some(pending) => pending.data.extend_from_slice(data),
            None => {
                inner.pending = Some(Pending {
                    file: file.to_string(),
                    event: event.to_string(),
                    offset,
                    data: BytesMut::from(data),
                });
            }
        }

        // The batch window restarts on every send, not only the first.
        let _ = self
            .batch_deadline
            .send(Some(Instant::now() + self.config.batch_window));

        let size = inner.pending.as_ref().map_or(0, |p| p.data.len());
        if size >= self.config.frame_size {
            flush_locked(&mut inner, &self.exit).await?;
            let _ = self.batch_deadline.send(None);
        }

        Ok(())
    }

    /// Emit the pending frame immediately, if any.
    pub async fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        check_usable(&inner)?;
        flush_locked(&mut inner, &self.exit).await?;
        let _ = self.batch_deadline.send(None);
        Ok(())
    }

    /// Stop background activity, flush any pending frame, and signal exit.
    ///
    /// Idempotent; the sink is left open for the owner to close.
    pub async fn destroy(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner.destroyed {
                return;
            }
            inner.destroyed = true;
        }

        self.shutdown.cancel();
        let task = self.task.lock().expect("framer task lock poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let mut inner = self.inner.lock().await;
        if inner.sink_err.is_none() {
            if let Err(e) = flush_locked(&mut inner, &self.exit).await {
                debug!(error = %e, "flush during framer destroy failed");
            }
        }
        drop(inner);

        self.exit.cancel();
    }
}

impl Drop for StreamFramer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Ok(mut slot) = self.task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
        self.exit.cancel();
    }
}

/// Reject sends on a destroyed framer and replay sticky sink errors.
fn check_usable(inner: &Inner) -> Result<()> {
    if inner.destroyed {
        return Err(Error::FramerDestroyed);
    }
    if let Some(err) = &inner.sink_err {
        return Err(Error::Sink(Arc::clone(err)));
    }
    Ok(())
}

/// Write the pending frame through the sink and reset it.
async fn flush_locked(inner: &mut Inner, exit: &CancellationToken) -> Result<()> {
    let Some(pending) = inner.pending.take() else {
        return Ok(());
    };
    let frame = StreamFrame {
        offset: pending.offset,
        data: pending.data.freeze(),
        file: pending.file,
        event: pending.event,
    };
    write_frame(inner, exit, &frame).await
}

/// Encode and write one frame. A write error is recorded as sticky and
/// fires the exit token.
async fn write_frame(inner: &mut Inner, exit: &CancellationToken, frame: &StreamFrame) -> Result<()> {
    let bytes = encode_frame(frame)?;

    if let Err(e) = write_all_flush(&mut inner.sink, &bytes).await {
        let shared = Arc::new(e);
        inner.sink_err = Some(Arc::clone(&shared));
        exit.cancel();
        return Err(Error::Sink(shared));
    }

    inner.last_write = Instant::now();
    Ok(())
}

async fn write_all_flush(sink: &mut FrameSink, bytes: &[u8]) -> std::io::Result<()> {
    sink.write_all(bytes).await?;
    sink.flush().await
}

/// Background task: batch-window flushes and idle heartbeats.
async fn run_loop(
    inner: Arc<Mutex<Inner>>,
    config: FramerConfig,
    batch_tx: Arc<watch::Sender<Option<Instant>>>,
    mut batch_rx: watch::Receiver<Option<Instant>>,
    shutdown: CancellationToken,
    exit: CancellationToken,
) {
    let start = Instant::now() + config.heartbeat_interval;
    let mut heartbeat = time::interval_at(start, config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        let deadline = *batch_rx.borrow_and_update();

        tokio::select! {
            _ = shutdown.cancelled() => break,

            changed = batch_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                // Deadline moved; recompute on the next iteration.
            }

            _ = heartbeat.tick() => {
                let mut inner = inner.lock().await;
                if inner.destroyed || inner.sink_err.is_some() {
                    break;
                }
                let idle = inner.last_write.elapsed() >= config.heartbeat_interval;
                if idle && inner.pending.is_none() {
                    if write_frame(&mut inner, &exit, &StreamFrame::heartbeat())
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }

            _ = sleep_until_opt(deadline) => {
                let mut inner = inner.lock().await;
                if inner.destroyed || inner.sink_err.is_some() {
                    break;
                }
                let _ = batch_tx.send(None);
                if flush_locked(&mut inner, &exit).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Sleep until the batch deadline, or forever while no frame is pending.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
