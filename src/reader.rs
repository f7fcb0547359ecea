//! Client-side reassembly of a frame stream into a plain byte stream.
//!
//! [`spawn_frame_stream`] decodes frames off a response body into a bounded
//! channel, discarding heartbeats. [`FrameReader`] consumes that channel as
//! a [`AsyncRead`], splicing a human-readable marker line into the output
//! wherever the server reported a file event, so a viewer tailing a log
//! sees truncations and deletions inline.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::protocol::{FrameDecoder, StreamFrame};

/// Bound on decoded frames waiting for the reader.
pub const FRAME_CHANNEL_CAPACITY: usize = 10;

/// Marker token spliced into the byte stream around file events.
const EVENT_MARKER_TOKEN: &str = "allocfs";

/// Spawn a background task decoding `body` into a bounded frame channel.
///
/// Heartbeats never reach the channel. The task stops on end of stream, on
/// a decode or read error, or when `cancel` fires; the channel closes when
/// the task stops.
pub fn spawn_frame_stream<R>(body: R, cancel: CancellationToken) -> mpsc::Receiver<StreamFrame>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    tokio::spawn(decode_loop(body, tx, cancel));
    rx
}

async fn decode_loop<R>(mut body: R, tx: mpsc::Sender<StreamFrame>, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 8 * 1024];

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return,
            res = body.read(&mut buf) => match res {
                Ok(0) => return,
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "frame stream read failed");
                    return;
                }
            },
        };

        let frames = match decoder.push(&buf[..n]) {
            Ok(frames) => frames,
            Err(e) => {
                debug!(error = %e, "frame stream decode failed");
                return;
            }
        };
        for frame in frames {
            if frame.is_heartbeat() {
                continue;
            }
            if tx.send(frame).await.is_err() {
                return;
            }
        }
    }
}

/// Reads a channel of frames as a sequential byte stream.
///
/// Data payloads are yielded in arrival order; a frame carrying an event
/// first yields the marker line
/// `\n` + `allocfs: "<event>"` + `\n` before its data (if any). Closing the
/// reader cancels the shared token exactly once.
pub struct FrameReader {
    frames: mpsc::Receiver<StreamFrame>,
    cancel: CancellationToken,
    closed: bool,

    frame: Option<StreamFrame>,
    frame_offset: usize,

    marker: Option<Vec<u8>>,
    marker_offset: usize,

    /// Source-file offset of the most recently taken frame.
    byte_offset: i64,
}

impl FrameReader {
    /// Wrap a frame channel; `cancel` is the signal shared with the
    /// producing request.
    pub fn new(frames: mpsc::Receiver<StreamFrame>, cancel: CancellationToken) -> Self {
        Self {
            frames,
            cancel,
            closed: false,
            frame: None,
            frame_offset: 0,
            marker: None,
            marker_offset: 0,
            byte_offset: 0,
        }
    }

    /// Offset into the source file of the frame currently being read.
    pub fn offset(&self) -> i64 {
        self.byte_offset
    }

    /// Cancel the stream of frames. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.cancel.cancel();
        self.closed = true;
    }
}

impl AsyncRead for FrameReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.frame.is_none() {
                match this.frames.poll_recv(cx) {
                    Poll::Ready(Some(frame)) => {
                        this.byte_offset = frame.offset;
                        if !frame.event.is_empty() {
                            let line = format!("\n{}: {:?}\n", EVENT_MARKER_TOKEN, frame.event);
                            this.marker = Some(line.into_bytes());
                            this.marker_offset = 0;
                        }
                        this.frame = Some(frame);
                        this.frame_offset = 0;
                    }
                    // Channel closed: end of stream.
                    Poll::Ready(None) => return Poll::Ready(Ok(())),
                    Poll::Pending => return Poll::Pending,
                }
            }

            // Drain the event marker before any frame data.
            if let Some(marker) = this.marker.take() {
                let remaining = &marker[this.marker_offset..];
                if remaining.is_empty() {
                    this.marker_offset = 0;
                } else {
                    let n = remaining.len().min(buf.remaining());
                    buf.put_slice(&remaining[..n]);
                    this.marker_offset += n;
                    if this.marker_offset < marker.len() {
                        this.marker = Some(marker);
                    } else {
                        this.marker_offset = 0;
                    }
                    return Poll::Ready(Ok(()));
                }
            }

            // Bytes clones share the payload, so this does not copy.
            let data = this.frame.as_ref().expect("current frame present").data.clone();
            let remaining = &data[this.frame_offset..];
            if !remaining.is_empty() {
                let n = remaining.len().min(buf.remaining());
                buf.put_slice(&remaining[..n]);
                this.frame_offset += n;
                if this.frame_offset == data.len() {
                    this.frame = None;
                    this.frame_offset = 0;
                }
                return Poll::Ready(Ok(()));
            }

            // Event-only frame fully drained: move on to the next frame
            // instead of surfacing a zero-length read as EOF.
            this.frame = None;
            this.frame_offset = 0;
        }
    }
}
