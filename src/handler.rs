//! Stream handler: request parameters and the server-side wiring.
//!
//! [`stream`] glues the pieces together for one request: sandbox
//! resolution, a [`FileFollower`] feeding a [`StreamFramer`] whose sink is
//! the response body, and coordinated teardown when either side stops
//! first.

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::follower::{FileFollower, Origin, DEFAULT_POLL_INTERVAL};
use crate::framer::{FramerConfig, StreamFramer};
use crate::sandbox::AllocDir;

/// Origin query value for offsets measured from the start of the file.
pub const ORIGIN_START: &str = "start";

/// Origin query value for offsets measured from the end of the file.
pub const ORIGIN_END: &str = "end";

/// Tuning for one stream request.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Framer thresholds (heartbeat, batch window, frame size).
    pub framer: FramerConfig,
    /// Stat-poll interval while the followed file sits at EOF.
    pub poll_interval: Duration,
}

impl StreamConfig {
    /// The defaults used by the HTTP surface.
    pub fn new() -> Self {
        Self {
            framer: FramerConfig::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Validated parameters of a stream request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    /// File path relative to the allocation root.
    pub path: String,
    /// Byte offset interpreted according to `origin`.
    pub offset: i64,
    /// Whether `offset` counts from the start or the end of the file.
    pub origin: Origin,
}

impl StreamParams {
    /// Parse and validate the `path`, `origin`, and `offset` query
    /// parameters for an endpoint that requires a file path.
    pub fn parse(alloc_id: &str, query: &HashMap<String, String>) -> Result<Self> {
        require_alloc_id(alloc_id)?;
        let path = require_path(query)?;

        let origin = match query.get("origin").map(String::as_str) {
            None | Some("") | Some(ORIGIN_START) => Origin::Start,
            Some(ORIGIN_END) => Origin::End,
            Some(other) => return Err(Error::InvalidOrigin(other.to_string())),
        };

        let offset = match query.get("offset").map(String::as_str) {
            None | Some("") => 0,
            Some(raw) => raw
                .parse::<i64>()
                .ok()
                .filter(|o| *o >= 0)
                .ok_or_else(|| Error::InvalidOffset(raw.to_string()))?,
        };

        Ok(Self {
            path,
            offset,
            origin,
        })
    }
}

/// Reject requests whose allocation id segment is empty.
pub fn require_alloc_id(alloc_id: &str) -> Result<()> {
    if alloc_id.is_empty() {
        return Err(Error::AllocIdNotPresent);
    }
    Ok(())
}

/// Extract the required `path` query parameter.
pub fn require_path(query: &HashMap<String, String>) -> Result<String> {
    match query.get("path").map(String::as_str) {
        Some(p) if !p.is_empty() => Ok(p.to_string()),
        _ => Err(Error::FileNameNotPresent),
    }
}

/// Stream a file out of `alloc` into `sink` until the follower terminates,
/// the sink fails, or `cancel` fires.
///
/// The framer is started first, then the follower; whichever side stops
/// first wins the race and the other is torn down. The framer is always
/// destroyed on the way out, which flushes any pending frame, including
/// the partial last read before an error return. The sink itself is left
/// to the caller to close.
pub async fn stream<W>(
    alloc: &AllocDir,
    params: &StreamParams,
    sink: W,
    config: &StreamConfig,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let framer = StreamFramer::new(Box::new(sink), config.framer.clone());
    framer.run();
    let exit = framer.exit_token();

    let mut follower = match FileFollower::open(
        alloc,
        &params.path,
        params.offset,
        params.origin,
        config.poll_interval,
        cancel.clone(),
    )
    .await
    {
        Ok(follower) => follower,
        Err(e) => {
            framer.destroy().await;
            return Err(e);
        }
    };

    let result = tokio::select! {
        res = follower.run(&framer) => res,
        // Sink failure (typically client disconnect): drop the follower and
        // treat the stream as finished.
        _ = exit.cancelled() => {
            debug!(path = %params.path, "framer exited before follower");
            Ok(())
        }
    };

    framer.destroy().await;
    result
}
