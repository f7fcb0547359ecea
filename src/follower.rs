//! File follower: tails one file under an allocation root.
//!
//! The follower reads from a starting offset, feeds every chunk into a
//! [`StreamFramer`], and reacts to the file changing underneath it: a
//! shrink or an inode swap is surfaced as a truncation event before the
//! stream resumes from offset zero, and disappearance of the path is
//! surfaced as a deletion event before the follower terminates. Ordinary
//! EOF is not an error; the follower polls until new bytes arrive or it is
//! cancelled.

use std::fs::Metadata;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;
use crate::framer::StreamFramer;
use crate::protocol::{DELETE_EVENT, TRUNCATE_EVENT};
use crate::sandbox::AllocDir;

/// Read buffer size for each pass over the file.
const READ_BUF_SIZE: usize = 32 * 1024;

/// Default interval between stat polls while the file is at EOF.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Where the starting offset is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Origin {
    /// Offset counts forward from the start of the file.
    #[default]
    Start,
    /// Offset counts backward from the end of the file.
    End,
}

/// Tails a single file, emitting data and event frames into a framer.
///
/// The follower owns its file handle and drops it on termination. It tracks
/// the file across truncations and replacements by re-resolving the user
/// path through the sandbox, so a symlink swapped in underneath a followed
/// file cannot escape the allocation root.
#[derive(Debug)]
pub struct FileFollower {
    alloc: AllocDir,
    /// User-supplied path, relative to the allocation root. Carried in the
    /// `file` field of every emitted frame.
    rel_path: String,
    path: PathBuf,
    file: File,
    /// Next read position in the current incarnation of the file.
    offset: u64,
    /// Size observed by the most recent stat; shrinking means truncation.
    last_size: u64,
    /// Inode identity of the open file (unix); changing means replacement.
    ino: u64,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl FileFollower {
    /// Resolve `path` inside `alloc`, open it read-only, and seek to the
    /// starting offset. With [`Origin::End`] the offset counts back from
    /// the current end of file, clamped to the start.
    pub async fn open(
        alloc: &AllocDir,
        path: &str,
        offset: i64,
        origin: Origin,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let resolved = alloc.resolve(path).await?;
        let mut file = File::open(&resolved).await?;
        let meta = file.metadata().await?;
        let size = meta.len();

        let start = match origin {
            Origin::Start => offset.max(0) as u64,
            Origin::End => {
                let back = offset.max(0) as u64;
                if back <= size {
                    size - back
                } else {
                    0
                }
            }
        };
        file.seek(SeekFrom::Start(start)).await?;

        Ok(Self {
            alloc: alloc.clone(),
            rel_path: path.to_string(),
            path: resolved,
            file,
            offset: start,
            last_size: size,
            ino: inode(&meta),
            poll_interval,
            cancel,
        })
    }

    /// Follow the file until it is deleted, the read fails, or the
    /// cancellation token fires. Deletion terminates with `Ok(())` after a
    /// flushed deletion event; cancellation terminates with `Ok(())` and no
    /// event.
    pub async fn run(&mut self, framer: &StreamFramer) -> Result<()> {
        let mut buf = vec![0u8; READ_BUF_SIZE];

        loop {
            if self.cancel.is_cancelled() {
                debug!(path = %self.rel_path, "follower cancelled");
                return Ok(());
            }

            let n = self.file.read(&mut buf).await?;
            if n > 0 {
                let pre_read = self.offset as i64;
                framer.send(&self.rel_path, "", &buf[..n], pre_read).await?;
                self.offset += n as u64;
                continue;
            }

            // EOF: stat by path to learn whether the file moved on.
            match tokio::fs::metadata(&self.path).await {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    framer
                        .send(&self.rel_path, DELETE_EVENT, &[], self.offset as i64)
                        .await?;
                    framer.flush().await?;
                    debug!(path = %self.rel_path, "followed file deleted");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
                Ok(meta) => {
                    if meta.len() < self.last_size || inode(&meta) != self.ino {
                        self.restart_after_truncate(framer).await?;
                        continue;
                    }
                    self.last_size = meta.len();
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = sleep(self.poll_interval) => {}
            }
        }
    }

    /// Emit a truncation event and reopen the path from offset zero.
    ///
    /// Covers both in-place truncation and rename/recreate: either way the
    /// stream restarts at the beginning of whatever now lives at the path.
    async fn restart_after_truncate(&mut self, framer: &StreamFramer) -> Result<()> {
        framer
            .send(&self.rel_path, TRUNCATE_EVENT, &[], 0)
            .await?;
        framer.flush().await?;
        debug!(path = %self.rel_path, "followed file truncated, reopening");

        // Re-resolve so a path swapped for a symlink cannot escape the root.
        let resolved = self.alloc.resolve(&self.rel_path).await?;
        let file = File::open(&resolved).await?;
        let meta = file.metadata().await?;

        self.path = resolved;
        self.file = file;
        self.offset = 0;
        self.last_size = meta.len();
        self.ino = inode(&meta);
        Ok(())
    }
}

#[cfg(unix)]
fn inode(meta: &Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

/// Without inode identity, replacement detection degrades to the size
/// check alone.
#[cfg(not(unix))]
fn inode(_meta: &Metadata) -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::FramerConfig;
    use crate::protocol::{FrameDecoder, StreamFrame};
    use std::io::Write as _;
    use tokio::io::{duplex, AsyncReadExt as _};

    fn fast_config() -> FramerConfig {
        FramerConfig {
            heartbeat_interval: Duration::from_millis(100),
            batch_window: Duration::from_millis(50),
            frame_size: 1024,
        }
    }

    async fn collect_until<R>(
        reader: &mut R,
        decoder: &mut FrameDecoder,
        frames: &mut Vec<StreamFrame>,
        mut done: impl FnMut(&[StreamFrame]) -> bool,
    ) where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; 4 * 1024];
        loop {
            if done(frames) {
                return;
            }
            let n = reader.read(&mut buf).await.expect("read failed");
            assert!(n > 0, "stream closed early; got {frames:?}");
            frames.extend(
                decoder
                    .push(&buf[..n])
                    .expect("decode failed")
                    .into_iter()
                    .filter(|f| !f.is_heartbeat()),
            );
        }
    }

    fn collected_data(frames: &[StreamFrame]) -> Vec<u8> {
        frames.iter().flat_map(|f| f.data.to_vec()).collect()
    }

    #[tokio::test]
    async fn test_follow_across_appends() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = AllocDir::new(dir.path()).await.unwrap();
        let file_path = dir.path().join("task.log");
        let mut file = std::fs::File::create(&file_path).unwrap();
        file.write_all(b"hel").unwrap();
        file.sync_all().unwrap();

        let (sink, mut far) = duplex(16 * 1024);
        let framer = StreamFramer::new(Box::new(sink), fast_config());
        framer.run();

        let cancel = CancellationToken::new();
        let mut follower = FileFollower::open(
            &alloc,
            "task.log",
            0,
            Origin::Start,
            Duration::from_millis(20),
            cancel.clone(),
        )
        .await
        .unwrap();

        let run = tokio::spawn(async move {
            let res = follower.run(&framer).await;
            framer.destroy().await;
            res
        });

        // Append after the follower has drained the first chunk.
        tokio::time::sleep(Duration::from_millis(150)).await;
        file.write_all(b"loworld").unwrap();
        file.sync_all().unwrap();

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        tokio::time::timeout(
            Duration::from_secs(2),
            collect_until(&mut far, &mut decoder, &mut frames, |fs| {
                collected_data(fs) == b"helloworld"
            }),
        )
        .await
        .expect("did not observe appended bytes");

        // Offsets are contiguous across the data frames.
        let mut expect = 0i64;
        for frame in &frames {
            assert_eq!(frame.offset, expect);
            expect += frame.data.len() as i64;
        }

        cancel.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_origin_end_seeks_back_from_eof() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = AllocDir::new(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("task.log"), b"0123456789").unwrap();

        let cancel = CancellationToken::new();
        let follower = FileFollower::open(
            &alloc,
            "task.log",
            4,
            Origin::End,
            Duration::from_millis(20),
            cancel,
        )
        .await
        .unwrap();
        assert_eq!(follower.offset, 6);
    }

    #[tokio::test]
    async fn test_origin_end_past_start_clamps_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = AllocDir::new(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("task.log"), b"abc").unwrap();

        let cancel = CancellationToken::new();
        let follower = FileFollower::open(
            &alloc,
            "task.log",
            64,
            Origin::End,
            Duration::from_millis(20),
            cancel,
        )
        .await
        .unwrap();
        assert_eq!(follower.offset, 0);
    }

    #[tokio::test]
    async fn test_missing_file_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = AllocDir::new(dir.path()).await.unwrap();

        let cancel = CancellationToken::new();
        let err = FileFollower::open(
            &alloc,
            "nope.log",
            0,
            Origin::Start,
            DEFAULT_POLL_INTERVAL,
            cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, crate::error::Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_emits_event_and_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = AllocDir::new(dir.path()).await.unwrap();
        let file_path = dir.path().join("task.log");
        std::fs::write(&file_path, b"hel").unwrap();

        let (sink, mut far) = duplex(16 * 1024);
        let framer = StreamFramer::new(Box::new(sink), fast_config());
        framer.run();

        let cancel = CancellationToken::new();
        let mut follower = FileFollower::open(
            &alloc,
            "task.log",
            0,
            Origin::Start,
            Duration::from_millis(20),
            cancel,
        )
        .await
        .unwrap();

        let run = tokio::spawn(async move {
            let res = follower.run(&framer).await;
            framer.destroy().await;
            res
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::remove_file(&file_path).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        tokio::time::timeout(
            Duration::from_secs(2),
            collect_until(&mut far, &mut decoder, &mut frames, |fs| {
                fs.iter().any(|f| f.event == DELETE_EVENT)
            }),
        )
        .await
        .expect("did not observe deletion event");

        let delete = frames.iter().find(|f| f.event == DELETE_EVENT).unwrap();
        assert_eq!(delete.offset, 3);
        assert!(delete.data.is_empty());

        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_truncate_emits_event_and_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = AllocDir::new(dir.path()).await.unwrap();
        let file_path = dir.path().join("task.log");
        let mut file = std::fs::File::create(&file_path).unwrap();
        file.write_all(b"hel").unwrap();
        file.sync_all().unwrap();

        let (sink, mut far) = duplex(16 * 1024);
        let framer = StreamFramer::new(Box::new(sink), fast_config());
        framer.run();

        let cancel = CancellationToken::new();
        let mut follower = FileFollower::open(
            &alloc,
            "task.log",
            0,
            Origin::Start,
            Duration::from_millis(20),
            cancel.clone(),
        )
        .await
        .unwrap();

        let run = tokio::spawn(async move {
            let res = follower.run(&framer).await;
            framer.destroy().await;
            res
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        file.set_len(0).unwrap();
        file.sync_all().unwrap();
        drop(file);

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&file_path)
            .unwrap();
        file.write_all(b"lo").unwrap();
        file.sync_all().unwrap();

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        tokio::time::timeout(
            Duration::from_secs(2),
            collect_until(&mut far, &mut decoder, &mut frames, |fs| {
                fs.iter().any(|f| f.event == TRUNCATE_EVENT)
            }),
        )
        .await
        .expect("did not observe truncation event");

        tokio::time::sleep(Duration::from_millis(100)).await;
        file.write_all(b"world").unwrap();
        file.sync_all().unwrap();

        tokio::time::timeout(
            Duration::from_secs(2),
            collect_until(&mut far, &mut decoder, &mut frames, |fs| {
                let after: Vec<u8> = fs
                    .iter()
                    .skip_while(|f| f.event != TRUNCATE_EVENT)
                    .skip(1)
                    .flat_map(|f| f.data.to_vec())
                    .collect();
                after == b"loworld"
            }),
        )
        .await
        .expect("did not observe post-truncation bytes");

        // The stream restarts at offset zero after the event.
        let first_after = frames
            .iter()
            .skip_while(|f| f.event != TRUNCATE_EVENT)
            .nth(1)
            .unwrap();
        assert_eq!(first_after.offset, 0);

        cancel.cancel();
        run.await.unwrap().unwrap();
    }
}
