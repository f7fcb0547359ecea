//! Tail a file through the whole pipeline, in process.
//!
//! A writer task appends lines to a temp file while the stream handler
//! follows it through a framer into an in-memory pipe; the client-side
//! frame reader reassembles the bytes onto stdout. Truncate or delete the
//! file from another terminal to see the inline event markers.

use std::io::Write as _;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use allocfs::follower::Origin;
use allocfs::handler::{self, StreamConfig, StreamParams};
use allocfs::reader::{spawn_frame_stream, FrameReader};
use allocfs::sandbox::AllocDir;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("task.log");
    std::fs::write(&path, b"")?;
    println!("following {}", path.display());

    // Writer: one line every half second.
    let writer_path = path.clone();
    std::thread::spawn(move || {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&writer_path)
            .expect("open for append");
        for i in 0.. {
            writeln!(file, "line {i}").expect("append");
            std::thread::sleep(Duration::from_millis(500));
        }
    });

    let alloc = AllocDir::new(dir.path()).await?;
    let params = StreamParams {
        path: "task.log".to_string(),
        offset: 0,
        origin: Origin::Start,
    };

    let (sink, far) = tokio::io::duplex(64 * 1024);
    let cancel = CancellationToken::new();
    let server = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            handler::stream(&alloc, &params, sink, &StreamConfig::new(), cancel).await
        })
    };

    let frames = spawn_frame_stream(far, cancel.clone());
    let mut reader = FrameReader::new(frames, cancel);

    let mut stdout = std::io::stdout();
    let mut buf = [0u8; 4 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stdout.write_all(&buf[..n])?;
        stdout.flush()?;
    }

    server.await??;
    Ok(())
}
