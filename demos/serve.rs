//! Serve a directory tree as allocation sandboxes.
//!
//! Every immediate subdirectory of `--root` is registered as one
//! allocation, keyed by its directory name. Then try:
//!
//! ```text
//! cargo run --example serve -- --root /var/lib/agent/allocs --port 4646
//! curl 'http://127.0.0.1:4646/v1/client/fs/ls/<alloc-id>'
//! curl 'http://127.0.0.1:4646/v1/client/fs/stream/<alloc-id>?path=task.log'
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use allocfs::http::{run_server, AllocRegistry, FsState};
use allocfs::sandbox::AllocDir;

#[derive(Parser, Debug)]
#[command(name = "serve")]
#[command(about = "Serve allocation directories over HTTP", long_about = None)]
struct Cli {
    /// Directory whose subdirectories become allocations
    #[arg(long)]
    root: PathBuf,

    /// Port to bind the HTTP server to
    #[arg(long, default_value_t = 4646)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let registry = Arc::new(AllocRegistry::new());
    let mut entries = tokio::fs::read_dir(&cli.root).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.metadata().await?.is_dir() {
            continue;
        }
        let alloc_id = entry.file_name().to_string_lossy().into_owned();
        registry.register(alloc_id.clone(), AllocDir::new(entry.path()).await?);
        info!(alloc_id = %alloc_id, path = %entry.path().display(), "registered allocation");
    }

    let addr = format!("127.0.0.1:{}", cli.port);
    run_server(&addr, FsState::new(registry)).await?;
    Ok(())
}
