//! # allocfs
//!
//! Stream files out of sandboxed allocation directories as live, framed,
//! cancellable byte streams with inline event notifications.
//!
//! The server side follows a file across appends, truncations, and
//! deletion, batches the bytes into JSON frames with heartbeats, and fans
//! them down an HTTP response body. The client side reassembles the frame
//! stream into an ordinary byte stream with human-readable event markers
//! spliced in.
//!
//! ## Architecture
//!
//! - **Server**: [`handler::stream`] resolves the path through the
//!   [`sandbox::AllocDir`], then a [`follower::FileFollower`] feeds a
//!   [`framer::StreamFramer`] bound to the response body.
//! - **Wire**: back-to-back JSON [`protocol::StreamFrame`] values; a
//!   heartbeat is `{}`.
//! - **Client**: [`reader::spawn_frame_stream`] decodes frames onto a
//!   bounded channel and [`reader::FrameReader`] reads them back as bytes.
//!
//! ## Example
//!
//! ```ignore
//! use allocfs::http::{run_server, AllocRegistry, FsState};
//! use allocfs::sandbox::AllocDir;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Arc::new(AllocRegistry::new());
//!     registry.register("alloc1", AllocDir::new("/var/lib/agent/alloc1").await?);
//!     run_server("127.0.0.1:4646", FsState::new(registry)).await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod follower;
pub mod framer;
pub mod handler;
pub mod http;
pub mod protocol;
pub mod reader;
pub mod sandbox;

pub use error::{Error, Result};
pub use follower::{FileFollower, Origin};
pub use framer::{FramerConfig, StreamFramer};
pub use handler::{StreamConfig, StreamParams};
pub use protocol::{StreamFrame, DELETE_EVENT, TRUNCATE_EVENT};
pub use reader::FrameReader;
pub use sandbox::{AllocDir, AllocFileInfo};
