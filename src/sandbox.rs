//! Allocation directory sandbox.
//!
//! Every user-supplied path is resolved against a canonicalized allocation
//! root; traversal and symlinks that would land outside the root are
//! rejected with a typed [`Forbidden`](crate::error::Error::Forbidden)
//! error. The one-shot helpers here (`list`, `stat`, `read_at`) back the
//! sibling filesystem endpoints next to the stream.

use std::fs::Metadata;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{Error, Result};

/// Information about one file inside an allocation directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AllocFileInfo {
    pub name: String,
    pub is_dir: bool,
    pub size: i64,
    pub file_mode: String,
    /// Modification time, seconds since the UNIX epoch.
    pub mod_time: u64,
}

impl AllocFileInfo {
    fn from_metadata(name: String, meta: &Metadata) -> Self {
        Self {
            name,
            is_dir: meta.is_dir(),
            size: meta.len() as i64,
            file_mode: file_mode(meta),
            mod_time: meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |d| d.as_secs()),
        }
    }
}

#[cfg(unix)]
fn file_mode(meta: &Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;
    format!("{:o}", meta.permissions().mode())
}

#[cfg(not(unix))]
fn file_mode(meta: &Metadata) -> String {
    if meta.permissions().readonly() {
        "readonly".to_string()
    } else {
        "readwrite".to_string()
    }
}

/// The sandbox root for one allocation.
///
/// The root is canonicalized eagerly so containment checks compare like
/// with like after symlink expansion.
#[derive(Debug, Clone)]
pub struct AllocDir {
    root: PathBuf,
}

impl AllocDir {
    /// Create a sandbox rooted at `root`. The directory must exist.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = tokio::fs::canonicalize(root.as_ref()).await?;
        Ok(Self { root })
    }

    /// The canonicalized allocation root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a user path to an absolute path guaranteed to lie under the
    /// allocation root.
    ///
    /// The check applies after symlink expansion, so a symlink pointing
    /// outside the root is rejected the same as a `..` traversal.
    pub async fn resolve(&self, user_path: &str) -> Result<PathBuf> {
        let trimmed = user_path.trim_start_matches('/');

        // Lexical containment first, so probing paths outside the root
        // cannot distinguish "missing" from "off limits".
        if escapes_lexically(trimmed) {
            return Err(Error::Forbidden(user_path.to_string()));
        }

        let joined = self.root.join(trimmed);
        let resolved = match tokio::fs::canonicalize(&joined).await {
            Ok(p) => p,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(user_path.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        if !resolved.starts_with(&self.root) {
            return Err(Error::Forbidden(user_path.to_string()));
        }
        Ok(resolved)
    }

    /// List the entries of a directory under the root.
    pub async fn list(&self, user_path: &str) -> Result<Vec<AllocFileInfo>> {
        let dir = self.resolve(user_path).await?;
        let mut entries = tokio::fs::read_dir(&dir).await?;

        let mut infos = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            let name = entry.file_name().to_string_lossy().into_owned();
            infos.push(AllocFileInfo::from_metadata(name, &meta));
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    /// Stat a single file under the root.
    pub async fn stat(&self, user_path: &str) -> Result<AllocFileInfo> {
        let path = self.resolve(user_path).await?;
        let meta = tokio::fs::metadata(&path).await?;
        let name = user_path.trim_start_matches('/').to_string();
        Ok(AllocFileInfo::from_metadata(name, &meta))
    }

    /// Open a file under the root for reading at `offset`.
    ///
    /// A `limit` greater than zero bounds the number of readable bytes;
    /// zero or negative means read to EOF.
    pub async fn read_at(
        &self,
        user_path: &str,
        offset: u64,
        limit: i64,
    ) -> Result<tokio::io::Take<File>> {
        let path = self.resolve(user_path).await?;
        let mut file = File::open(&path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let cap = if limit > 0 { limit as u64 } else { u64::MAX };
        Ok(file.take(cap))
    }
}

/// Whether a relative path walks above its starting directory.
fn escapes_lexically(path: &str) -> bool {
    let mut depth: i64 = 0;
    for component in Path::new(path).components() {
        match component {
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return true;
                }
            }
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            // A rooted or prefixed component cannot appear after the
            // leading slashes are trimmed, but treat it as an escape.
            Component::RootDir | Component::Prefix(_) => return true,
        }
    }
    false
}
