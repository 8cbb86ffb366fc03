//! Filesystem abstraction under the embedded backend.
//!
//! Two physical storage modes share one interface: [`disk::OsFs`] for an on-disk tree and
//! [`memory::MemFs`] for ephemeral repositories. Paths are `/`-separated and relative to the
//! handle's root; [`Filesystem::chroot`] derives an independent handle for a subdirectory, which
//! is how each repository gets its own view of the shared root.

pub mod disk;
pub mod memory;

use std::{fmt, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::GitError;

pub use disk::OsFs;
pub use memory::MemFs;

/// Process-wide storage mode, fixed at startup.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    #[default]
    Fs,
    Mem,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

#[async_trait]
pub trait Filesystem: Send + Sync + fmt::Debug {
    /// Whole file contents, `None` if the file does not exist.
    async fn read(&self, path: &str) -> Result<Option<Bytes>, GitError>;

    /// Replace a file, creating parent directories. Readers never observe a partial file.
    async fn write(&self, path: &str, data: &[u8]) -> Result<(), GitError>;

    /// Remove a file; removing a missing file is not an error.
    async fn remove(&self, path: &str) -> Result<(), GitError>;

    /// Entries of a directory, sorted by name; a missing directory is empty.
    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, GitError>;

    async fn exists(&self, path: &str) -> Result<bool, GitError>;

    async fn create_dir_all(&self, path: &str) -> Result<(), GitError>;

    /// Handle rooted at `path` below this one.
    fn chroot(&self, path: &str) -> Result<Arc<dyn Filesystem>, GitError>;

    /// Location on the host filesystem, when there is one.
    fn local_path(&self) -> Option<PathBuf>;
}

/// Normalise a relative path: drop empty and `.` components, reject anything that could escape
/// the root.
pub fn clean_path(path: &str) -> Result<String, GitError> {
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(GitError::InvalidPath(path.to_string())),
            p if p.contains('\\') || p.contains('\0') => {
                return Err(GitError::InvalidPath(path.to_string()));
            }
            p => parts.push(p),
        }
    }
    Ok(parts.join("/"))
}

/// Join two relative paths that are already clean.
pub(crate) fn join(base: &str, path: &str) -> String {
    match (base.is_empty(), path.is_empty()) {
        (true, _) => path.to_string(),
        (_, true) => base.to_string(),
        _ => format!("{base}/{path}"),
    }
}

/// Build the shared storage root for `mode`.
pub async fn open_root(mode: StorageMode, dir: PathBuf) -> Result<Arc<dyn Filesystem>, GitError> {
    match mode {
        StorageMode::Fs => {
            tokio::fs::create_dir_all(&dir).await?;
            Ok(Arc::new(OsFs::new(dir)))
        }
        StorageMode::Mem => Ok(Arc::new(MemFs::new())),
    }
}
