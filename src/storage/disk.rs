use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;

use super::{DirEntry, Filesystem, clean_path};
use crate::errors::GitError;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// On-disk storage rooted at a host directory.
#[derive(Debug, Clone)]
pub struct OsFs {
    root: PathBuf,
}

impl OsFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, GitError> {
        let clean = clean_path(path)?;
        Ok(if clean.is_empty() {
            self.root.clone()
        } else {
            self.root.join(clean)
        })
    }
}

#[async_trait]
impl Filesystem for OsFs {
    async fn read(&self, path: &str) -> Result<Option<Bytes>, GitError> {
        match tokio::fs::read(self.resolve(path)?).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            // a directory where a file was expected reads as absent
            Err(e) if e.kind() == ErrorKind::IsADirectory => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<(), GitError> {
        let target = self.resolve(path)?;
        let parent = target
            .parent()
            .ok_or_else(|| GitError::InvalidPath(path.to_string()))?;
        tokio::fs::create_dir_all(parent).await?;
        let tmp = temp_sibling(&target);
        tokio::fs::write(&tmp, data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), GitError> {
        match tokio::fs::remove_file(self.resolve(path)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, GitError> {
        let mut dir = match tokio::fs::read_dir(self.resolve(path)?).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.ends_with(".tmp") {
                continue;
            }
            let is_dir = entry.file_type().await?.is_dir();
            entries.push(DirEntry { name, is_dir });
        }
        entries.sort();
        Ok(entries)
    }

    async fn exists(&self, path: &str) -> Result<bool, GitError> {
        Ok(tokio::fs::try_exists(self.resolve(path)?).await?)
    }

    async fn create_dir_all(&self, path: &str) -> Result<(), GitError> {
        tokio::fs::create_dir_all(self.resolve(path)?).await?;
        Ok(())
    }

    fn chroot(&self, path: &str) -> Result<Arc<dyn Filesystem>, GitError> {
        Ok(Arc::new(OsFs::new(self.resolve(path)?)))
    }

    fn local_path(&self) -> Option<PathBuf> {
        Some(self.root.clone())
    }
}

fn temp_sibling(target: &Path) -> PathBuf {
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.{n}.tmp", std::process::id()));
    target.with_file_name(name)
}
