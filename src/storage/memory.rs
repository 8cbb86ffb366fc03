use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};

use super::{DirEntry, Filesystem, clean_path, join};
use crate::errors::GitError;

/// In-memory storage. Chrooted handles share the same maps and only differ by prefix.
#[derive(Debug, Clone, Default)]
pub struct MemFs {
    files: Arc<DashMap<String, Bytes>>,
    dirs: Arc<DashSet<String>>,
    prefix: String,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(&self, path: &str) -> Result<String, GitError> {
        Ok(join(&self.prefix, &clean_path(path)?))
    }

    fn mark_parents(&self, key: &str) {
        let mut current = key;
        while let Some((parent, _)) = current.rsplit_once('/') {
            if !self.dirs.insert(parent.to_string()) {
                break;
            }
            current = parent;
        }
    }
}

#[async_trait]
impl Filesystem for MemFs {
    async fn read(&self, path: &str) -> Result<Option<Bytes>, GitError> {
        let key = self.key(path)?;
        Ok(self.files.get(&key).map(|v| v.value().clone()))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<(), GitError> {
        let key = self.key(path)?;
        if key.is_empty() || self.dirs.contains(&key) {
            return Err(GitError::InvalidPath(path.to_string()));
        }
        self.mark_parents(&key);
        self.files.insert(key, Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), GitError> {
        let key = self.key(path)?;
        self.files.remove(&key);
        Ok(())
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, GitError> {
        let key = self.key(path)?;
        let dir_prefix = if key.is_empty() {
            String::new()
        } else {
            format!("{key}/")
        };
        let mut found: BTreeMap<String, bool> = BTreeMap::new();
        for file in self.files.iter() {
            if let Some(rest) = file.key().strip_prefix(&dir_prefix) {
                match rest.split_once('/') {
                    Some((name, _)) => found.insert(name.to_string(), true),
                    None => found.insert(rest.to_string(), false),
                };
            }
        }
        for dir in self.dirs.iter() {
            if let Some(rest) = dir.key().strip_prefix(&dir_prefix) {
                let name = rest.split('/').next().unwrap_or(rest);
                if !name.is_empty() {
                    found.insert(name.to_string(), true);
                }
            }
        }
        Ok(found
            .into_iter()
            .map(|(name, is_dir)| DirEntry { name, is_dir })
            .collect())
    }

    async fn exists(&self, path: &str) -> Result<bool, GitError> {
        let key = self.key(path)?;
        Ok(key.is_empty() || self.files.contains_key(&key) || self.dirs.contains(&key))
    }

    async fn create_dir_all(&self, path: &str) -> Result<(), GitError> {
        let key = self.key(path)?;
        if key.is_empty() {
            return Ok(());
        }
        self.mark_parents(&key);
        self.dirs.insert(key);
        Ok(())
    }

    fn chroot(&self, path: &str) -> Result<Arc<dyn Filesystem>, GitError> {
        Ok(Arc::new(MemFs {
            files: self.files.clone(),
            dirs: self.dirs.clone(),
            prefix: self.key(path)?,
        }))
    }

    fn local_path(&self) -> Option<PathBuf> {
        None
    }
}
