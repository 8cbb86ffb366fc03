//! Reference storage: loose files under `refs/`, the `packed-refs` file and the `HEAD` symref.

use std::{collections::BTreeMap, sync::Arc};

use tracing::debug;

use crate::{errors::GitError, hash::ObjectHash, storage::Filesystem};

const PACKED_REFS: &str = "packed-refs";
const SYMREF_PREFIX: &str = "ref: ";

/// Value of `HEAD`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Head {
    Symbolic(String),
    Detached(ObjectHash),
}

#[derive(Debug, Clone)]
pub struct RefStore {
    fs: Arc<dyn Filesystem>,
}

impl RefStore {
    pub fn new(fs: Arc<dyn Filesystem>) -> Self {
        Self { fs }
    }

    pub async fn head(&self) -> Result<Option<Head>, GitError> {
        let Some(data) = self.fs.read("HEAD").await? else {
            return Ok(None);
        };
        let text = String::from_utf8_lossy(&data);
        let text = text.trim_end();
        match text.strip_prefix(SYMREF_PREFIX) {
            Some(target) => Ok(Some(Head::Symbolic(target.to_string()))),
            None => Ok(Some(Head::Detached(parse_id(text)?))),
        }
    }

    pub async fn set_head_symbolic(&self, target: &str) -> Result<(), GitError> {
        check_ref_name(target)?;
        self.fs
            .write("HEAD", format!("{SYMREF_PREFIX}{target}\n").as_bytes())
            .await
    }

    /// Object `HEAD` points at, `None` when its branch is unborn.
    pub async fn resolve_head(&self) -> Result<Option<ObjectHash>, GitError> {
        match self.head().await? {
            None => Ok(None),
            Some(Head::Detached(id)) => Ok(Some(id)),
            Some(Head::Symbolic(target)) => self.resolve(&target).await,
        }
    }

    pub async fn resolve(&self, name: &str) -> Result<Option<ObjectHash>, GitError> {
        if let Some(data) = self.fs.read(name).await? {
            return parse_id(String::from_utf8_lossy(&data).trim_end()).map(Some);
        }
        Ok(self.packed().await?.remove(name))
    }

    /// Every ref under `refs/`, loose values shadowing packed ones, sorted bytewise by name.
    pub async fn list(&self) -> Result<BTreeMap<String, ObjectHash>, GitError> {
        let mut refs = self.packed().await?;
        let mut pending = vec!["refs".to_string()];
        while let Some(dir) = pending.pop() {
            for entry in self.fs.read_dir(&dir).await? {
                let path = format!("{dir}/{}", entry.name);
                if entry.is_dir {
                    pending.push(path);
                    continue;
                }
                if entry.name.ends_with(".lock") {
                    continue;
                }
                if let Some(data) = self.fs.read(&path).await? {
                    match parse_id(String::from_utf8_lossy(&data).trim_end()) {
                        Ok(id) => {
                            refs.insert(path, id);
                        }
                        Err(_) => debug!(reference = %path, "skipping unreadable loose ref"),
                    }
                }
            }
        }
        Ok(refs)
    }

    async fn packed(&self) -> Result<BTreeMap<String, ObjectHash>, GitError> {
        let mut refs = BTreeMap::new();
        let Some(data) = self.fs.read(PACKED_REFS).await? else {
            return Ok(refs);
        };
        for line in String::from_utf8_lossy(&data).lines() {
            if line.starts_with('#') || line.starts_with('^') || line.is_empty() {
                continue;
            }
            let (id, name) = line
                .split_once(' ')
                .ok_or_else(|| GitError::InvalidRefName(format!("packed-refs line `{line}`")))?;
            refs.insert(name.to_string(), parse_id(id)?);
        }
        Ok(refs)
    }

    /// Move `name` from `old` to `new`; a zero `old` requires the ref to be absent and a zero `new`
    /// deletes it. Callers serialise updates to one repository.
    pub async fn update(
        &self,
        name: &str,
        old: &ObjectHash,
        new: &ObjectHash,
    ) -> Result<(), GitError> {
        check_ref_name(name)?;
        let current = self.resolve(name).await?;
        let matches = match current {
            None => old.is_zero(),
            Some(id) => id == *old,
        };
        if !matches {
            return Err(GitError::RefConflict {
                name: name.to_string(),
            });
        }

        if new.is_zero() {
            self.fs.remove(name).await?;
            self.remove_packed(name).await?;
        } else {
            self.fs.write(name, format!("{new}\n").as_bytes()).await?;
        }
        debug!(reference = name, old = %old, new = %new, "updated ref");
        Ok(())
    }

    async fn remove_packed(&self, name: &str) -> Result<(), GitError> {
        let Some(data) = self.fs.read(PACKED_REFS).await? else {
            return Ok(());
        };
        let text = String::from_utf8_lossy(&data);
        let mut kept = String::with_capacity(text.len());
        let mut dropping = false;
        let mut changed = false;
        for line in text.lines() {
            // peeled lines belong to the ref above them
            if line.starts_with('^') && dropping {
                continue;
            }
            dropping = line.split_once(' ').is_some_and(|(_, n)| n == name);
            if dropping {
                changed = true;
                continue;
            }
            kept.push_str(line);
            kept.push('\n');
        }
        if changed {
            self.fs.write(PACKED_REFS, kept.as_bytes()).await?;
        }
        Ok(())
    }
}

fn parse_id(text: &str) -> Result<ObjectHash, GitError> {
    text.parse().map_err(GitError::InvalidHashValue)
}

/// The subset of `git check-ref-format` that matters for pushes.
pub fn check_ref_name(name: &str) -> Result<(), GitError> {
    let invalid = || GitError::InvalidRefName(name.to_string());
    let rest = name.strip_prefix("refs/").ok_or_else(invalid)?;
    if rest.is_empty() || name.ends_with('/') || name.ends_with('.') || name.contains("..") {
        return Err(invalid());
    }
    if name.contains("@{") || name.contains("//") {
        return Err(invalid());
    }
    for c in name.chars() {
        if c.is_ascii_control() || matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\') {
            return Err(invalid());
        }
    }
    for component in rest.split('/') {
        if component.starts_with('.') || component.ends_with(".lock") {
            return Err(invalid());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemFs;

    fn id(n: u8) -> ObjectHash {
        ObjectHash::new(&[n])
    }

    #[test]
    fn test_check_ref_name() {
        assert!(check_ref_name("refs/heads/main").is_ok());
        assert!(check_ref_name("refs/tags/v1.0").is_ok());
        for bad in [
            "HEAD",
            "refs/",
            "refs/heads/../x",
            "refs/heads/a b",
            "refs/heads/x.lock",
            "refs/heads/.hidden",
            "refs/heads/a^",
            "refs/heads/",
        ] {
            assert!(check_ref_name(bad).is_err(), "{bad}");
        }
    }

    #[tokio::test]
    async fn test_loose_shadows_packed() {
        let fs: Arc<dyn Filesystem> = Arc::new(MemFs::new());
        let packed = format!(
            "# pack-refs with: peeled fully-peeled sorted\n{} refs/heads/main\n{} refs/tags/v1\n^{}\n",
            id(1),
            id(2),
            id(3)
        );
        fs.write("packed-refs", packed.as_bytes()).await.unwrap();
        fs.write("refs/heads/main", format!("{}\n", id(4)).as_bytes())
            .await
            .unwrap();
        fs.write("refs/heads/dev", format!("{}\n", id(5)).as_bytes())
            .await
            .unwrap();

        let store = RefStore::new(fs);
        let refs = store.list().await.unwrap();
        let names: Vec<_> = refs.keys().cloned().collect();
        assert_eq!(names, vec!["refs/heads/dev", "refs/heads/main", "refs/tags/v1"]);
        assert_eq!(refs["refs/heads/main"], id(4));
        assert_eq!(refs["refs/tags/v1"], id(2));
    }

    #[tokio::test]
    async fn test_update_compare_and_swap() {
        let fs: Arc<dyn Filesystem> = Arc::new(MemFs::new());
        let store = RefStore::new(fs);
        store.set_head_symbolic("refs/heads/main").await.unwrap();
        assert_eq!(store.resolve_head().await.unwrap(), None);

        store
            .update("refs/heads/main", &ObjectHash::ZERO, &id(1))
            .await
            .unwrap();
        assert_eq!(store.resolve_head().await.unwrap(), Some(id(1)));

        let err = store
            .update("refs/heads/main", &ObjectHash::ZERO, &id(2))
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::RefConflict { .. }));

        store.update("refs/heads/main", &id(1), &id(2)).await.unwrap();
        store
            .update("refs/heads/main", &id(2), &ObjectHash::ZERO)
            .await
            .unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_packed_ref() {
        let fs: Arc<dyn Filesystem> = Arc::new(MemFs::new());
        let packed = format!("{} refs/tags/v1\n^{}\n{} refs/tags/v2\n", id(1), id(2), id(3));
        fs.write("packed-refs", packed.as_bytes()).await.unwrap();
        let store = RefStore::new(fs.clone());
        store
            .update("refs/tags/v1", &id(1), &ObjectHash::ZERO)
            .await
            .unwrap();
        let rest = fs.read("packed-refs").await.unwrap().unwrap();
        assert_eq!(rest.as_ref(), format!("{} refs/tags/v2\n", id(3)).as_bytes());
    }
}
