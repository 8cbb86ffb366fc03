//! Tree objects: a sorted list of `<mode> <name>\0<20-byte id>` entries.

use crate::errors::GitError;
use crate::hash::{ObjectHash, SHA1_SIZE};
use crate::internal::object::ObjectTrait;
use crate::internal::object::types::ObjectType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeItemMode {
    Blob,
    BlobExecutable,
    Link,
    Tree,
    /// Submodule pointer; the commit lives in another repository.
    Commit,
}

impl TreeItemMode {
    pub fn from_bytes(mode: &[u8]) -> Result<TreeItemMode, GitError> {
        Ok(match mode {
            b"100644" | b"100664" | b"100640" => TreeItemMode::Blob,
            b"100755" => TreeItemMode::BlobExecutable,
            b"120000" => TreeItemMode::Link,
            b"40000" | b"040000" => TreeItemMode::Tree,
            b"160000" => TreeItemMode::Commit,
            other => {
                return Err(GitError::InvalidTreeObject(format!(
                    "unknown mode `{}`",
                    String::from_utf8_lossy(other)
                )));
            }
        })
    }

    pub fn to_bytes(self) -> &'static [u8] {
        match self {
            TreeItemMode::Blob => b"100644",
            TreeItemMode::BlobExecutable => b"100755",
            TreeItemMode::Link => b"120000",
            TreeItemMode::Tree => b"40000",
            TreeItemMode::Commit => b"160000",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeItem {
    pub mode: TreeItemMode,
    pub id: ObjectHash,
    pub name: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    pub id: ObjectHash,
    pub tree_items: Vec<TreeItem>,
}

impl Tree {
    /// Build a tree, sorting items the way git does (directories compare as `name/`).
    pub fn from_tree_items(mut tree_items: Vec<TreeItem>) -> Tree {
        tree_items.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
        let mut tree = Tree {
            id: ObjectHash::ZERO,
            tree_items,
        };
        tree.id = ObjectHash::from_type_and_data(ObjectType::Tree, &tree.to_data());
        tree
    }
}

fn sort_key(item: &TreeItem) -> Vec<u8> {
    let mut key = item.name.clone();
    if item.mode == TreeItemMode::Tree {
        key.push(b'/');
    }
    key
}

impl ObjectTrait for Tree {
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, GitError> {
        let mut tree_items = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let space = memchr::memchr(b' ', rest)
                .ok_or_else(|| GitError::InvalidTreeObject(format!("{hash}: missing mode")))?;
            let mode = TreeItemMode::from_bytes(&rest[..space])?;
            rest = &rest[space + 1..];

            let nul = memchr::memchr(0, rest)
                .ok_or_else(|| GitError::InvalidTreeObject(format!("{hash}: missing name")))?;
            let name = rest[..nul].to_vec();
            rest = &rest[nul + 1..];

            if rest.len() < SHA1_SIZE {
                return Err(GitError::InvalidTreeObject(format!("{hash}: truncated entry")));
            }
            let id = ObjectHash::from_bytes(&rest[..SHA1_SIZE]).map_err(GitError::InvalidHashValue)?;
            rest = &rest[SHA1_SIZE..];

            tree_items.push(TreeItem { mode, id, name });
        }
        Ok(Tree {
            id: hash,
            tree_items,
        })
    }

    fn get_type(&self) -> ObjectType {
        ObjectType::Tree
    }

    fn to_data(&self) -> Vec<u8> {
        let mut data = Vec::new();
        for item in &self.tree_items {
            data.extend_from_slice(item.mode.to_bytes());
            data.push(b' ');
            data.extend_from_slice(&item.name);
            data.push(0);
            data.extend_from_slice(item.id.as_ref());
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::{Tree, TreeItem, TreeItemMode};
    use crate::hash::ObjectHash;
    use crate::internal::object::ObjectTrait;
    use crate::internal::object::types::ObjectType;

    #[test]
    fn test_empty_tree_id() {
        let tree = Tree::from_tree_items(vec![]);
        assert_eq!(tree.id.to_string(), "4b825dc642cb6eb9a060e54bf8d69288fbee4904");
    }

    #[test]
    fn test_tree_round_trip() {
        let blob = ObjectHash::from_type_and_data(ObjectType::Blob, b"hello\n");
        let tree = Tree::from_tree_items(vec![
            TreeItem {
                mode: TreeItemMode::Blob,
                id: blob,
                name: b"b.txt".to_vec(),
            },
            TreeItem {
                mode: TreeItemMode::Tree,
                id: Tree::from_tree_items(vec![]).id,
                name: b"a".to_vec(),
            },
        ]);
        assert_eq!(tree.tree_items[0].name, b"a");
        let parsed = Tree::from_bytes(&tree.to_data(), tree.id).unwrap();
        assert_eq!(parsed, tree);
    }

    #[test]
    fn test_truncated_tree_is_rejected() {
        let mut data = b"100644 a\0".to_vec();
        data.extend_from_slice(&[1, 2, 3]);
        assert!(Tree::from_bytes(&data, ObjectHash::ZERO).is_err());
    }
}
