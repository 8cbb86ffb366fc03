//! The Commit object records a snapshot (its top level tree) and the commits it was built on.
//!
//! Object enumeration for fetches only follows links, so the parser keeps the tree and parent
//! ids and leaves the author, committer and message untouched in `rest`.

use std::str::FromStr;

use crate::errors::GitError;
use crate::hash::ObjectHash;
use crate::internal::object::ObjectTrait;
use crate::internal::object::types::ObjectType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub id: ObjectHash,
    pub tree_id: ObjectHash,
    pub parent_commit_ids: Vec<ObjectHash>,
    /// Everything after the parent lines: author, committer, extra headers and message.
    pub rest: Vec<u8>,
}

impl Commit {
    /// Build a commit with a fixed author line, mostly for fixtures and repository seeding.
    pub fn new(
        tree_id: ObjectHash,
        parent_commit_ids: Vec<ObjectHash>,
        signature: &str,
        message: &str,
    ) -> Commit {
        let rest = format!("author {signature}\ncommitter {signature}\n\n{message}\n").into_bytes();
        let mut commit = Commit {
            id: ObjectHash::ZERO,
            tree_id,
            parent_commit_ids,
            rest,
        };
        commit.id = ObjectHash::from_type_and_data(ObjectType::Commit, &commit.to_data());
        commit
    }
}

impl ObjectTrait for Commit {
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, GitError> {
        let mut lines = HeaderLines::new(data);

        let tree_line = lines
            .next()
            .ok_or_else(|| GitError::InvalidCommitObject(format!("{hash}: empty commit")))?;
        let tree_id = tree_line
            .strip_prefix(b"tree ")
            .and_then(parse_hex_id)
            .ok_or_else(|| GitError::InvalidCommitObject(format!("{hash}: missing tree line")))?;

        let mut parent_commit_ids = Vec::new();
        let mut rest_start = lines.offset;
        while let Some(line) = lines.next() {
            match line.strip_prefix(b"parent ") {
                Some(parent) => {
                    let parent = parse_hex_id(parent).ok_or_else(|| {
                        GitError::InvalidCommitObject(format!("{hash}: malformed parent line"))
                    })?;
                    parent_commit_ids.push(parent);
                    rest_start = lines.offset;
                }
                None => break,
            }
        }

        Ok(Commit {
            id: hash,
            tree_id,
            parent_commit_ids,
            rest: data[rest_start..].to_vec(),
        })
    }

    fn get_type(&self) -> ObjectType {
        ObjectType::Commit
    }

    fn to_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.rest.len() + 48 * (1 + self.parent_commit_ids.len()));
        data.extend_from_slice(format!("tree {}\n", self.tree_id).as_bytes());
        for parent in &self.parent_commit_ids {
            data.extend_from_slice(format!("parent {parent}\n").as_bytes());
        }
        data.extend_from_slice(&self.rest);
        data
    }
}

/// Iterates `\n`-terminated header lines, remembering where the next one starts.
pub(crate) struct HeaderLines<'a> {
    data: &'a [u8],
    pub(crate) offset: usize,
}

impl<'a> HeaderLines<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }
}

impl<'a> Iterator for HeaderLines<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = &self.data[self.offset..];
        let end = memchr::memchr(b'\n', remaining)?;
        // a blank line ends the header block
        if end == 0 {
            return None;
        }
        self.offset += end + 1;
        Some(&remaining[..end])
    }
}

pub(crate) fn parse_hex_id(bytes: &[u8]) -> Option<ObjectHash> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| ObjectHash::from_str(s).ok())
}
