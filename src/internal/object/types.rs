//! Object type enumeration shared by the loose-object, pack and wire layers.

use std::fmt::{self, Display};

use crate::errors::GitError;

/// In Git, each object type is assigned a unique integer value, which is used to identify the
/// type of the object in pack entry headers.
///
/// * `Commit` (1), `Tree` (2), `Blob` (3), `Tag` (4): base objects.
/// * `OffsetDelta` (6): a delta whose base is addressed by a negative offset within the same pack.
/// * `HashDelta` (7): a delta whose base is addressed by object id.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum ObjectType {
    Commit = 1,
    Tree,
    Blob,
    Tag,
    OffsetDelta = 6,
    HashDelta,
}

const COMMIT_OBJECT_TYPE: &[u8] = b"commit";
const TREE_OBJECT_TYPE: &[u8] = b"tree";
const BLOB_OBJECT_TYPE: &[u8] = b"blob";
const TAG_OBJECT_TYPE: &[u8] = b"tag";

impl Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ObjectType::Blob => write!(f, "blob"),
            ObjectType::Tree => write!(f, "tree"),
            ObjectType::Commit => write!(f, "commit"),
            ObjectType::Tag => write!(f, "tag"),
            ObjectType::OffsetDelta => write!(f, "OffsetDelta"),
            ObjectType::HashDelta => write!(f, "HashDelta"),
        }
    }
}

impl ObjectType {
    /// Convert object type to the 3-bit pack header type id.
    pub fn to_pack_type_u8(&self) -> u8 {
        *self as u8
    }

    /// Decode the 3-bit pack header type id.
    pub fn from_pack_type_u8(number: u8) -> Result<ObjectType, GitError> {
        match number {
            1 => Ok(ObjectType::Commit),
            2 => Ok(ObjectType::Tree),
            3 => Ok(ObjectType::Blob),
            4 => Ok(ObjectType::Tag),
            6 => Ok(ObjectType::OffsetDelta),
            7 => Ok(ObjectType::HashDelta),
            _ => Err(GitError::InvalidObjectType(format!(
                "Invalid pack object type number: {number}"
            ))),
        }
    }

    /// Name used in loose object headers. Delta types have none.
    pub fn to_bytes(&self) -> Option<&'static [u8]> {
        match self {
            ObjectType::Commit => Some(COMMIT_OBJECT_TYPE),
            ObjectType::Tree => Some(TREE_OBJECT_TYPE),
            ObjectType::Blob => Some(BLOB_OBJECT_TYPE),
            ObjectType::Tag => Some(TAG_OBJECT_TYPE),
            ObjectType::OffsetDelta | ObjectType::HashDelta => None,
        }
    }

    /// Parses the type name of a loose object header or a tag's `type` line.
    pub fn from_string(s: &str) -> Result<ObjectType, GitError> {
        match s {
            "blob" => Ok(ObjectType::Blob),
            "tree" => Ok(ObjectType::Tree),
            "commit" => Ok(ObjectType::Commit),
            "tag" => Ok(ObjectType::Tag),
            _ => Err(GitError::InvalidObjectType(s.to_string())),
        }
    }

    pub fn is_base(&self) -> bool {
        self.to_bytes().is_some()
    }

    /// `"<type> <size>\0"`, the prefix hashed into every object id.
    pub fn loose_header(&self, size: usize) -> Vec<u8> {
        let mut header = Vec::with_capacity(16);
        header.extend_from_slice(self.to_bytes().unwrap_or_default());
        header.push(b' ');
        header.extend_from_slice(size.to_string().as_bytes());
        header.push(0);
        header
    }
}

#[cfg(test)]
mod tests {
    use super::ObjectType;

    #[test]
    fn test_pack_type_round_trip() {
        for t in [
            ObjectType::Commit,
            ObjectType::Tree,
            ObjectType::Blob,
            ObjectType::Tag,
            ObjectType::OffsetDelta,
            ObjectType::HashDelta,
        ] {
            assert_eq!(ObjectType::from_pack_type_u8(t.to_pack_type_u8()).unwrap(), t);
        }
        assert!(ObjectType::from_pack_type_u8(5).is_err());
        assert!(ObjectType::from_pack_type_u8(0).is_err());
    }

    #[test]
    fn test_loose_header() {
        assert_eq!(ObjectType::Blob.loose_header(6), b"blob 6\0");
        assert!(!ObjectType::OffsetDelta.is_base());
        assert_eq!(ObjectType::from_string("commit").unwrap(), ObjectType::Commit);
    }
}
