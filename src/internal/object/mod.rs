//! Object model definitions for the parts of Git trees, commits and tags that the transport
//! needs: link parsing for object enumeration and serialisation for repository seeding.
//! Blobs are opaque byte strings and have no type of their own.

pub mod commit;
pub mod tag;
pub mod tree;
pub mod types;

use crate::{errors::GitError, hash::ObjectHash, internal::object::types::ObjectType};

/// Common behaviour of typed objects.
pub trait ObjectTrait: Send + Sync {
    /// Parse the object payload (without the loose header).
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, GitError>
    where
        Self: Sized;

    fn get_type(&self) -> ObjectType;

    /// Serialise back to the payload that hashes to the object id.
    fn to_data(&self) -> Vec<u8>;
}
