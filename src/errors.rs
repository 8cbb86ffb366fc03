//! Error types for the object store layer.
//!
//! `GitError` covers everything below the wire protocol: object parsing, pack and idx decoding,
//! delta reconstruction, storage I/O and reference updates. The protocol layer wraps it into
//! [`crate::protocol::ProtocolError::Backend`] when a session has to report it.

use thiserror::Error;

use crate::delta::errors::GitDeltaError;

#[derive(Error, Debug)]
pub enum GitError {
    /// Invalid or unsupported git object type name or pack type id.
    #[error("The `{0}` is not a valid git object type.")]
    InvalidObjectType(String),

    /// Malformed loose object header.
    #[error("Invalid loose object: {0}")]
    InvalidLooseObject(String),

    /// Malformed tree object.
    #[error("Not a valid git tree object: {0}")]
    InvalidTreeObject(String),

    /// Malformed commit object.
    #[error("Not a valid git commit object: {0}")]
    InvalidCommitObject(String),

    /// Malformed tag object.
    #[error("Not a valid git tag object: {0}")]
    InvalidTagObject(String),

    /// Malformed or unsupported index (.idx) file.
    #[error("The `{0}` is not a valid idx file.")]
    InvalidIdxFile(String),

    /// Malformed or unsupported pack file.
    #[error("The `{0}` is not a valid pack file.")]
    InvalidPackFile(String),

    /// Invalid pack header magic or version.
    #[error("The `{0}` is not a valid pack header.")]
    InvalidPackHeader(String),

    /// Invalid hex or raw object id.
    #[error("The {0} is not a valid Hash value")]
    InvalidHashValue(String),

    /// Object referenced by id is not in the store.
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// Reference name rejected by the ref store.
    #[error("Invalid reference name: {0}")]
    InvalidRefName(String),

    /// The current value of a ref did not match the expected old value.
    #[error("Reference {name} changed concurrently")]
    RefConflict { name: String },

    /// Path escaped the storage root or was otherwise unusable.
    #[error("Invalid storage path: {0}")]
    InvalidPath(String),

    /// Delta object reconstruction error.
    #[error("Delta Object Error Info:{0}")]
    DeltaObjectError(#[from] GitDeltaError),

    /// Pack encoding failure.
    #[error("Error while encoding pack: {0}")]
    PackEncodeError(String),

    /// I/O error from the underlying storage.
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),
}
