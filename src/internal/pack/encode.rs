//! Pack generation for fetches.
//!
//! Entries are written undeltified, one at a time, straight into the output: header, zlib body,
//! and finally the SHA-1 trailer over everything that preceded it.

use sha1::{Digest, Sha1};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{
    errors::GitError,
    hash::ObjectHash,
    internal::{
        object::types::ObjectType,
        pack::{decode::PACK_SIGNATURE, entry::write_entry_header},
        zlib::compress,
    },
};

const PACK_VERSION: u32 = 2;

pub struct PackEncoder<'w, W: ?Sized> {
    object_number: usize,
    written: usize,
    inner_hash: Sha1,
    writer: &'w mut W,
}

impl<'w, W> PackEncoder<'w, W>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    /// Start a pack of `object_number` entries; the header is written immediately.
    pub async fn new(object_number: usize, writer: &'w mut W) -> Result<Self, GitError> {
        let count = u32::try_from(object_number)
            .map_err(|_| GitError::PackEncodeError(format!("too many objects: {object_number}")))?;
        let mut encoder = Self {
            object_number,
            written: 0,
            inner_hash: Sha1::new(),
            writer,
        };
        let mut header = PACK_SIGNATURE.to_vec();
        header.extend_from_slice(&PACK_VERSION.to_be_bytes());
        header.extend_from_slice(&count.to_be_bytes());
        encoder.write(&header).await?;
        Ok(encoder)
    }

    /// Append one base object.
    pub async fn add(&mut self, obj_type: ObjectType, data: &[u8]) -> Result<(), GitError> {
        if !obj_type.is_base() {
            return Err(GitError::PackEncodeError(format!(
                "cannot write {obj_type} as a base object"
            )));
        }
        if self.written == self.object_number {
            return Err(GitError::PackEncodeError(format!(
                "pack declared {} objects",
                self.object_number
            )));
        }
        let mut buf = Vec::with_capacity(data.len() / 2 + 16);
        write_entry_header(obj_type, data.len(), &mut buf);
        buf.extend_from_slice(&compress(data)?);
        self.write(&buf).await?;
        self.written += 1;
        Ok(())
    }

    /// Write the trailer and return the pack checksum.
    pub async fn finish(mut self) -> Result<ObjectHash, GitError> {
        if self.written != self.object_number {
            return Err(GitError::PackEncodeError(format!(
                "pack declared {} objects, {} written",
                self.object_number, self.written
            )));
        }
        let digest = self.inner_hash.clone().finalize();
        self.writer.write_all(&digest).await?;
        self.writer.flush().await?;
        ObjectHash::from_bytes(digest.as_ref()).map_err(GitError::InvalidHashValue)
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), GitError> {
        self.inner_hash.update(data);
        self.writer.write_all(data).await?;
        Ok(())
    }
}
