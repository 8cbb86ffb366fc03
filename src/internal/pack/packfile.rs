//! Random access to an on-disk pack through its index.

use std::io::{Cursor, Read};

use bytes::Bytes;

use crate::{
    delta::delta_decode,
    errors::GitError,
    hash::ObjectHash,
    internal::{
        object::types::ObjectType,
        pack::{
            decode::Pack,
            entry::{read_entry_header, read_offset_encoding},
            pack_index::PackIndex,
        },
        zlib::stream::inflate::ReadBoxed,
    },
    utils::read_sha,
};

/// git refuses chains deeper than this by default as well
const MAX_DELTA_CHAIN: usize = 4096;

#[derive(Debug, Clone)]
pub struct PackFile {
    pub name: String,
    data: Bytes,
    index: PackIndex,
}

impl PackFile {
    pub fn new(name: String, data: Bytes, index: PackIndex) -> Result<PackFile, GitError> {
        let count = Pack::check_header(&mut Cursor::new(&data[..]))?;
        if count as usize != index.len() {
            return Err(GitError::InvalidPackFile(format!(
                "{name}: pack has {count} objects, idx lists {}",
                index.len()
            )));
        }
        Ok(PackFile { name, data, index })
    }

    pub fn contains(&self, id: &ObjectHash) -> bool {
        self.index.find(id).is_some()
    }

    pub fn ids(&self) -> impl Iterator<Item = ObjectHash> + '_ {
        self.index.entries().map(|(id, _)| id)
    }

    /// Read and fully resolve `id`. `external` resolves `REF_DELTA` bases stored elsewhere.
    pub fn read_object<F>(
        &self,
        id: &ObjectHash,
        external: &mut F,
    ) -> Result<Option<(ObjectType, Vec<u8>)>, GitError>
    where
        F: FnMut(&ObjectHash) -> Result<Option<(ObjectType, Vec<u8>)>, GitError>,
    {
        match self.index.find(id) {
            Some(offset) => self.read_at(offset, external, 0).map(Some),
            None => Ok(None),
        }
    }

    fn read_at<F>(
        &self,
        offset: u64,
        external: &mut F,
        depth: usize,
    ) -> Result<(ObjectType, Vec<u8>), GitError>
    where
        F: FnMut(&ObjectHash) -> Result<Option<(ObjectType, Vec<u8>)>, GitError>,
    {
        if depth > MAX_DELTA_CHAIN {
            return Err(GitError::InvalidPackFile(format!(
                "{}: delta chain too deep at {offset}",
                self.name
            )));
        }
        let start = usize::try_from(offset)
            .ok()
            .filter(|s| *s < self.data.len())
            .ok_or_else(|| GitError::InvalidPackFile(format!("{}: offset {offset} out of range", self.name)))?;
        let mut cursor = Cursor::new(&self.data[start..]);
        let (obj_type, size) = read_entry_header(&mut cursor)?;

        let (base_type, base_data) = match obj_type {
            ObjectType::OffsetDelta => {
                let distance = read_offset_encoding(&mut cursor)?;
                let base_offset = offset.checked_sub(distance).ok_or_else(|| {
                    GitError::InvalidPackFile(format!("{}: ofs-delta before pack start", self.name))
                })?;
                self.read_at(base_offset, external, depth + 1)?
            }
            ObjectType::HashDelta => {
                let base = read_sha(&mut cursor)?;
                match self.index.find(&base) {
                    Some(base_offset) => self.read_at(base_offset, external, depth + 1)?,
                    None => external(&base)?
                        .ok_or_else(|| GitError::ObjectNotFound(base.to_string()))?,
                }
            }
            _ => {
                let data = inflate(ReadBoxed::new_for_delta(&mut cursor), size)?;
                return Ok((obj_type, data));
            }
        };

        let delta = inflate(ReadBoxed::new_for_delta(&mut cursor), size)?;
        let data = delta_decode(&mut Cursor::new(delta), &base_data)?;
        Ok((base_type, data))
    }
}

fn inflate<R: std::io::BufRead>(mut reader: ReadBoxed<R>, size: usize) -> Result<Vec<u8>, GitError> {
    let mut data = Vec::with_capacity(size);
    reader.read_to_end(&mut data)?;
    if data.len() != size {
        return Err(GitError::InvalidPackFile(format!(
            "entry inflated to {} bytes, header declared {size}",
            data.len()
        )));
    }
    Ok(data)
}
