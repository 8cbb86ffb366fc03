//! Pack stream decoding for pushes.
//!
//! The decoder reads exactly one pack from a [`BufRead`]: header, `count` entries and the SHA-1
//! trailer. It stops right after the trailer, so the caller's stream stays usable even when the
//! client never half-closes. Deltas are resolved once every entry is read; `REF_DELTA` bases that
//! are not in the pack are looked up through a caller supplied closure.

use std::collections::HashMap;
use std::io::{BufRead, Cursor, Read};

use tracing::debug;

use crate::{
    delta::{delta_decode, utils::read_size_encoding},
    errors::GitError,
    hash::ObjectHash,
    internal::{
        object::types::ObjectType,
        pack::entry::{Entry, read_entry_header, read_offset_encoding},
        zlib::stream::inflate::ReadBoxed,
    },
    utils::{CountingReader, read_bytes, read_sha},
};

pub const PACK_SIGNATURE: &[u8; 4] = b"PACK";

/// Preallocation caps; header fields are untrusted until the bytes actually arrive.
const PREALLOC_OBJECTS: usize = 4096;
const PREALLOC_BYTES: usize = 1 << 20;

/// Upper bounds applied while decoding a pack received from a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackLimits {
    /// Largest object count accepted in the pack header.
    pub max_objects: u32,
    /// Largest inflated size of any entry, delta payload or delta result.
    pub max_object_size: usize,
}

impl Default for PackLimits {
    fn default() -> Self {
        Self {
            max_objects: 1 << 24,
            max_object_size: 512 << 20,
        }
    }
}

impl PackLimits {
    fn check_size(&self, size: usize, what: &str) -> Result<(), GitError> {
        if size > self.max_object_size {
            return Err(GitError::InvalidPackFile(format!(
                "{what} of {size} bytes exceeds the limit of {} bytes",
                self.max_object_size
            )));
        }
        Ok(())
    }
}

/// Entry as it appears in the stream, before delta resolution.
enum RawEntry {
    Base(Entry),
    OffsetDelta { base_offset: u64, delta: Vec<u8> },
    HashDelta { base: ObjectHash, delta: Vec<u8> },
}

/// Representation of a decoded Git pack.
#[derive(Debug)]
pub struct Pack {
    pub number: usize,
    pub signature: ObjectHash,
    pub objects: Vec<Entry>,
}

impl Pack {
    /// Parse `PACK`, version 2 or 3 and the object count.
    pub fn check_header(reader: &mut impl Read) -> Result<u32, GitError> {
        let header = read_bytes(reader, 12)?;
        if &header[..4] != PACK_SIGNATURE {
            return Err(GitError::InvalidPackHeader(format!(
                "{:?}",
                String::from_utf8_lossy(&header[..4])
            )));
        }
        let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if version != 2 && version != 3 {
            return Err(GitError::InvalidPackHeader(format!("version {version}")));
        }
        Ok(u32::from_be_bytes([header[8], header[9], header[10], header[11]]))
    }

    /// Decode one complete pack under the default [`PackLimits`].
    pub fn decode<R, F>(reader: R, external: F) -> Result<Pack, GitError>
    where
        R: BufRead,
        F: FnMut(&ObjectHash) -> Result<Option<(ObjectType, Vec<u8>)>, GitError>,
    {
        Self::decode_with_limits(reader, PackLimits::default(), external)
    }

    /// Decode one complete pack, resolving every delta.
    ///
    /// `external` returns `(type, data)` for ids that a `REF_DELTA` entry uses as base but the pack
    /// itself does not carry. Counts and sizes over `limits` fail with
    /// [`GitError::InvalidPackFile`] before anything is allocated for them.
    pub fn decode_with_limits<R, F>(
        reader: R,
        limits: PackLimits,
        mut external: F,
    ) -> Result<Pack, GitError>
    where
        R: BufRead,
        F: FnMut(&ObjectHash) -> Result<Option<(ObjectType, Vec<u8>)>, GitError>,
    {
        let mut reader = CountingReader::new(reader);
        let count = Self::check_header(&mut reader)?;
        if count > limits.max_objects {
            return Err(GitError::InvalidPackFile(format!(
                "pack declares {count} objects, limit is {}",
                limits.max_objects
            )));
        }
        let number = count as usize;
        debug!(objects = number, "decoding pack");

        let mut raw = Vec::with_capacity(number.min(PREALLOC_OBJECTS));
        let mut offsets = HashMap::with_capacity(number.min(PREALLOC_OBJECTS));
        for index in 0..number {
            let offset = reader.bytes_read;
            offsets.insert(offset, index);
            raw.push(Self::read_raw_entry(&mut reader, &limits)?);
        }

        let computed = reader.current_hash();
        let signature = read_sha(&mut reader)?;
        if computed != signature {
            return Err(GitError::InvalidPackFile(format!(
                "checksum mismatch: trailer {signature}, computed {computed}"
            )));
        }

        let offsets_by_index: Vec<u64> = {
            let mut v = vec![0u64; number];
            for (offset, index) in &offsets {
                v[*index] = *offset;
            }
            v
        };

        let mut resolved: Vec<Option<Entry>> = vec![None; number];
        let mut by_hash: HashMap<ObjectHash, usize> = HashMap::new();
        for (index, entry) in raw.iter().enumerate() {
            if let RawEntry::Base(e) = entry {
                by_hash.insert(e.hash, index);
                resolved[index] = Some(e.clone());
            }
        }

        // Resolve in passes; each pass can unlock deltas whose base was itself a delta.
        loop {
            let mut progressed = false;
            let mut pending = 0;
            for index in 0..number {
                if resolved[index].is_some() {
                    continue;
                }
                let base = match &raw[index] {
                    RawEntry::Base(_) => continue,
                    RawEntry::OffsetDelta { base_offset, .. } => {
                        let target = offsets_by_index[index].checked_sub(*base_offset);
                        let base_index = target.and_then(|t| offsets.get(&t).copied()).ok_or_else(|| {
                            GitError::InvalidPackFile(format!(
                                "ofs-delta at {} points outside the pack",
                                offsets_by_index[index]
                            ))
                        })?;
                        resolved[base_index]
                            .as_ref()
                            .map(|b| (b.obj_type, b.data.clone()))
                    }
                    RawEntry::HashDelta { base, .. } => match by_hash.get(base) {
                        Some(base_index) => resolved[*base_index]
                            .as_ref()
                            .map(|b| (b.obj_type, b.data.clone())),
                        None => None,
                    },
                };
                let Some((base_type, base_data)) = base else {
                    pending += 1;
                    continue;
                };
                let delta = match &raw[index] {
                    RawEntry::OffsetDelta { delta, .. } | RawEntry::HashDelta { delta, .. } => delta,
                    RawEntry::Base(_) => continue,
                };
                let data = Self::apply_delta(delta, &base_data, &limits)?;
                let entry = Entry::new(base_type, data);
                by_hash.insert(entry.hash, index);
                resolved[index] = Some(entry);
                progressed = true;
            }
            if pending == 0 {
                break;
            }
            if !progressed {
                // remaining bases must come from the repository
                let mut unlocked = false;
                for index in 0..number {
                    if resolved[index].is_some() {
                        continue;
                    }
                    if let RawEntry::HashDelta { base, delta } = &raw[index] {
                        if let Some((base_type, base_data)) = external(base)? {
                            let data = Self::apply_delta(delta, &base_data, &limits)?;
                            let entry = Entry::new(base_type, data);
                            by_hash.insert(entry.hash, index);
                            resolved[index] = Some(entry);
                            unlocked = true;
                        }
                    }
                }
                if !unlocked {
                    return Err(GitError::InvalidPackFile(format!(
                        "{pending} delta entries reference missing bases"
                    )));
                }
            }
        }

        let objects = resolved.into_iter().flatten().collect();
        Ok(Pack {
            number,
            signature,
            objects,
        })
    }

    fn read_raw_entry<R: BufRead>(
        reader: &mut CountingReader<R>,
        limits: &PackLimits,
    ) -> Result<RawEntry, GitError> {
        let (obj_type, size) = read_entry_header(reader)?;
        limits.check_size(size, "entry")?;
        match obj_type {
            ObjectType::OffsetDelta => {
                let base_offset = read_offset_encoding(reader)?;
                let delta = Self::inflate(ReadBoxed::new_for_delta(&mut *reader), size)?.0;
                Ok(RawEntry::OffsetDelta { base_offset, delta })
            }
            ObjectType::HashDelta => {
                let base = read_sha(reader)?;
                let delta = Self::inflate(ReadBoxed::new_for_delta(&mut *reader), size)?.0;
                Ok(RawEntry::HashDelta { base, delta })
            }
            _ => {
                let (data, hash) = Self::inflate(ReadBoxed::new(&mut *reader, obj_type, size), size)?;
                Ok(RawEntry::Base(Entry {
                    obj_type,
                    data,
                    hash: hash.unwrap_or_else(|| ObjectHash::ZERO),
                }))
            }
        }
    }

    fn inflate<R: BufRead>(
        mut reader: ReadBoxed<R>,
        size: usize,
    ) -> Result<(Vec<u8>, Option<ObjectHash>), GitError> {
        let mut data = Vec::with_capacity(size.min(PREALLOC_BYTES));
        (&mut reader).take(size as u64 + 1).read_to_end(&mut data)?;
        if data.len() != size {
            return Err(GitError::InvalidPackFile(format!(
                "entry inflated to {} bytes, header declared {size}",
                data.len()
            )));
        }
        Ok((data, reader.object_hash()))
    }

    /// Rebuild a delta target after checking its declared size.
    fn apply_delta(delta: &[u8], base: &[u8], limits: &PackLimits) -> Result<Vec<u8>, GitError> {
        let mut header = Cursor::new(delta);
        let _base_size = read_size_encoding(&mut header)?;
        let result_size = read_size_encoding(&mut header)?;
        limits.check_size(result_size, "delta result")?;
        Ok(delta_decode(&mut Cursor::new(delta), base)?)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufReader, Cursor, Read};

    use sha1::{Digest, Sha1};

    use super::{Pack, PackLimits};
    use crate::{
        delta::utils::write_size_encoding,
        hash::ObjectHash,
        internal::{
            object::types::ObjectType,
            pack::entry::{write_entry_header, write_offset_encoding},
            zlib::compress,
        },
    };

    fn finish(mut pack: Vec<u8>) -> Vec<u8> {
        let digest = Sha1::digest(&pack);
        pack.extend_from_slice(&digest);
        pack
    }

    fn header(count: u32) -> Vec<u8> {
        let mut pack = b"PACK".to_vec();
        pack.extend_from_slice(&2u32.to_be_bytes());
        pack.extend_from_slice(&count.to_be_bytes());
        pack
    }

    fn push_entry(pack: &mut Vec<u8>, t: ObjectType, data: &[u8]) {
        write_entry_header(t, data.len(), pack);
        pack.extend_from_slice(&compress(data).unwrap());
    }

    /// base "hello world", ofs-delta producing "hello rust"
    fn delta_to_hello_rust() -> Vec<u8> {
        let mut delta = Vec::new();
        write_size_encoding(11, &mut delta);
        write_size_encoding(10, &mut delta);
        delta.extend_from_slice(&[0b1001_0000, 6, 4]);
        delta.extend_from_slice(b"rust");
        delta
    }

    #[test]
    fn test_decode_base_and_offset_delta() {
        let mut pack = header(2);
        let base_offset = pack.len() as u64;
        push_entry(&mut pack, ObjectType::Blob, b"hello world");
        let delta_offset = pack.len() as u64;
        let delta = delta_to_hello_rust();
        write_entry_header(ObjectType::OffsetDelta, delta.len(), &mut pack);
        write_offset_encoding(delta_offset - base_offset, &mut pack);
        pack.extend_from_slice(&compress(&delta).unwrap());
        let mut pack = finish(pack);
        pack.extend_from_slice(b"trailing");

        let mut cursor = Cursor::new(pack);
        let decoded = Pack::decode(&mut cursor, |_| Ok(None)).unwrap();
        assert_eq!(decoded.number, 2);
        assert_eq!(decoded.objects[1].data, b"hello rust");
        assert_eq!(
            decoded.objects[1].hash,
            ObjectHash::from_type_and_data(ObjectType::Blob, b"hello rust")
        );
        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"trailing");
    }

    #[test]
    fn test_ref_delta_uses_external_base() {
        let base = ObjectHash::from_type_and_data(ObjectType::Blob, b"hello world");
        let mut pack = header(1);
        let delta = delta_to_hello_rust();
        write_entry_header(ObjectType::HashDelta, delta.len(), &mut pack);
        pack.extend_from_slice(base.as_ref());
        pack.extend_from_slice(&compress(&delta).unwrap());
        let pack = finish(pack);

        let decoded = Pack::decode(BufReader::new(Cursor::new(pack.clone())), |id| {
            Ok((*id == base).then(|| (ObjectType::Blob, b"hello world".to_vec())))
        })
        .unwrap();
        assert_eq!(decoded.objects[0].data, b"hello rust");

        let missing = Pack::decode(BufReader::new(Cursor::new(pack)), |_| Ok(None));
        assert!(missing.is_err());
    }

    #[test]
    fn test_bad_checksum_is_rejected() {
        let mut pack = header(1);
        push_entry(&mut pack, ObjectType::Blob, b"x");
        pack.extend_from_slice(&[0u8; 20]);
        assert!(Pack::decode(Cursor::new(pack), |_| Ok(None)).is_err());
    }

    #[test]
    fn test_bad_signature_is_rejected() {
        let pack = finish(b"KCAP\0\0\0\x02\0\0\0\0".to_vec());
        assert!(Pack::decode(Cursor::new(pack), |_| Ok(None)).is_err());
    }

    #[test]
    fn test_huge_object_count_is_rejected() {
        let pack = b"PACK\0\0\0\x02\xff\xff\xff\xff".to_vec();
        let err = Pack::decode(Cursor::new(pack), |_| Ok(None)).unwrap_err();
        assert!(err.to_string().contains("4294967295 objects"), "{err}");
    }

    #[test]
    fn test_huge_entry_size_is_rejected() {
        let mut pack = header(1);
        write_entry_header(ObjectType::Blob, 1 << 56, &mut pack);
        pack.extend_from_slice(&compress(b"x").unwrap());
        let pack = finish(pack);
        let err = Pack::decode(Cursor::new(pack), |_| Ok(None)).unwrap_err();
        assert!(err.to_string().contains("exceeds the limit"), "{err}");
    }

    #[test]
    fn test_entry_inflating_past_its_header_is_rejected() {
        let mut pack = header(1);
        write_entry_header(ObjectType::Blob, 4, &mut pack);
        pack.extend_from_slice(&compress(&[b'a'; 4096]).unwrap());
        let pack = finish(pack);
        assert!(Pack::decode(Cursor::new(pack), |_| Ok(None)).is_err());
    }

    #[test]
    fn test_delta_result_over_limit_is_rejected() {
        let limits = PackLimits {
            max_objects: 16,
            max_object_size: 10,
        };
        let mut pack = header(2);
        let base_offset = pack.len() as u64;
        push_entry(&mut pack, ObjectType::Blob, b"hello");
        let delta_offset = pack.len() as u64;
        let mut delta = Vec::new();
        write_size_encoding(5, &mut delta);
        write_size_encoding(1 << 40, &mut delta);
        delta.extend_from_slice(&[0b1001_0000, 5]);
        write_entry_header(ObjectType::OffsetDelta, delta.len(), &mut pack);
        write_offset_encoding(delta_offset - base_offset, &mut pack);
        pack.extend_from_slice(&compress(&delta).unwrap());
        let pack = finish(pack);

        let err = Pack::decode_with_limits(Cursor::new(pack), limits, |_| Ok(None)).unwrap_err();
        assert!(err.to_string().contains("delta result"), "{err}");
    }
}
