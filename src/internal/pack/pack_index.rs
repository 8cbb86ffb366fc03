//! Reader for version 2 pack index (`.idx`) files.
//!
//! Layout: magic `\377tOc`, version 2, 256-entry fanout table, sorted object names, CRC32 per
//! object, 4-byte offsets (msb set means an index into the 8-byte large offset table), then the
//! pack checksum and the idx checksum.

use bytes::Bytes;

use crate::{
    errors::GitError,
    hash::{ObjectHash, SHA1_SIZE},
};

const IDX_MAGIC: [u8; 4] = [0xFF, 0x74, 0x4F, 0x63];
const IDX_VERSION: u32 = 2;
const FANOUT_ENTRIES: usize = 256;
const HEADER_LEN: usize = 8 + FANOUT_ENTRIES * 4;
const LARGE_OFFSET_FLAG: u32 = 0x8000_0000;

#[derive(Debug, Clone)]
pub struct PackIndex {
    data: Bytes,
    count: usize,
}

impl PackIndex {
    pub fn parse(data: Bytes) -> Result<PackIndex, GitError> {
        if data.len() < HEADER_LEN + 2 * SHA1_SIZE {
            return Err(GitError::InvalidIdxFile("file too short".to_string()));
        }
        if data[..4] != IDX_MAGIC {
            return Err(GitError::InvalidIdxFile("bad magic".to_string()));
        }
        let version = be_u32(&data, 4);
        if version != IDX_VERSION {
            return Err(GitError::InvalidIdxFile(format!("unsupported version {version}")));
        }
        let count = be_u32(&data, 8 + (FANOUT_ENTRIES - 1) * 4) as usize;
        let min_len = HEADER_LEN + count * (SHA1_SIZE + 4 + 4) + 2 * SHA1_SIZE;
        if data.len() < min_len {
            return Err(GitError::InvalidIdxFile(format!(
                "{} objects need at least {min_len} bytes, found {}",
                count,
                data.len()
            )));
        }
        Ok(PackIndex { data, count })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Checksum of the pack this index describes.
    pub fn pack_checksum(&self) -> Option<ObjectHash> {
        let start = self.data.len() - 2 * SHA1_SIZE;
        ObjectHash::from_bytes(&self.data[start..start + SHA1_SIZE]).ok()
    }

    /// Offset of `id` within the pack, if the pack contains it.
    pub fn find(&self, id: &ObjectHash) -> Option<u64> {
        let first = id.first_byte() as usize;
        let lo = if first == 0 {
            0
        } else {
            self.fanout(first - 1)
        };
        let hi = self.fanout(first);
        let (mut lo, mut hi) = (lo, hi);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.name(mid).cmp(id.as_ref()) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return self.offset(mid),
            }
        }
        None
    }

    /// All `(id, offset)` pairs in id order.
    pub fn entries(&self) -> impl Iterator<Item = (ObjectHash, u64)> + '_ {
        (0..self.count).filter_map(|i| {
            let id = ObjectHash::from_bytes(self.name(i)).ok()?;
            Some((id, self.offset(i)?))
        })
    }

    fn fanout(&self, i: usize) -> usize {
        (be_u32(&self.data, 8 + i * 4) as usize).min(self.count)
    }

    fn name(&self, i: usize) -> &[u8] {
        let start = HEADER_LEN + i * SHA1_SIZE;
        &self.data[start..start + SHA1_SIZE]
    }

    fn offset(&self, i: usize) -> Option<u64> {
        let offsets_start = HEADER_LEN + self.count * (SHA1_SIZE + 4);
        let raw = be_u32(&self.data, offsets_start + i * 4);
        if raw & LARGE_OFFSET_FLAG == 0 {
            return Some(raw as u64);
        }
        let large_start = offsets_start + self.count * 4 + (raw & !LARGE_OFFSET_FLAG) as usize * 8;
        let bytes = self.data.get(large_start..large_start + 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Some(u64::from_be_bytes(buf))
    }
}

fn be_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// Build an idx v2 image; CRCs are written as zero since readers here never check them.
#[cfg(test)]
pub(crate) fn build_index(entries: &[(ObjectHash, u64)], pack_checksum: ObjectHash) -> Bytes {
    use sha1::{Digest, Sha1};

    let mut sorted = entries.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    let mut out = IDX_MAGIC.to_vec();
    out.extend_from_slice(&IDX_VERSION.to_be_bytes());
    for byte in 0..FANOUT_ENTRIES {
        let n = sorted.iter().filter(|(id, _)| (id.first_byte() as usize) <= byte).count();
        out.extend_from_slice(&(n as u32).to_be_bytes());
    }
    for (id, _) in &sorted {
        out.extend_from_slice(id.as_ref());
    }
    out.extend(std::iter::repeat_n(0u8, sorted.len() * 4));
    let mut large = Vec::new();
    for (_, offset) in &sorted {
        if *offset < LARGE_OFFSET_FLAG as u64 {
            out.extend_from_slice(&(*offset as u32).to_be_bytes());
        } else {
            out.extend_from_slice(&(LARGE_OFFSET_FLAG | (large.len() / 8) as u32).to_be_bytes());
            large.extend_from_slice(&offset.to_be_bytes());
        }
    }
    out.extend_from_slice(&large);
    out.extend_from_slice(pack_checksum.as_ref());
    let digest = Sha1::digest(&out);
    out.extend_from_slice(&digest);
    Bytes::from(out)
}
