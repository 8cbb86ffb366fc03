//! Decoded pack entries and the variable-length headers that precede every entry in a pack.

use std::io::{self, Read};

use crate::{
    delta::utils::read_bytes,
    errors::GitError,
    hash::ObjectHash,
    internal::object::types::ObjectType,
};

///
/// Git object data from pack file
///
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct Entry {
    pub obj_type: ObjectType,
    pub data: Vec<u8>,
    pub hash: ObjectHash,
}

impl Entry {
    pub fn new(obj_type: ObjectType, data: Vec<u8>) -> Self {
        let hash = ObjectHash::from_type_and_data(obj_type, &data);
        Self {
            obj_type,
            data,
            hash,
        }
    }
}

/// Read the type and inflated size of an entry.
///
/// First byte: msb continuation flag, three type bits, low four size bits; then 7-bit size groups.
pub fn read_entry_header(reader: &mut impl Read) -> Result<(ObjectType, usize), GitError> {
    let [first] = read_bytes(reader)?;
    let obj_type = ObjectType::from_pack_type_u8((first >> 4) & 0b111)?;
    let mut size = (first & 0x0f) as usize;
    let mut shift = 4;
    let mut byte = first;
    while byte & 0x80 != 0 {
        [byte] = read_bytes(reader)?;
        if shift >= usize::BITS - 7 {
            return Err(GitError::InvalidPackFile("entry size overflows".to_string()));
        }
        size |= ((byte & 0x7f) as usize) << shift;
        shift += 7;
    }
    Ok((obj_type, size))
}

/// Encode the entry header for `obj_type` and `size`.
pub fn write_entry_header(obj_type: ObjectType, size: usize, out: &mut Vec<u8>) {
    let mut byte = (obj_type.to_pack_type_u8() << 4) | (size & 0x0f) as u8;
    let mut rest = size >> 4;
    while rest != 0 {
        out.push(byte | 0x80);
        byte = (rest & 0x7f) as u8;
        rest >>= 7;
    }
    out.push(byte);
}

/// Read the negative base distance of an `OFS_DELTA` entry.
pub fn read_offset_encoding(reader: &mut impl Read) -> io::Result<u64> {
    let [mut byte] = read_bytes(reader)?;
    let mut value = (byte & 0x7f) as u64;
    while byte & 0x80 != 0 {
        [byte] = read_bytes(reader)?;
        value = value
            .checked_add(1)
            .and_then(|v| v.checked_mul(128))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "ofs-delta offset overflows"))?
            | (byte & 0x7f) as u64;
    }
    Ok(value)
}

/// Inverse of [`read_offset_encoding`]; only used to build fixtures.
pub fn write_offset_encoding(mut value: u64, out: &mut Vec<u8>) {
    let mut bytes = vec![(value & 0x7f) as u8];
    value >>= 7;
    while value != 0 {
        value -= 1;
        bytes.push(0x80 | (value & 0x7f) as u8);
        value >>= 7;
    }
    bytes.reverse();
    out.extend_from_slice(&bytes);
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn test_entry_header_round_trip() {
        for (t, size) in [
            (ObjectType::Blob, 0usize),
            (ObjectType::Commit, 15),
            (ObjectType::Tree, 16),
            (ObjectType::OffsetDelta, 1 << 20),
        ] {
            let mut buf = Vec::new();
            write_entry_header(t, size, &mut buf);
            let (parsed_type, parsed_size) = read_entry_header(&mut Cursor::new(buf)).unwrap();
            assert_eq!((parsed_type, parsed_size), (t, size));
        }
    }

    /// Single byte header: blob of 6 bytes is 0x36.
    #[test]
    fn test_entry_header_known_byte() {
        let mut buf = Vec::new();
        write_entry_header(ObjectType::Blob, 6, &mut buf);
        assert_eq!(buf, vec![0x36]);
    }

    #[test]
    fn test_offset_encoding() {
        for value in [0u64, 127, 128, 300, 16511, 16512, 1 << 30] {
            let mut buf = Vec::new();
            write_offset_encoding(value, &mut buf);
            assert_eq!(read_offset_encoding(&mut Cursor::new(buf)).unwrap(), value);
        }
        let mut buf = Vec::new();
        write_offset_encoding(128, &mut buf);
        assert_eq!(buf, vec![0x80, 0x00]);
    }
}
