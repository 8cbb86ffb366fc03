//! Git object identifiers. Every object is addressed by the SHA-1 of its loose header
//! (`"<type> <size>\0"`) followed by the payload; refs, wire lines and pack trailers all carry the
//! same 20-byte value, usually in its 40-character lowercase hex form.

use std::{fmt::Display, io, str::FromStr};

use sha1::{Digest, Sha1};

use crate::internal::object::types::ObjectType;

/// Byte length of a SHA-1 object id.
pub const SHA1_SIZE: usize = 20;
/// Hex length of a SHA-1 object id.
pub const SHA1_HEX_SIZE: usize = 40;

/// A SHA-1 object id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHash([u8; SHA1_SIZE]);

impl Display for ObjectHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for ObjectHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Parses the 40-character hex form. Upper case digits are accepted, output is always lower case.
impl FromStr for ObjectHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != SHA1_HEX_SIZE {
            return Err(format!("invalid hash length {} for `{s}`", s.len()));
        }
        let mut h = [0u8; SHA1_SIZE];
        hex::decode_to_slice(s, &mut h).map_err(|e| e.to_string())?;
        Ok(ObjectHash(h))
    }
}

impl ObjectHash {
    /// The all-zero id used on the wire for "no object" (ref creation, deletion, empty advertisement).
    pub const ZERO: ObjectHash = ObjectHash([0u8; SHA1_SIZE]);

    /// Hash arbitrary bytes.
    pub fn new(data: &[u8]) -> ObjectHash {
        let digest = Sha1::digest(data);
        let mut bytes = [0u8; SHA1_SIZE];
        bytes.copy_from_slice(digest.as_ref());
        ObjectHash(bytes)
    }

    /// Id of an object with the given type and payload, as git computes it.
    pub fn from_type_and_data(object_type: ObjectType, data: &[u8]) -> ObjectHash {
        let mut hasher = Sha1::new();
        hasher.update(object_type.loose_header(data.len()));
        hasher.update(data);
        let mut bytes = [0u8; SHA1_SIZE];
        bytes.copy_from_slice(hasher.finalize().as_ref());
        ObjectHash(bytes)
    }

    /// Build an id from its raw 20 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<ObjectHash, String> {
        if bytes.len() != SHA1_SIZE {
            return Err(format!(
                "invalid hash length: expected {SHA1_SIZE}, got {}",
                bytes.len()
            ));
        }
        let mut h = [0u8; SHA1_SIZE];
        h.copy_from_slice(bytes);
        Ok(ObjectHash(h))
    }

    /// Read a raw 20-byte id from a stream.
    pub fn from_stream(data: &mut impl io::Read) -> io::Result<ObjectHash> {
        let mut h = [0u8; SHA1_SIZE];
        data.read_exact(&mut h)?;
        Ok(ObjectHash(h))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; SHA1_SIZE]
    }

    /// Loose object path relative to `objects/`: `ab/cdef...`.
    pub fn loose_path(&self) -> String {
        let hex = self.to_string();
        format!("{}/{}", &hex[..2], &hex[2..])
    }

    /// First byte, used by the idx fanout table.
    pub fn first_byte(&self) -> u8 {
        self.0[0]
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::ObjectHash;
    use crate::internal::object::types::ObjectType;

    /// The empty blob id is a well known constant.
    #[test]
    fn test_empty_blob_id() {
        let id = ObjectHash::from_type_and_data(ObjectType::Blob, b"");
        assert_eq!(id.to_string(), "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391");
    }

    #[test]
    fn test_hello_blob_id() {
        let id = ObjectHash::from_type_and_data(ObjectType::Blob, b"hello\n");
        assert_eq!(id.to_string(), "ce013625030ba8dba906f756967f9e9ca394464a");
    }

    #[test]
    fn test_from_str_rejects_bad_input() {
        assert!(ObjectHash::from_str("abc").is_err());
        assert!(ObjectHash::from_str(&"g".repeat(40)).is_err());
        let upper = "CE013625030BA8DBA906F756967F9E9CA394464A";
        assert_eq!(
            ObjectHash::from_str(upper).unwrap().to_string(),
            upper.to_lowercase()
        );
    }

    #[test]
    fn test_zero_and_loose_path() {
        assert!(ObjectHash::ZERO.is_zero());
        assert_eq!(ObjectHash::ZERO.to_string(), "0".repeat(40));
        let id = ObjectHash::from_str("ce013625030ba8dba906f756967f9e9ca394464a").unwrap();
        assert_eq!(id.loose_path(), "ce/013625030ba8dba906f756967f9e9ca394464a");
        assert_eq!(id.first_byte(), 0xce);
    }
}
