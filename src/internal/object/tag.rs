//! Annotated tags. Only the target is needed: advertisements list the peeled id of every
//! annotated tag and fetches must ship the tagged object.

use crate::errors::GitError;
use crate::hash::ObjectHash;
use crate::internal::object::ObjectTrait;
use crate::internal::object::commit::{HeaderLines, parse_hex_id};
use crate::internal::object::types::ObjectType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub id: ObjectHash,
    pub object_hash: ObjectHash,
    pub object_type: ObjectType,
    /// `tag`, `tagger` and message, kept verbatim.
    pub rest: Vec<u8>,
}

impl Tag {
    pub fn new(target: ObjectHash, target_type: ObjectType, name: &str, tagger: &str, message: &str) -> Tag {
        let rest = format!("tag {name}\ntagger {tagger}\n\n{message}\n").into_bytes();
        let mut tag = Tag {
            id: ObjectHash::ZERO,
            object_hash: target,
            object_type: target_type,
            rest,
        };
        tag.id = ObjectHash::from_type_and_data(ObjectType::Tag, &tag.to_data());
        tag
    }
}

impl ObjectTrait for Tag {
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, GitError> {
        let mut lines = HeaderLines::new(data);
        let object_hash = lines
            .next()
            .and_then(|l| l.strip_prefix(b"object "))
            .and_then(parse_hex_id)
            .ok_or_else(|| GitError::InvalidTagObject(format!("{hash}: missing object line")))?;
        let object_type = lines
            .next()
            .and_then(|l| l.strip_prefix(b"type "))
            .and_then(|t| std::str::from_utf8(t).ok())
            .ok_or_else(|| GitError::InvalidTagObject(format!("{hash}: missing type line")))
            .and_then(ObjectType::from_string)?;
        Ok(Tag {
            id: hash,
            object_hash,
            object_type,
            rest: data[lines.offset..].to_vec(),
        })
    }

    fn get_type(&self) -> ObjectType {
        ObjectType::Tag
    }

    fn to_data(&self) -> Vec<u8> {
        let mut data = format!("object {}\ntype {}\n", self.object_hash, self.object_type).into_bytes();
        data.extend_from_slice(&self.rest);
        data
    }
}

#[cfg(test)]
mod tests {
    use super::Tag;
    use crate::hash::ObjectHash;
    use crate::internal::object::ObjectTrait;
    use crate::internal::object::types::ObjectType;

    #[test]
    fn test_tag_round_trip() {
        let target = ObjectHash::from_type_and_data(ObjectType::Blob, b"x");
        let tag = Tag::new(target, ObjectType::Blob, "v1", "T <t@example.com> 0 +0000", "release");
        let parsed = Tag::from_bytes(&tag.to_data(), tag.id).unwrap();
        assert_eq!(parsed, tag);
        assert_eq!(parsed.object_type, ObjectType::Blob);
    }
}
