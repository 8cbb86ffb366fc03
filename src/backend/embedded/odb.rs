//! Object database over a repository's `objects/` directory: zlib loose objects plus any number
//! of pack/idx v2 pairs under `objects/pack/`.

use std::{io::Read, sync::Arc};

use bytes::Bytes;
use flate2::read::ZlibDecoder;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::{
    errors::GitError,
    hash::ObjectHash,
    internal::{
        object::types::ObjectType,
        pack::{pack_index::PackIndex, packfile::PackFile},
        zlib::compress,
    },
    storage::Filesystem,
};

const OBJECTS_DIR: &str = "objects";
const PACK_DIR: &str = "objects/pack";

#[derive(Debug)]
pub struct ObjectDatabase {
    fs: Arc<dyn Filesystem>,
    packs: OnceCell<Vec<PackFile>>,
}

impl ObjectDatabase {
    pub fn new(fs: Arc<dyn Filesystem>) -> Self {
        Self {
            fs,
            packs: OnceCell::new(),
        }
    }

    fn loose_path(id: &ObjectHash) -> String {
        format!("{OBJECTS_DIR}/{}", id.loose_path())
    }

    /// Packs present when first needed. Objects received later are written loose, so the list
    /// never has to be refreshed during a session.
    async fn packs(&self) -> Result<&[PackFile], GitError> {
        let packs = self
            .packs
            .get_or_try_init(|| async {
                let mut packs = Vec::new();
                for entry in self.fs.read_dir(PACK_DIR).await? {
                    let Some(stem) = entry.name.strip_suffix(".idx") else {
                        continue;
                    };
                    let idx = self.fs.read(&format!("{PACK_DIR}/{}", entry.name)).await?;
                    let pack = self.fs.read(&format!("{PACK_DIR}/{stem}.pack")).await?;
                    let (Some(idx), Some(pack)) = (idx, pack) else {
                        warn!(pack = stem, "index without pack data, skipping");
                        continue;
                    };
                    let index = PackIndex::parse(idx)?;
                    packs.push(PackFile::new(stem.to_string(), pack, index)?);
                }
                debug!(count = packs.len(), "loaded packs");
                Ok::<_, GitError>(packs)
            })
            .await?;
        Ok(packs.as_slice())
    }

    pub async fn has_object(&self, id: &ObjectHash) -> Result<bool, GitError> {
        if self.fs.exists(&Self::loose_path(id)).await? {
            return Ok(true);
        }
        Ok(self.packs().await?.iter().any(|p| p.contains(id)))
    }

    /// Fully resolved object type and payload, `None` if the id is unknown.
    pub async fn read_object(
        &self,
        id: &ObjectHash,
    ) -> Result<Option<(ObjectType, Vec<u8>)>, GitError> {
        if let Some(raw) = self.fs.read(&Self::loose_path(id)).await? {
            return parse_loose(id, raw).map(Some);
        }

        let packs = self.packs().await?;
        for pack in packs {
            if !pack.contains(id) {
                continue;
            }
            // REF_DELTA bases outside this pack can only come from the other packs here
            let mut external = |base: &ObjectHash| {
                for other in packs {
                    if other.contains(base) {
                        return other.read_object(base, &mut |_: &ObjectHash| Ok(None));
                    }
                }
                Ok(None)
            };
            return pack.read_object(id, &mut external);
        }
        Ok(None)
    }

    /// Read an object that must exist.
    pub async fn expect_object(&self, id: &ObjectHash) -> Result<(ObjectType, Vec<u8>), GitError> {
        self.read_object(id)
            .await?
            .ok_or_else(|| GitError::ObjectNotFound(id.to_string()))
    }

    /// Store a loose object and return its id. Objects already present are left alone.
    pub async fn write_object(&self, obj_type: ObjectType, data: &[u8]) -> Result<ObjectHash, GitError> {
        let id = ObjectHash::from_type_and_data(obj_type, data);
        self.write_with_id(obj_type, data, &id).await?;
        Ok(id)
    }

    /// Store a loose object whose id the caller already computed.
    pub async fn write_with_id(
        &self,
        obj_type: ObjectType,
        data: &[u8],
        id: &ObjectHash,
    ) -> Result<(), GitError> {
        let path = Self::loose_path(id);
        if self.fs.exists(&path).await? {
            return Ok(());
        }
        let mut raw = obj_type.loose_header(data.len());
        raw.extend_from_slice(data);
        self.fs.write(&path, &compress(&raw)?).await
    }
}

fn parse_loose(id: &ObjectHash, raw: Bytes) -> Result<(ObjectType, Vec<u8>), GitError> {
    let mut inflated = Vec::new();
    ZlibDecoder::new(&raw[..])
        .read_to_end(&mut inflated)
        .map_err(|e| GitError::InvalidLooseObject(format!("{id}: {e}")))?;

    let nul = memchr::memchr(0, &inflated)
        .ok_or_else(|| GitError::InvalidLooseObject(format!("{id}: missing header")))?;
    let header = std::str::from_utf8(&inflated[..nul])
        .map_err(|_| GitError::InvalidLooseObject(format!("{id}: header is not UTF-8")))?;
    let (type_name, size) = header
        .split_once(' ')
        .ok_or_else(|| GitError::InvalidLooseObject(format!("{id}: malformed header")))?;
    let obj_type = ObjectType::from_string(type_name)?;
    let size: usize = size
        .parse()
        .map_err(|_| GitError::InvalidLooseObject(format!("{id}: bad size `{size}`")))?;

    let data = inflated.split_off(nul + 1);
    if data.len() != size {
        return Err(GitError::InvalidLooseObject(format!(
            "{id}: header says {size} bytes, found {}",
            data.len()
        )));
    }
    Ok((obj_type, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        internal::pack::{encode::PackEncoder, pack_index::build_index},
        storage::MemFs,
    };

    #[tokio::test]
    async fn test_loose_round_trip() {
        let fs: Arc<dyn Filesystem> = Arc::new(MemFs::new());
        let odb = ObjectDatabase::new(fs.clone());
        let id = odb.write_object(ObjectType::Blob, b"hello\n").await.unwrap();
        assert_eq!(id.to_string(), "ce013625030ba8dba906f756967f9e9ca394464a");
        assert!(fs.exists("objects/ce/013625030ba8dba906f756967f9e9ca394464a").await.unwrap());
        assert!(odb.has_object(&id).await.unwrap());
        assert_eq!(
            odb.read_object(&id).await.unwrap(),
            Some((ObjectType::Blob, b"hello\n".to_vec()))
        );
        assert!(odb.read_object(&ObjectHash::new(b"nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_loose_object() {
        let fs: Arc<dyn Filesystem> = Arc::new(MemFs::new());
        let id = ObjectHash::new(b"x");
        let raw = compress(b"blob 10\0short").unwrap();
        fs.write(&format!("objects/{}", id.loose_path()), &raw).await.unwrap();
        let odb = ObjectDatabase::new(fs);
        assert!(matches!(
            odb.read_object(&id).await,
            Err(GitError::InvalidLooseObject(_))
        ));
    }

    #[tokio::test]
    async fn test_reads_objects_from_packs() {
        let mut pack = Vec::new();
        let mut encoder = PackEncoder::new(1, &mut pack).await.unwrap();
        encoder.add(ObjectType::Blob, b"packed\n").await.unwrap();
        let checksum = encoder.finish().await.unwrap();
        let id = ObjectHash::from_type_and_data(ObjectType::Blob, b"packed\n");
        let idx = build_index(&[(id, 12)], checksum);

        let fs: Arc<dyn Filesystem> = Arc::new(MemFs::new());
        fs.write("objects/pack/pack-1.pack", &pack).await.unwrap();
        fs.write("objects/pack/pack-1.idx", &idx).await.unwrap();

        let odb = ObjectDatabase::new(fs);
        assert!(odb.has_object(&id).await.unwrap());
        assert_eq!(
            odb.expect_object(&id).await.unwrap(),
            (ObjectType::Blob, b"packed\n".to_vec())
        );
    }
}
