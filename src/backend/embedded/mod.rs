//! The embedded backend: a git-compatible repository read and written directly through a
//! [`Filesystem`] handle, without any external process.

pub mod odb;
pub mod refs;
pub mod walk;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::{runtime::Handle, sync::Mutex};
use tokio_util::io::SyncIoBridge;
use tracing::{debug, info, warn};

use self::{odb::ObjectDatabase, refs::RefStore};
use super::{BackendKind, DynWriter, PackReader, SessionBackend};
use crate::{
    errors::GitError,
    hash::ObjectHash,
    internal::pack::{
        decode::{Pack, PackLimits},
        encode::PackEncoder,
    },
    protocol::types::{
        AdvertisedRef, ProtocolError, RefCommand, RefStatus, ReportStatus, ServiceKind,
        UpdateRequest, UploadRequest,
    },
    storage::Filesystem,
};

const BARE_CONFIG: &str = "[core]\n\trepositoryformatversion = 0\n\tfilemode = true\n\tbare = true\n";

/// Lay out an empty bare repository. `HEAD` is written last, so a repository whose `HEAD` exists
/// is complete. Existing repositories are left untouched.
pub async fn init_repository(fs: &dyn Filesystem, default_branch: &str) -> Result<(), GitError> {
    if fs.exists("HEAD").await? {
        return Ok(());
    }
    let head_target = format!("refs/heads/{default_branch}");
    refs::check_ref_name(&head_target)?;

    for dir in ["objects/info", "objects/pack", "refs/heads", "refs/tags"] {
        fs.create_dir_all(dir).await?;
    }
    fs.write("config", BARE_CONFIG.as_bytes()).await?;
    fs.write("HEAD", format!("ref: {head_target}\n").as_bytes())
        .await
}

pub struct EmbeddedBackend {
    odb: Arc<ObjectDatabase>,
    refs: RefStore,
    /// Serialises ref updates to this repository across sessions.
    ref_lock: Arc<Mutex<()>>,
    limits: PackLimits,
}

impl EmbeddedBackend {
    pub fn new(fs: Arc<dyn Filesystem>, ref_lock: Arc<Mutex<()>>, limits: PackLimits) -> Self {
        Self {
            odb: Arc::new(ObjectDatabase::new(fs.clone())),
            refs: RefStore::new(fs),
            ref_lock,
            limits,
        }
    }

    pub fn odb(&self) -> &ObjectDatabase {
        &self.odb
    }

    pub fn refs(&self) -> &RefStore {
        &self.refs
    }

    /// Decode one pack from `pack` and store every object loose.
    async fn unpack(&self, pack: PackReader) -> Result<usize, GitError> {
        let odb = self.odb.clone();
        let runtime = Handle::current();
        let limits = self.limits;
        let decoded = tokio::task::spawn_blocking(move || {
            let reader = std::io::BufReader::new(SyncIoBridge::new_with_handle(pack, runtime.clone()));
            Pack::decode_with_limits(reader, limits, |id| runtime.block_on(odb.read_object(id)))
        })
        .await
        .map_err(|e| GitError::InvalidPackFile(format!("unpack task failed: {e}")))??;

        for entry in &decoded.objects {
            self.odb
                .write_with_id(entry.obj_type, &entry.data, &entry.hash)
                .await?;
        }
        Ok(decoded.objects.len())
    }

    async fn apply(&self, command: &RefCommand) -> Result<(), GitError> {
        if !command.new_id.is_zero() && !self.odb.has_object(&command.new_id).await? {
            return Err(GitError::ObjectNotFound(command.new_id.to_string()));
        }
        self.refs
            .update(&command.ref_name, &command.old_id, &command.new_id)
            .await
    }
}

/// Reason text for an `ng` line.
fn rejection_reason(err: &GitError) -> String {
    match err {
        GitError::RefConflict { .. } => "stale info".to_string(),
        GitError::InvalidRefName(_) => "funny refname".to_string(),
        GitError::ObjectNotFound(_) => "missing necessary objects".to_string(),
        other => other.to_string(),
    }
}

#[async_trait]
impl SessionBackend for EmbeddedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Embedded
    }

    async fn advertised_refs(
        &self,
        service: ServiceKind,
    ) -> Result<Vec<AdvertisedRef>, ProtocolError> {
        let upload = service == ServiceKind::UploadPack;
        let mut advertised = Vec::new();
        if upload {
            if let Some(head) = self.refs.resolve_head().await? {
                advertised.push(AdvertisedRef::new("HEAD", head));
            }
        }
        for (name, id) in self.refs.list().await? {
            let peeled = if upload {
                walk::peel(&self.odb, &id).await?
            } else {
                None
            };
            advertised.push(AdvertisedRef::new(name.clone(), id));
            if let Some(peeled) = peeled {
                advertised.push(AdvertisedRef::new(format!("{name}^{{}}"), peeled));
            }
        }
        debug!(service = %service, refs = advertised.len(), "listed refs");
        Ok(advertised)
    }

    async fn has_object(&self, id: &ObjectHash) -> Result<bool, ProtocolError> {
        Ok(self.odb.has_object(id).await?)
    }

    async fn upload_pack(
        &self,
        request: &UploadRequest,
        output: &mut DynWriter<'_>,
        _stderr: &mut DynWriter<'_>,
    ) -> Result<(), ProtocolError> {
        let objects = walk::objects_to_send(&self.odb, &request.wants, &request.commons).await?;
        let mut encoder = PackEncoder::new(objects.len(), output).await?;
        for (id, _) in &objects {
            let (obj_type, data) = self.odb.expect_object(id).await?;
            encoder.add(obj_type, &data).await?;
        }
        let checksum = encoder.finish().await?;
        info!(objects = objects.len(), checksum = %checksum, "sent pack");
        Ok(())
    }

    async fn receive_pack(
        &self,
        request: &UpdateRequest,
        pack: Option<PackReader>,
        _stderr: &mut DynWriter<'_>,
    ) -> Result<ReportStatus, ProtocolError> {
        if let Some(pack) = pack {
            match self.unpack(pack).await {
                Ok(count) => info!(objects = count, "stored pushed objects"),
                Err(e) => {
                    warn!(error = %e, "failed to unpack pushed pack");
                    return Ok(ReportStatus::unpack_failed(request, e.to_string()));
                }
            }
        }

        let _guard = self.ref_lock.lock().await;
        let mut commands = Vec::with_capacity(request.commands.len());
        for command in &request.commands {
            let status = match self.apply(command).await {
                Ok(()) => RefStatus::ok(&command.ref_name),
                Err(e) => {
                    warn!(reference = %command.ref_name, error = %e, "rejected ref update");
                    RefStatus::failed(&command.ref_name, rejection_reason(&e))
                }
            };
            commands.push(status);
        }
        Ok(ReportStatus {
            unpack: Ok(()),
            commands,
        })
    }
}
