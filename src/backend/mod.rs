//! Repository backends.
//!
//! A [`SessionBackend`] is what a transport session talks to once a repository has been resolved
//! and access granted. It deals in refs, object ids and raw pack bytes only; every pkt-line the
//! client sees is written by the session, which is why the [`embedded`] object store and the
//! [`subprocess`] strategy that drives `git` look identical on the wire.
//!
//! [`BackendSelector`] owns the process-wide storage root and hands out a backend per
//! [`RepoHandle`].

pub mod embedded;
pub mod subprocess;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{Mutex, OnceCell},
};
use tracing::info;

use crate::{
    config::GitConfig,
    hash::ObjectHash,
    protocol::types::{
        AdvertisedRef, ProtocolError, ReportStatus, ServiceKind, UpdateRequest, UploadRequest,
    },
    storage::{Filesystem, StorageMode, open_root},
};

pub use embedded::EmbeddedBackend;
pub use subprocess::SubprocessBackend;

/// Pack data handed to [`SessionBackend::receive_pack`].
pub type PackReader = Box<dyn AsyncRead + Unpin + Send>;

/// Output and side-channel streams handed to backends.
pub type DynWriter<'a> = dyn AsyncWrite + Unpin + Send + 'a;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    #[serde(alias = "go")]
    Embedded,
    #[serde(alias = "bin")]
    Subprocess,
}

/// A resolved repository. The backend kind is fixed here and never changes for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoHandle {
    pub domain: String,
    pub repo: String,
    /// Path below the storage root, `<domain>/<repo>`.
    pub storage_path: String,
    pub backend_kind: BackendKind,
}

impl RepoHandle {
    pub fn new(domain: &str, repo: &str, backend_kind: BackendKind) -> Self {
        Self {
            domain: domain.to_string(),
            repo: repo.to_string(),
            storage_path: format!("{domain}/{repo}"),
            backend_kind,
        }
    }
}

#[async_trait]
pub trait SessionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Refs to advertise for `service`, already in advertisement order.
    async fn advertised_refs(&self, service: ServiceKind)
    -> Result<Vec<AdvertisedRef>, ProtocolError>;

    async fn has_object(&self, id: &ObjectHash) -> Result<bool, ProtocolError>;

    /// Write the raw pack (starting at `PACK`) answering a finished negotiation.
    async fn upload_pack(
        &self,
        request: &UploadRequest,
        output: &mut DynWriter<'_>,
        stderr: &mut DynWriter<'_>,
    ) -> Result<(), ProtocolError>;

    /// Store the pushed pack (absent when every command is a delete) and apply the commands.
    ///
    /// An `Err` means the backend could not produce a report at all; a pack that fails to unpack
    /// is reported through [`ReportStatus::unpack`].
    async fn receive_pack(
        &self,
        request: &UpdateRequest,
        pack: Option<PackReader>,
        stderr: &mut DynWriter<'_>,
    ) -> Result<ReportStatus, ProtocolError>;
}

/// Produces backends for resolved repositories.
///
/// The storage root is created on first use and shared by every repository; each backend gets a
/// handle chrooted to its repository.
#[derive(Debug)]
pub struct BackendSelector {
    config: GitConfig,
    root: OnceCell<Arc<dyn Filesystem>>,
    /// One ref-update lock per repository, shared by every embedded session on it.
    ref_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl BackendSelector {
    pub fn new(config: GitConfig) -> Self {
        Self {
            config,
            root: OnceCell::new(),
            ref_locks: DashMap::new(),
        }
    }

    pub fn config(&self) -> &GitConfig {
        &self.config
    }

    pub fn kind(&self) -> BackendKind {
        self.config.backend
    }

    /// The shared storage root, built once.
    pub async fn root(&self) -> Result<Arc<dyn Filesystem>, ProtocolError> {
        let root = self
            .root
            .get_or_try_init(|| async {
                info!(
                    mode = ?self.config.storage,
                    root = %self.config.storage_root.display(),
                    "opening storage root"
                );
                open_root(self.config.storage, self.config.storage_root.clone()).await
            })
            .await?;
        Ok(root.clone())
    }

    pub async fn repository_fs(
        &self,
        handle: &RepoHandle,
    ) -> Result<Arc<dyn Filesystem>, ProtocolError> {
        Ok(self.root().await?.chroot(&handle.storage_path)?)
    }

    /// A repository exists once its `HEAD` does.
    pub async fn repository_exists(&self, domain: &str, repo: &str) -> Result<bool, ProtocolError> {
        let fs = self.root().await?.chroot(&format!("{domain}/{repo}"))?;
        Ok(fs.exists("HEAD").await?)
    }

    /// Create an empty bare repository whose `HEAD` points at the configured default branch.
    pub async fn init_repository(&self, domain: &str, repo: &str) -> Result<RepoHandle, ProtocolError> {
        let handle = RepoHandle::new(domain, repo, self.kind());
        let fs = self.repository_fs(&handle).await?;
        embedded::init_repository(fs.as_ref(), &self.config.default_branch).await?;
        info!(repo = %handle.storage_path, branch = %self.config.default_branch, "initialised repository");
        Ok(handle)
    }

    /// Open the backend selected for `handle`.
    pub async fn open(&self, handle: &RepoHandle) -> Result<Arc<dyn SessionBackend>, ProtocolError> {
        let fs = self.repository_fs(handle).await?;
        match handle.backend_kind {
            BackendKind::Embedded => {
                let lock = self
                    .ref_locks
                    .entry(handle.storage_path.clone())
                    .or_default()
                    .clone();
                Ok(Arc::new(EmbeddedBackend::new(
                    fs,
                    lock,
                    self.config.pack_limits(),
                )))
            }
            BackendKind::Subprocess => {
                if self.config.storage != StorageMode::Fs {
                    return Err(ProtocolError::UnsupportedService(format!(
                        "subprocess backend requires fs storage, configured {:?}",
                        self.config.storage
                    )));
                }
                let dir = fs.local_path().ok_or_else(|| {
                    ProtocolError::UnsupportedService(
                        "subprocess backend requires a repository on disk".to_string(),
                    )
                })?;
                Ok(Arc::new(SubprocessBackend::new(
                    self.config.git_binary.clone(),
                    dir,
                )))
            }
        }
    }
}
