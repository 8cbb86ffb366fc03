//! Collaborator interfaces shared by the SSH and HTTP transports.
//!
//! Repository lookup and authorisation live outside this crate; the transports only see them
//! through [`RepositoryResolver`] and [`AccessPolicy`]. [`StorageResolver`] and [`AllowAll`] are
//! the built-in implementations used by the demo server and the tests.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::backend::{BackendSelector, RepoHandle};
use crate::protocol::types::{Action, ProtocolError};

/// Who is asking.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Identity {
    pub user: String,
    /// Public key fingerprint when the peer authenticated with a key.
    pub fingerprint: Option<String>,
}

impl Identity {
    pub const ANONYMOUS: &'static str = "anonymous";

    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            fingerprint: None,
        }
    }

    pub fn anonymous() -> Self {
        Self::new(Self::ANONYMOUS)
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    pub fn is_anonymous(&self) -> bool {
        self.user == Self::ANONYMOUS && self.fingerprint.is_none()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.fingerprint {
            Some(fp) => write!(f, "{} ({fp})", self.user),
            None => f.write_str(&self.user),
        }
    }
}

/// Maps a `<domain>/<repo>` address onto a repository.
#[async_trait]
pub trait RepositoryResolver: Send + Sync {
    /// Returns [`ProtocolError::NotFound`] for unknown repositories.
    async fn resolve(&self, domain: &str, repo: &str) -> Result<RepoHandle, ProtocolError>;
}

/// Decides whether an identity may perform an action on a repository.
pub trait AccessPolicy: Send + Sync {
    fn authorize(&self, identity: &Identity, repo: &RepoHandle, action: Action) -> bool;
}

/// Grants everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn authorize(&self, _identity: &Identity, _repo: &RepoHandle, _action: Action) -> bool {
        true
    }
}

/// Resolves repositories that already exist under the selector's storage root, optionally
/// creating missing ones.
#[derive(Debug, Clone)]
pub struct StorageResolver {
    selector: Arc<BackendSelector>,
    auto_create: bool,
}

impl StorageResolver {
    pub fn new(selector: Arc<BackendSelector>) -> Self {
        let auto_create = selector.config().auto_create;
        Self {
            selector,
            auto_create,
        }
    }

    pub fn auto_create(mut self, enabled: bool) -> Self {
        self.auto_create = enabled;
        self
    }
}

#[async_trait]
impl RepositoryResolver for StorageResolver {
    async fn resolve(&self, domain: &str, repo: &str) -> Result<RepoHandle, ProtocolError> {
        if !valid_segment(domain) || !valid_segment(repo) {
            debug!(domain, repo, "rejected repository address");
            return Err(ProtocolError::not_found(&format!("{domain}/{repo}")));
        }
        if self.selector.repository_exists(domain, repo).await? {
            return Ok(RepoHandle::new(domain, repo, self.selector.kind()));
        }
        if self.auto_create {
            info!(domain, repo, "creating repository on first access");
            return self.selector.init_repository(domain, repo).await;
        }
        Err(ProtocolError::not_found(&format!("{domain}/{repo}")))
    }
}

/// One path component, no traversal.
fn valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains(['/', '\\', '\0'])
}
