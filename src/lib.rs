//! git-transport: the transport and session engine of a self-hosted git service.
//!
//! Clients fetch and push over smart HTTP and SSH using the standard git wire protocol. This
//! crate accepts the connections, negotiates capabilities, advertises references and streams
//! pack data between the client and a repository backend. Account management and policy live
//! elsewhere and are consumed through [`protocol::RepositoryResolver`] and
//! [`protocol::AccessPolicy`].
//!
//! Modules
//! - `protocol`: pkt-line codec, the [`protocol::TransportSession`] state machine, the SSH server
//!   (`protocol::ssh`) and the axum router for smart HTTP (`protocol::http`).
//! - `backend`: the [`backend::SessionBackend`] contract, the embedded object store and the
//!   strategy that drives the native `git` binary, and [`backend::BackendSelector`].
//! - `storage`: the filesystem abstraction repositories live on, on disk or in memory.
//! - `internal`: object model, zlib and pack encode/decode used by the embedded backend.
//! - `config`: TOML configuration with `GIT_TRANSPORT_*` overrides.
//! - `errors`, `hash`, `utils`: object store errors, SHA-1 ids, small I/O helpers.
//!
//! Typical Usage
//! - Build a [`config::ServerConfig`], wrap a [`backend::BackendSelector`] in an `Arc`, pick a
//!   resolver and policy, then serve [`protocol::http::router`] with axum and
//!   [`protocol::ssh::SshServer`] on a TCP listener. `demos/server.rs` does exactly that.

pub mod backend;
pub mod config;
mod delta;
pub mod errors;
pub mod hash;
pub mod internal;
pub mod protocol;
pub mod storage;
pub mod utils;

pub use backend::{BackendKind, BackendSelector, RepoHandle, SessionBackend};
pub use config::ServerConfig;
pub use protocol::{ProtocolError, ServiceKind, TransportSession};

/// Install the fmt subscriber filtered by `RUST_LOG`, falling back to `default_filter`.
///
/// Safe to call more than once; later calls leave the first subscriber in place.
pub fn init_tracing(default_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
