//! Smart HTTP and SSH git server over one storage root.
//!
//! Repositories live under `git.storage_root` as `<domain>/<repo>` and are created on first
//! access when `git.auto_create` is set. Every request is allowed.
//!
//! Quick test (two terminals):
//! A) Start the server with repositories created on demand:
//! ```bash
//! GIT_TRANSPORT_GIT_AUTO_CREATE=true GIT_TRANSPORT_GIT_STORAGE_ROOT=/tmp/git-transport-demo \
//!     cargo run --example server
//! ```
//! The HTTP endpoint listens on 8080 and SSH on 8022. Pass a TOML file as the first argument to
//! override anything else, and `GIT_TRANSPORT_GIT_BACKEND=subprocess` to serve through the
//! local `git` binary instead of the embedded store.
//!
//! B) Push over HTTP, clone over SSH:
//! ```bash
//! mkdir -p /tmp/demo-src && cd /tmp/demo-src
//! git init -b main
//! git config user.name demo
//! git config user.email demo@example.com
//! echo hello > README.md
//! git add README.md
//! git commit -m "init"
//! git remote add origin http://127.0.0.1:8080/acme/demo.git
//! git push -u origin main
//! GIT_SSH_COMMAND="ssh -p 8022 -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null" \
//!     git clone ssh://git@127.0.0.1/acme/demo.git /tmp/demo-clone
//! ```

use std::{path::PathBuf, sync::Arc};

use git_transport::{
    BackendSelector, ServerConfig, init_tracing,
    protocol::{
        AllowAll, StorageResolver,
        http::{AppState, router},
        ssh::{CommandRegistry, SshServer},
    },
};
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("info");

    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = ServerConfig::load(path.as_deref())?;
    info!(backend = ?config.git.backend, storage = ?config.git.storage, "starting");

    let selector = Arc::new(BackendSelector::new(config.git.clone()));
    let resolver = Arc::new(StorageResolver::new(selector.clone()));
    let policy = Arc::new(AllowAll);

    let registry = CommandRegistry::git(selector.clone(), resolver.clone(), policy.clone())?;
    let ssh = SshServer::new(&config.ssh, registry)?;
    let ssh_listener = TcpListener::bind(&config.ssh.listen).await?;
    let ssh_task = tokio::spawn(async move {
        if let Err(e) = ssh.serve(ssh_listener).await {
            error!(error = %e, "ssh server stopped");
        }
    });

    let app = router(AppState {
        selector,
        resolver,
        policy,
        config: Arc::new(config.http.clone()),
    });
    let http_listener = TcpListener::bind(&config.http.listen).await?;
    info!(addr = %config.http.listen, "http server listening");
    axum::serve(http_listener, app).await?;

    ssh_task.abort();
    Ok(())
}
