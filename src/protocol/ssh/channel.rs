//! Per-channel request handling: `env` collection, the single `exec`, and command dispatch.
//!
//! Nothing here knows about SSH packets. The connection handler in the parent module feeds
//! requests into a [`ChannelSession`] and, once an exec is accepted, hands the channel streams to
//! the [`CommandHandler`] registered for the verb.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::{
    backend::BackendSelector,
    protocol::{
        core::{AccessPolicy, Identity, RepositoryResolver},
        smart::TransportSession,
        types::{ProtocolError, ServiceKind},
    },
};

/// `<verb> <argument>` as sent in an exec request, with the argument cleaned up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCommand {
    pub name: String,
    pub args: String,
}

impl ExecCommand {
    /// Split a command line into verb and argument. Quotes around the argument, a leading `/`
    /// and a trailing `.git` are removed.
    pub fn parse(line: &[u8]) -> Result<Self, ProtocolError> {
        let line = std::str::from_utf8(line)
            .map_err(|_| ProtocolError::decode("exec command is not valid UTF-8"))?
            .trim();
        let (name, args) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        if name.is_empty() {
            return Err(ProtocolError::decode("empty exec command"));
        }
        let args = args.trim().trim_matches(|c| c == '\'' || c == '"');
        let args = args.strip_prefix('/').unwrap_or(args);
        let args = args.strip_suffix(".git").unwrap_or(args);
        Ok(Self {
            name: name.to_string(),
            args: args.to_string(),
        })
    }

    /// `<domain>/<repo>`, or a bare `<repo>` placed in `default_domain`.
    pub fn repo_address(&self, default_domain: Option<&str>) -> Result<(String, String), ProtocolError> {
        match self.args.split_once('/') {
            Some((domain, repo)) if !domain.is_empty() && !repo.is_empty() => {
                Ok((domain.to_string(), repo.to_string()))
            }
            None if !self.args.is_empty() => match default_domain {
                Some(domain) => Ok((domain.to_string(), self.args.clone())),
                None => Err(ProtocolError::not_found(&self.args)),
            },
            _ => Err(ProtocolError::not_found(&self.args)),
        }
    }
}

impl fmt::Display for ExecCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.name, self.args)
    }
}

/// Request state of one channel.
#[derive(Debug, Default)]
pub struct ChannelSession {
    env: Vec<(String, String)>,
    command: Option<ExecCommand>,
    handled: bool,
}

impl ChannelSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an `env` request. Variables are only accepted before the exec.
    pub fn set_env(&mut self, name: &str, value: &str) -> Result<(), ProtocolError> {
        if self.handled {
            return Err(ProtocolError::UnsupportedRequest(format!("env {name} after exec")));
        }
        self.env.push((name.to_string(), value.to_string()));
        Ok(())
    }

    /// Accept the first exec request; every later one fails.
    pub fn accept_exec(&mut self, line: &[u8]) -> Result<ExecCommand, ProtocolError> {
        if self.handled {
            return Err(ProtocolError::UnsupportedRequest("second exec".to_string()));
        }
        let command = ExecCommand::parse(line)?;
        self.handled = true;
        self.command = Some(command.clone());
        Ok(command)
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn command(&self) -> Option<&ExecCommand> {
        self.command.as_ref()
    }

    pub fn handled(&self) -> bool {
        self.handled
    }
}

/// Everything a command handler learns about its invocation.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub command: ExecCommand,
    pub env: Vec<(String, String)>,
    pub identity: Identity,
}

/// Channel streams: stdin, stdout and stderr (extended data 1).
pub struct ChannelIo {
    pub input: Box<dyn AsyncRead + Unpin + Send>,
    pub output: Box<dyn AsyncWrite + Unpin + Send>,
    pub stderr: Box<dyn AsyncWrite + Unpin + Send>,
}

impl ChannelIo {
    /// Write a `fatal:` line to stderr, ignoring a peer that already left.
    pub async fn fatal(&mut self, message: &str) {
        let line = format!("fatal: {message}\n");
        if let Err(e) = self.stderr.write_all(line.as_bytes()).await {
            debug!(error = %e, "stderr closed");
        }
        let _ = self.stderr.flush().await;
    }
}

/// Runs one exec'd command to completion and returns its exit status.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, ctx: CommandContext, io: &mut ChannelIo) -> u32;
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("a handler for `{0}` is already registered")]
    Duplicate(String),
}

/// Command handlers by verb.
#[derive(Default, Clone)]
pub struct CommandRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Both git services served through `resolver` and `policy`.
    pub fn git(
        selector: Arc<BackendSelector>,
        resolver: Arc<dyn RepositoryResolver>,
        policy: Arc<dyn AccessPolicy>,
    ) -> Result<Self, RegistryError> {
        let handler = Arc::new(GitCommandHandler::new(selector, resolver, policy));
        let mut registry = Self::new();
        registry.register(ServiceKind::UploadPack.to_string(), handler.clone())?;
        registry.register(ServiceKind::ReceivePack.to_string(), handler)?;
        Ok(registry)
    }

    pub fn register(
        &mut self,
        verb: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), RegistryError> {
        let verb = verb.into();
        if self.handlers.contains_key(&verb) {
            return Err(RegistryError::Duplicate(verb));
        }
        self.handlers.insert(verb, handler);
        Ok(())
    }

    pub fn get(&self, verb: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(verb).cloned()
    }

    pub fn verbs(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

/// `git-upload-pack` / `git-receive-pack` over an SSH channel.
pub struct GitCommandHandler {
    selector: Arc<BackendSelector>,
    resolver: Arc<dyn RepositoryResolver>,
    policy: Arc<dyn AccessPolicy>,
}

impl GitCommandHandler {
    pub fn new(
        selector: Arc<BackendSelector>,
        resolver: Arc<dyn RepositoryResolver>,
        policy: Arc<dyn AccessPolicy>,
    ) -> Self {
        Self {
            selector,
            resolver,
            policy,
        }
    }

    async fn run(&self, ctx: &CommandContext, io: &mut ChannelIo) -> Result<(), ProtocolError> {
        let service: ServiceKind = ctx.command.name.parse()?;
        let default_domain = self.selector.config().default_domain.as_deref();
        let (domain, repo) = ctx.command.repo_address(default_domain)?;
        let handle = self.resolver.resolve(&domain, &repo).await?;
        if !self.policy.authorize(&ctx.identity, &handle, service.action()) {
            return Err(ProtocolError::forbidden(&format!(
                "{} may not {:?} {}",
                ctx.identity.user,
                service.action(),
                handle.storage_path
            )));
        }
        info!(
            service = %service,
            repo = %handle.storage_path,
            user = %ctx.identity,
            "serving ssh command"
        );

        let backend = self.selector.open(&handle).await?;
        let mut session = TransportSession::new(service, backend);
        let input = std::mem::replace(&mut io.input, Box::new(tokio::io::empty()));
        session
            .serve(input, &mut io.output, &mut io.stderr, true)
            .await
    }
}

#[async_trait]
impl CommandHandler for GitCommandHandler {
    async fn handle(&self, ctx: CommandContext, io: &mut ChannelIo) -> u32 {
        match self.run(&ctx, io).await {
            Ok(()) => 0,
            Err(e) => {
                warn!(command = %ctx.command, user = %ctx.identity, error = %e, "ssh command failed");
                if matches!(
                    e,
                    ProtocolError::NotFound(_)
                        | ProtocolError::Forbidden(_)
                        | ProtocolError::UnsupportedService(_)
                ) {
                    io.fatal(&e.to_string()).await;
                }
                e.exit_status()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, DuplexStream, duplex};

    use super::*;
    use crate::{
        config::GitConfig,
        protocol::{
            core::{AllowAll, StorageResolver, tests::ReadOnly},
            pktline::read_pkt_line,
        },
        storage::StorageMode,
    };

    #[test]
    fn test_exec_command_parsing() {
        let cmd = ExecCommand::parse(b"git-upload-pack '/acme/widgets.git'").unwrap();
        assert_eq!(cmd.name, "git-upload-pack");
        assert_eq!(cmd.args, "acme/widgets");
        assert_eq!(
            cmd.repo_address(None).unwrap(),
            ("acme".to_string(), "widgets".to_string())
        );

        let bare = ExecCommand::parse(b"git-receive-pack widgets").unwrap();
        assert_eq!(
            bare.repo_address(Some("solo")).unwrap(),
            ("solo".to_string(), "widgets".to_string())
        );
        assert!(matches!(bare.repo_address(None), Err(ProtocolError::NotFound(_))));
        assert!(ExecCommand::parse(b"  ").is_err());
    }

    #[test]
    fn test_only_first_exec_is_accepted() {
        let mut session = ChannelSession::new();
        session.set_env("GIT_PROTOCOL", "version=0").unwrap();
        let first = session.accept_exec(b"git-upload-pack 'acme/a'").unwrap();
        assert_eq!(first.args, "acme/a");
        assert!(session.handled());

        assert!(matches!(
            session.accept_exec(b"git-receive-pack 'acme/b'"),
            Err(ProtocolError::UnsupportedRequest(_))
        ));
        assert_eq!(session.command(), Some(&first));
    }

    #[test]
    fn test_env_is_rejected_after_exec() {
        let mut session = ChannelSession::new();
        session.set_env("LANG", "C").unwrap();
        session.accept_exec(b"git-upload-pack x/y").unwrap();
        assert!(session.set_env("LC_ALL", "C").is_err());
        assert_eq!(session.env(), &[("LANG".to_string(), "C".to_string())]);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        struct Noop;
        #[async_trait]
        impl CommandHandler for Noop {
            async fn handle(&self, _ctx: CommandContext, _io: &mut ChannelIo) -> u32 {
                0
            }
        }
        let mut registry = CommandRegistry::new();
        registry.register("git-upload-pack", Arc::new(Noop)).unwrap();
        assert!(matches!(
            registry.register("git-upload-pack", Arc::new(Noop)),
            Err(RegistryError::Duplicate(_))
        ));
        assert!(registry.get("git-upload-pack").is_some());
        assert!(registry.get("git-lfs-authenticate").is_none());
    }

    fn git_handler(policy: Arc<dyn AccessPolicy>) -> (Arc<BackendSelector>, GitCommandHandler) {
        let selector = Arc::new(BackendSelector::new(GitConfig {
            storage: StorageMode::Mem,
            ..GitConfig::default()
        }));
        let resolver = Arc::new(StorageResolver::new(selector.clone()));
        (selector.clone(), GitCommandHandler::new(selector, resolver, policy))
    }

    fn channel_io(input: &'static [u8]) -> (ChannelIo, DuplexStream, DuplexStream) {
        let (output, output_peer) = duplex(1 << 20);
        let (stderr, stderr_peer) = duplex(1 << 16);
        let io = ChannelIo {
            input: Box::new(input),
            output: Box::new(output),
            stderr: Box::new(stderr),
        };
        (io, output_peer, stderr_peer)
    }

    fn context(line: &[u8]) -> CommandContext {
        CommandContext {
            command: ExecCommand::parse(line).unwrap(),
            env: Vec::new(),
            identity: Identity::new("git"),
        }
    }

    #[tokio::test]
    async fn test_upload_pack_advertises_inline() {
        let (selector, handler) = git_handler(Arc::new(AllowAll));
        selector.init_repository("acme", "widgets").await.unwrap();
        let (mut io, mut output, _stderr) = channel_io(b"0000");

        let status = handler
            .handle(context(b"git-upload-pack '/acme/widgets.git'"), &mut io)
            .await;
        assert_eq!(status, 0);
        drop(io);

        let mut bytes = Vec::new();
        output.read_to_end(&mut bytes).await.unwrap();
        let mut bytes = bytes::Bytes::from(bytes);
        let first = read_pkt_line(&mut bytes).unwrap().unwrap();
        let expected = format!("{} capabilities^{{}}\0", crate::hash::ObjectHash::ZERO);
        assert!(first.text().unwrap().starts_with(expected.as_bytes()));
    }

    #[tokio::test]
    async fn test_forbidden_push_exits_nonzero() {
        let (selector, handler) = git_handler(Arc::new(ReadOnly));
        selector.init_repository("acme", "widgets").await.unwrap();
        let (mut io, mut output, mut stderr) = channel_io(b"");

        let status = handler
            .handle(context(b"git-receive-pack 'acme/widgets'"), &mut io)
            .await;
        assert_eq!(status, 1);
        drop(io);

        let mut out = Vec::new();
        output.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
        let mut err = String::new();
        stderr.read_to_string(&mut err).await.unwrap();
        assert!(err.starts_with("fatal: Forbidden"), "{err}");
    }

    #[tokio::test]
    async fn test_missing_repository_exits_nonzero() {
        let (_selector, handler) = git_handler(Arc::new(AllowAll));
        let (mut io, _output, mut stderr) = channel_io(b"");
        let status = handler
            .handle(context(b"git-upload-pack 'acme/nothing'"), &mut io)
            .await;
        assert_eq!(status, 1);
        drop(io);
        let mut err = String::new();
        stderr.read_to_string(&mut err).await.unwrap();
        assert!(err.contains("not found"), "{err}");
    }
}
