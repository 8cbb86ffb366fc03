//! SSH transport.
//!
//! [`SshServer`] owns the accept loop. Each accepted socket gets its own task running a russh
//! session with a [`ConnectionHandler`], which keeps one [`ChannelSession`] per open channel and
//! spawns the registered [`CommandHandler`] when an exec is accepted. Dropping the connection
//! handler aborts every command task it spawned, which in turn drops the transport sessions and
//! any git processes behind them.

pub mod channel;

use std::{collections::HashMap, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::Engine;
use russh::{
    Channel, ChannelId, MethodSet, Pty, SshId,
    server::{Auth, Handle, Msg, Session},
};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

pub use channel::{
    ChannelIo, ChannelSession, CommandContext, CommandHandler, CommandRegistry, ExecCommand,
    GitCommandHandler, RegistryError,
};

use crate::{
    config::SshConfig,
    protocol::{core::Identity, types::ProtocolError},
};

/// Load the host key named by `config`: inline base64 PEM first, then the key file.
///
/// Without either an ephemeral ed25519 key is generated, which clients will see change on every
/// restart.
pub fn load_host_key(config: &SshConfig) -> Result<KeyPair, ProtocolError> {
    let passphrase = config.host_key_passphrase.as_deref();
    if let Some(encoded) = &config.host_key_base64 {
        let pem = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| ProtocolError::Handshake(format!("host key is not valid base64: {e}")))?;
        let pem = String::from_utf8(pem)
            .map_err(|_| ProtocolError::Handshake("host key is not PEM text".to_string()))?;
        return decode_key(&pem, passphrase);
    }
    if let Some(path) = &config.host_key_path {
        return read_key_file(path, passphrase);
    }
    warn!("no ssh host key configured, generating an ephemeral one");
    KeyPair::generate_ed25519()
        .ok_or_else(|| ProtocolError::Handshake("could not generate a host key".to_string()))
}

fn read_key_file(path: &Path, passphrase: Option<&str>) -> Result<KeyPair, ProtocolError> {
    let pem = std::fs::read_to_string(path)?;
    decode_key(&pem, passphrase)
        .map_err(|e| ProtocolError::Handshake(format!("{}: {e}", path.display())))
}

fn decode_key(pem: &str, passphrase: Option<&str>) -> Result<KeyPair, ProtocolError> {
    russh_keys::decode_secret_key(pem, passphrase)
        .map_err(|e| ProtocolError::Handshake(format!("cannot decode host key: {e}")))
}

/// russh server settings for `config`.
pub fn server_config(config: &SshConfig) -> Result<russh::server::Config, ProtocolError> {
    Ok(russh::server::Config {
        server_id: SshId::Standard(config.server_id.clone()),
        methods: MethodSet::NONE | MethodSet::PUBLICKEY,
        keys: vec![load_host_key(config)?],
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        inactivity_timeout: Some(Duration::from_secs(3600)),
        ..Default::default()
    })
}

/// Accepts SSH connections and runs each in its own task.
pub struct SshServer {
    config: Arc<russh::server::Config>,
    registry: Arc<CommandRegistry>,
}

impl SshServer {
    pub fn new(config: &SshConfig, registry: CommandRegistry) -> Result<Self, ProtocolError> {
        Ok(Self {
            config: Arc::new(server_config(config)?),
            registry: Arc::new(registry),
        })
    }

    /// Accept until the listener fails.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ProtocolError> {
        info!(addr = ?listener.local_addr().ok(), verbs = ?self.registry, "ssh server listening");
        loop {
            let (socket, peer) = listener.accept().await?;
            let config = self.config.clone();
            let registry = self.registry.clone();
            tokio::spawn(async move {
                handle_connection(config, registry, socket, peer).await;
            });
        }
    }
}

async fn handle_connection(
    config: Arc<russh::server::Config>,
    registry: Arc<CommandRegistry>,
    socket: TcpStream,
    peer: SocketAddr,
) {
    debug!(%peer, "accepted ssh connection");
    let handler = ConnectionHandler::new(peer, registry);
    let session = match russh::server::run_stream(config, socket, handler).await {
        Ok(session) => session,
        Err(e) => {
            warn!(%peer, error = %e, "ssh handshake failed");
            return;
        }
    };
    match session.await {
        Ok(()) => debug!(%peer, "ssh connection closed"),
        Err(e) => warn!(%peer, error = %e, "ssh connection ended with error"),
    }
}

struct OpenChannel {
    /// Taken when the exec is dispatched.
    channel: Option<Channel<Msg>>,
    session: ChannelSession,
}

/// State of one SSH connection.
pub struct ConnectionHandler {
    peer: SocketAddr,
    identity: Identity,
    registry: Arc<CommandRegistry>,
    channels: HashMap<ChannelId, OpenChannel>,
    tasks: HashMap<ChannelId, JoinHandle<()>>,
}

impl ConnectionHandler {
    pub fn new(peer: SocketAddr, registry: Arc<CommandRegistry>) -> Self {
        Self {
            peer,
            identity: Identity::anonymous(),
            registry,
            channels: HashMap::new(),
            tasks: HashMap::new(),
        }
    }

    fn reject(&self, channel: ChannelId, request: &str, session: &mut Session) {
        let err = ProtocolError::UnsupportedRequest(request.to_string());
        warn!(peer = %self.peer, ?channel, "{err}");
        session.channel_failure(channel);
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

#[async_trait]
impl russh::server::Handler for ConnectionHandler {
    type Error = ProtocolError;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        self.identity = Identity::new(user);
        Ok(Auth::Accept)
    }

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        self.identity = Identity::new(user).with_fingerprint(public_key.fingerprint());
        info!(peer = %self.peer, user = %self.identity, "ssh public key authentication");
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(peer = %self.peer, channel = ?channel.id(), "channel opened");
        self.channels.insert(
            channel.id(),
            OpenChannel {
                channel: Some(channel),
                session: ChannelSession::new(),
            },
        );
        Ok(true)
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        if let Some(task) = self.tasks.remove(&channel) {
            task.abort();
        }
        debug!(peer = %self.peer, ?channel, "channel closed");
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let accepted = match self.channels.get_mut(&channel) {
            Some(open) => open.session.set_env(variable_name, variable_value),
            None => Err(ProtocolError::UnsupportedRequest("env on unknown channel".to_string())),
        };
        match accepted {
            Ok(()) => session.channel_success(channel),
            Err(e) => {
                debug!(peer = %self.peer, ?channel, error = %e, "env rejected");
                session.channel_failure(channel);
            }
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(open) = self.channels.get_mut(&channel) else {
            session.channel_failure(channel);
            return Ok(());
        };
        let command = match open.session.accept_exec(data) {
            Ok(command) => command,
            Err(e) => {
                warn!(peer = %self.peer, ?channel, error = %e, "exec rejected");
                session.channel_failure(channel);
                return Ok(());
            }
        };
        let Some(handler) = self.registry.get(&command.name) else {
            warn!(peer = %self.peer, ?channel, command = %command, "no handler for command");
            session.channel_failure(channel);
            session.close(channel);
            return Ok(());
        };
        let Some(stream) = open.channel.take() else {
            session.channel_failure(channel);
            return Ok(());
        };

        session.channel_success(channel);
        info!(peer = %self.peer, ?channel, command = %command, user = %self.identity, "dispatching command");
        let ctx = CommandContext {
            command,
            env: open.session.env().to_vec(),
            identity: self.identity.clone(),
        };
        let handle = session.handle();
        let task = tokio::spawn(run_command(handler, ctx, stream, handle));
        self.tasks.insert(channel, task);
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.reject(channel, "pty-req", session);
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        self.reject(channel, "shell", session);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.reject(channel, &format!("subsystem {name}"), session);
        Ok(())
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.reject(channel, "x11-req", session);
        Ok(())
    }

    async fn agent_request(&mut self, channel: ChannelId, _session: &mut Session) -> Result<bool, Self::Error> {
        warn!(peer = %self.peer, ?channel, "unsupported request: auth-agent-req");
        Ok(false)
    }
}

/// Run `handler` on the channel streams, then report the exit status and close the channel.
async fn run_command(
    handler: Arc<dyn CommandHandler>,
    ctx: CommandContext,
    channel: Channel<Msg>,
    handle: Handle,
) {
    let id = channel.id();
    let stderr = channel.make_writer_ext(Some(1));
    let (input, output) = tokio::io::split(channel.into_stream());
    let mut io = ChannelIo {
        input: Box::new(input),
        output: Box::new(output),
        stderr: Box::new(stderr),
    };

    let command = ctx.command.clone();
    let status = handler.handle(ctx, &mut io).await;
    if let Err(e) = io.output.flush().await {
        debug!(channel = ?id, error = %e, "flushing channel output failed");
    }
    drop(io);

    info!(channel = ?id, command = %command, status, "command finished");
    if handle.eof(id).await.is_err() || handle.exit_status_request(id, status).await.is_err() {
        error!(channel = ?id, "connection gone before exit status was sent");
        return;
    }
    let _ = handle.close(id).await;
}
