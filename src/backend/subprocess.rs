//! The subprocess backend: every operation runs the native `git` binary in stateless-rpc mode
//! inside the repository directory.
//!
//! The session performs negotiation and encodes the wire itself, so this backend only ever runs
//! git in its one-shot form: `--advertise-refs` to list refs, then a single request carrying
//! every want, common have and `done` (or every command plus the pack). git's replies are decoded
//! here and handed back as typed values, which keeps both backends byte-identical on the wire.
//!
//! Children are spawned with `kill_on_drop`, so dropping the session future kills git. Object
//! existence checks share one `git cat-file --batch-check` child per backend, started on the first
//! `have`.

use std::{path::PathBuf, process::ExitStatus, process::Stdio};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::Mutex,
};
use tracing::{debug, warn};

use super::{BackendKind, DynWriter, PackReader, SessionBackend};
use crate::{
    hash::ObjectHash,
    protocol::{
        pktline::{PktLine, add_flush, add_pkt_line_string, parse_header, read_all_pkt_lines},
        types::{
            AGENT, AdvertisedRef, Capability, CapabilitySet, ProtocolError, ReportStatus,
            ServiceKind, UpdateRequest, UploadRequest,
        },
        utils::{build_ref_commands, parse_advertisement, parse_report_status},
    },
};

/// Bytes of git's stderr kept for error messages.
const STDERR_TAIL: usize = 4096;

/// A running `git cat-file --batch-check`.
#[derive(Debug)]
struct BatchCheck {
    _child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl BatchCheck {
    /// `<id> missing` for absent objects, `<id> <type> <size>` otherwise.
    async fn contains(&mut self, id: &ObjectHash) -> Result<bool, ProtocolError> {
        self.stdin.write_all(format!("{id}\n").as_bytes()).await?;
        self.stdin.flush().await?;
        let mut line = String::new();
        if self.stdout.read_line(&mut line).await? == 0 {
            return Err(ProtocolError::backend("git cat-file exited"));
        }
        let line = line.trim_end();
        match line.strip_prefix(id.to_string().as_str()) {
            Some(" missing") => Ok(false),
            Some(rest) if !rest.is_empty() => Ok(true),
            _ => Err(ProtocolError::backend(format!(
                "unexpected git cat-file reply: {line}"
            ))),
        }
    }
}

#[derive(Debug)]
pub struct SubprocessBackend {
    git_binary: PathBuf,
    repo_dir: PathBuf,
    batch_check: Mutex<Option<BatchCheck>>,
}

impl SubprocessBackend {
    pub fn new(git_binary: PathBuf, repo_dir: PathBuf) -> Self {
        Self {
            git_binary,
            repo_dir,
            batch_check: Mutex::new(None),
        }
    }

    fn spawn_batch_check(&self) -> Result<BatchCheck, ProtocolError> {
        let mut cmd = Command::new(&self.git_binary);
        cmd.args(["cat-file", "--batch-check"])
            .current_dir(&self.repo_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        debug!(dir = %self.repo_dir.display(), "spawning git cat-file --batch-check");
        let mut child = cmd
            .spawn()
            .map_err(|e| ProtocolError::backend(format!("failed to run git cat-file: {e}")))?;
        let stdin = take_pipe(child.stdin.take(), "stdin")?;
        let stdout = BufReader::new(take_pipe(child.stdout.take(), "stdout")?);
        Ok(BatchCheck {
            _child: child,
            stdin,
            stdout,
        })
    }

    fn service_command(&self, service: ServiceKind, advertise: bool) -> Command {
        let mut cmd = Command::new(&self.git_binary);
        cmd.arg(service.verb()).arg("--stateless-rpc");
        if advertise {
            cmd.arg("--advertise-refs");
        }
        cmd.arg(".");
        cmd
    }

    fn spawn(&self, mut cmd: Command, stdin: Stdio) -> Result<Child, ProtocolError> {
        cmd.current_dir(&self.repo_dir)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!(command = ?cmd.as_std(), dir = %self.repo_dir.display(), "spawning git");
        cmd.spawn().map_err(|e| {
            ProtocolError::backend(format!(
                "failed to run {}: {e}",
                self.git_binary.display()
            ))
        })
    }
}

fn take_pipe<T>(pipe: Option<T>, name: &str) -> Result<T, ProtocolError> {
    pipe.ok_or_else(|| ProtocolError::backend(format!("git {name} is not piped")))
}

/// Forward git's stderr to `side_channel`, keeping the tail for error messages.
async fn drain_stderr<R>(mut pipe: R, side_channel: &mut DynWriter<'_>) -> Result<String, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut tail: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = pipe.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        debug!(stderr = %String::from_utf8_lossy(&buf[..n]).trim_end(), "git");
        // a client that stopped reading progress must not fail the operation
        if let Err(e) = side_channel.write_all(&buf[..n]).await {
            debug!(error = %e, "dropping git stderr");
        }
        tail.extend_from_slice(&buf[..n]);
        if tail.len() > STDERR_TAIL {
            tail.drain(..tail.len() - STDERR_TAIL);
        }
    }
    let _ = side_channel.flush().await;
    Ok(String::from_utf8_lossy(&tail).trim().to_string())
}

fn check_exit(service: &str, status: ExitStatus, stderr: &str) -> Result<(), ProtocolError> {
    if status.success() {
        return Ok(());
    }
    let message = if stderr.is_empty() {
        format!("git {service} exited with {status}")
    } else {
        format!("git {service} exited with {status}: {stderr}")
    };
    warn!(service, code = ?status.code(), "{message}");
    Err(ProtocolError::Backend {
        message,
        exit_code: status.code(),
    })
}

/// Skip git's negotiation replies and copy the pack that follows them to `output`.
async fn relay_pack<R>(mut stdout: R, output: &mut DynWriter<'_>) -> Result<u64, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut header = [0u8; 4];
        let mut filled = 0;
        while filled < header.len() {
            let n = stdout.read(&mut header[filled..]).await?;
            if n == 0 {
                return Err(ProtocolError::backend("git upload-pack sent no pack"));
            }
            filled += n;
        }
        // the pack is not framed; its signature takes the place of the next pkt-line header
        if &header == b"PACK" {
            output.write_all(&header).await?;
            let copied = tokio::io::copy(&mut stdout, output).await?;
            output.flush().await?;
            return Ok(copied + 4);
        }

        let Some(len) = parse_header(&header)? else {
            continue;
        };
        let mut payload = vec![0u8; len];
        stdout.read_exact(&mut payload).await?;
        let line = PktLine::Data(Bytes::from(payload));
        let text = line.text().unwrap_or_default();
        if let Some(message) = text.strip_prefix(b"ERR ") {
            return Err(ProtocolError::backend(String::from_utf8_lossy(message)));
        }
        debug!(line = %String::from_utf8_lossy(text), "git negotiation reply");
    }
}

async fn feed<W>(mut stdin: W, request: Bytes, pack: Option<PackReader>) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    stdin.write_all(&request).await?;
    if let Some(mut pack) = pack {
        tokio::io::copy(&mut pack, &mut stdin).await?;
    }
    stdin.shutdown().await?;
    Ok(())
}

#[async_trait]
impl SessionBackend for SubprocessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Subprocess
    }

    async fn advertised_refs(
        &self,
        service: ServiceKind,
    ) -> Result<Vec<AdvertisedRef>, ProtocolError> {
        let mut child = self.spawn(self.service_command(service, true), Stdio::null())?;
        let mut stdout = take_pipe(child.stdout.take(), "stdout")?;
        let stderr = take_pipe(child.stderr.take(), "stderr")?;

        let mut out = Vec::new();
        let mut sink = tokio::io::sink();
        let (_, err) = tokio::try_join!(
            async { Ok::<_, ProtocolError>(stdout.read_to_end(&mut out).await?) },
            drain_stderr(stderr, &mut sink),
        )?;
        check_exit(service.verb(), child.wait().await?, &err)?;

        let advertisement = parse_advertisement(Bytes::from(out))?;
        Ok(advertisement.refs)
    }

    async fn has_object(&self, id: &ObjectHash) -> Result<bool, ProtocolError> {
        let mut guard = self.batch_check.lock().await;
        if guard.is_none() {
            *guard = Some(self.spawn_batch_check()?);
        }
        let result = match guard.as_mut() {
            Some(checker) => checker.contains(id).await,
            None => Err(ProtocolError::backend("git cat-file is not running")),
        };
        if result.is_err() {
            // start a fresh child on the next call
            *guard = None;
        }
        result
    }

    async fn upload_pack(
        &self,
        request: &UploadRequest,
        output: &mut DynWriter<'_>,
        stderr: &mut DynWriter<'_>,
    ) -> Result<(), ProtocolError> {
        let service = ServiceKind::UploadPack;
        let mut child = self.spawn(self.service_command(service, false), Stdio::piped())?;
        let stdin = take_pipe(child.stdin.take(), "stdin")?;
        let stdout = take_pipe(child.stdout.take(), "stdout")?;
        let stderr_pipe = take_pipe(child.stderr.take(), "stderr")?;

        let mut caps = CapabilitySet::default();
        caps.insert(Capability::NoProgress);
        caps.insert(Capability::Agent(AGENT.to_string()));
        let mut body = bytes::BytesMut::new();
        for (i, want) in request.wants.iter().enumerate() {
            if i == 0 {
                add_pkt_line_string(&mut body, &format!("want {want} {caps}\n"))?;
            } else {
                add_pkt_line_string(&mut body, &format!("want {want}\n"))?;
            }
        }
        add_flush(&mut body);
        for have in &request.commons {
            add_pkt_line_string(&mut body, &format!("have {have}\n"))?;
        }
        add_pkt_line_string(&mut body, "done\n")?;

        let (_, copied, err) = tokio::try_join!(
            feed(stdin, body.freeze(), None),
            relay_pack(stdout, output),
            drain_stderr(stderr_pipe, stderr),
        )?;
        check_exit(service.verb(), child.wait().await?, &err)?;
        debug!(bytes = copied, "relayed pack from git");
        Ok(())
    }

    async fn receive_pack(
        &self,
        request: &UpdateRequest,
        pack: Option<PackReader>,
        stderr: &mut DynWriter<'_>,
    ) -> Result<ReportStatus, ProtocolError> {
        let service = ServiceKind::ReceivePack;
        let mut child = self.spawn(self.service_command(service, false), Stdio::piped())?;
        let stdin = take_pipe(child.stdin.take(), "stdin")?;
        let mut stdout = take_pipe(child.stdout.take(), "stdout")?;
        let stderr_pipe = take_pipe(child.stderr.take(), "stderr")?;

        // always ask git for a report; the session decides whether the client gets it
        let mut caps = CapabilitySet::default();
        caps.insert(Capability::ReportStatus);
        caps.insert(Capability::Agent(AGENT.to_string()));
        let commands = build_ref_commands(&request.commands, &caps)?.freeze();

        let feeding = feed(stdin, commands, pack);
        let collect = async {
            let mut out = Vec::new();
            let (_, err) = tokio::try_join!(
                async { Ok::<_, ProtocolError>(stdout.read_to_end(&mut out).await?) },
                drain_stderr(stderr_pipe, stderr),
            )?;
            Ok::<_, ProtocolError>((out, err))
        };
        tokio::pin!(feeding);
        tokio::pin!(collect);

        // git knows where the pack ends and exits after reporting, even when the client keeps
        // its side of the stream open, so git finishing ends the feed
        let (out, err) = tokio::select! {
            collected = &mut collect => collected?,
            fed = &mut feeding => {
                if let Err(e) = fed {
                    debug!(error = %e, "stopped feeding git receive-pack");
                }
                collect.await?
            }
        };
        let status = child.wait().await?;

        let report = read_all_pkt_lines(Bytes::from(out)).and_then(|lines| {
            let end = lines.iter().position(PktLine::is_flush).unwrap_or(lines.len());
            parse_report_status(&lines[..end])
        });
        match report {
            Ok(report) => {
                if !status.success() {
                    warn!(code = ?status.code(), "git receive-pack failed after reporting");
                }
                Ok(report)
            }
            Err(e) => {
                check_exit(service.verb(), status, &err)?;
                Err(e)
            }
        }
    }
}
