//! The smart protocol state machine: one advertise / negotiate / stream cycle of upload-pack or
//! receive-pack over an arbitrary pair of byte streams.
//!
//! The session encodes and decodes every pkt-line itself and only asks the backend for refs,
//! object existence and raw pack bytes. Whether the advertisement is sent inline before reading
//! the request is an explicit argument: SSH sessions advertise first, smart-HTTP POSTs do not.

use std::{
    collections::HashSet,
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use super::{
    pktline::{PktLine, PktLineReader, write_pkt_line},
    types::{
        Capability, CapabilitySet, ProtocolError, ReportStatus, ServiceKind, UpdateRequest,
        UploadRequest,
    },
    utils::{UploadLine, build_advertisement, build_report_status, parse_ref_command, parse_upload_line},
};
use crate::{
    backend::{DynWriter, SessionBackend},
    hash::ObjectHash,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    AdvertisingRefs,
    AwaitingRequest,
    Processing,
    Completed,
    Failed,
}

/// Smart protocol session against one backend.
pub struct TransportSession {
    service: ServiceKind,
    backend: Arc<dyn SessionBackend>,
    /// Capabilities the client requested.
    capabilities: CapabilitySet,
    state: SessionState,
    /// A status report or `ERR` line reached the output.
    reported: bool,
}

impl TransportSession {
    pub fn new(service: ServiceKind, backend: Arc<dyn SessionBackend>) -> Self {
        Self {
            service,
            backend,
            capabilities: CapabilitySet::default(),
            state: SessionState::Created,
            reported: false,
        }
    }

    pub fn service(&self) -> ServiceKind {
        self.service
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// Whether the client was told how the session ended, through a status report or an `ERR`
    /// line. A failed session that did not report left its output cut short.
    pub fn reported(&self) -> bool {
        self.reported
    }

    /// Encode the whole advertisement section without writing anything.
    pub async fn advertisement(&mut self, service_header: bool) -> Result<BytesMut, ProtocolError> {
        self.state = SessionState::AdvertisingRefs;
        let refs = self.backend.advertised_refs(self.service).await?;
        let caps = CapabilitySet::for_service(self.service);
        let section = build_advertisement(self.service, &refs, &caps, service_header)?;
        debug!(service = %self.service, refs = refs.len(), "built advertisement");
        Ok(section)
    }

    /// Smart-HTTP `info/refs` body: `# service=` line, flush, refs, flush.
    pub async fn advertise_refs<W>(&mut self, writer: &mut W) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let result = self.write_advertisement(writer, true).await;
        self.finish(result)
    }

    async fn write_advertisement<W>(
        &mut self,
        writer: &mut W,
        service_header: bool,
    ) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let section = self.advertisement(service_header).await?;
        writer.write_all(&section).await?;
        writer.flush().await?;
        self.state = SessionState::AwaitingRequest;
        Ok(())
    }

    fn finish(&mut self, result: Result<(), ProtocolError>) -> Result<(), ProtocolError> {
        self.state = match result {
            Ok(()) => SessionState::Completed,
            Err(_) => SessionState::Failed,
        };
        result
    }

    /// Run the session's service over `input` and `output`.
    pub async fn serve<R, W>(
        &mut self,
        input: R,
        output: &mut W,
        stderr: &mut DynWriter<'_>,
        advertise_first: bool,
    ) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send,
    {
        match self.service {
            ServiceKind::UploadPack => {
                self.serve_upload_pack(input, output, stderr, advertise_first)
                    .await
            }
            ServiceKind::ReceivePack => {
                self.serve_receive_pack(input, output, stderr, advertise_first)
                    .await
            }
        }
    }

    /// Fetch: optional inline advertisement, want/have negotiation, then the pack.
    pub async fn serve_upload_pack<R, W>(
        &mut self,
        input: R,
        output: &mut W,
        stderr: &mut DynWriter<'_>,
        advertise_first: bool,
    ) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let mut pack_bytes = 0u64;
        let result = self
            .upload_pack(input, output, stderr, advertise_first, &mut pack_bytes)
            .await;
        if let Err(e) = &result {
            warn!(service = %self.service, error = %e, "upload-pack failed");
            if pack_bytes == 0 {
                self.reported = send_error_line(output, e).await;
            }
        }
        self.finish(result)
    }

    async fn upload_pack<R, W>(
        &mut self,
        input: R,
        output: &mut W,
        stderr: &mut DynWriter<'_>,
        advertise_first: bool,
        pack_bytes: &mut u64,
    ) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        if advertise_first {
            self.write_advertisement(output, false).await?;
        }
        self.state = SessionState::AwaitingRequest;
        let stateless = !advertise_first;
        let mut reader = PktLineReader::new(BufReader::new(input));

        let mut request = UploadRequest::default();
        loop {
            match reader.read_line().await? {
                None if request.wants.is_empty() => {
                    debug!("client closed before sending wants");
                    return Ok(());
                }
                None => return Err(ProtocolError::decode("unexpected end of want list")),
                Some(PktLine::Flush) => break,
                Some(line) => match parse_upload_line(line.text().unwrap_or_default())? {
                    UploadLine::Want(id, caps) => {
                        if let Some(caps) = caps.filter(|_| request.wants.is_empty()) {
                            self.capabilities = caps.clone();
                            request.capabilities = caps;
                        }
                        request.wants.push(id);
                    }
                    _ => return Err(ProtocolError::decode("expected want line")),
                },
            }
        }
        if request.wants.is_empty() {
            return Ok(());
        }
        self.check_wants(&request.wants).await?;

        loop {
            let line = reader
                .read_line()
                .await?
                .ok_or_else(|| ProtocolError::decode("unexpected end of negotiation"))?;
            match line {
                PktLine::Flush => {
                    if request.commons.is_empty() {
                        write_line(output, "NAK\n").await?;
                    }
                    if stateless {
                        debug!(commons = request.commons.len(), "negotiation round finished");
                        return Ok(());
                    }
                }
                line => match parse_upload_line(line.text().unwrap_or_default())? {
                    UploadLine::Have(id) => {
                        if !request.commons.contains(&id) && self.backend.has_object(&id).await? {
                            request.commons.push(id);
                            if request.commons.len() == 1 {
                                write_line(output, &format!("ACK {id}\n")).await?;
                            }
                        }
                    }
                    UploadLine::Done => {
                        if request.commons.is_empty() {
                            write_line(output, "NAK\n").await?;
                        }
                        request.done = true;
                        break;
                    }
                    UploadLine::Want(..) => {
                        return Err(ProtocolError::decode("want after the want list"));
                    }
                },
            }
        }

        self.state = SessionState::Processing;
        info!(
            wants = request.wants.len(),
            commons = request.commons.len(),
            "sending pack"
        );
        let mut counted = CountingWriter::new(output);
        let result = self
            .backend
            .upload_pack(&request, &mut counted, stderr)
            .await;
        *pack_bytes = counted.written;
        result?;
        counted.flush().await?;
        Ok(())
    }

    /// Every want must be something we advertised.
    async fn check_wants(&self, wants: &[ObjectHash]) -> Result<(), ProtocolError> {
        let advertised: HashSet<ObjectHash> = self
            .backend
            .advertised_refs(self.service)
            .await?
            .into_iter()
            .map(|r| r.id)
            .collect();
        match wants.iter().find(|id| !advertised.contains(id)) {
            Some(id) => Err(ProtocolError::decode(format!("not our ref {id}"))),
            None => Ok(()),
        }
    }

    /// Push: optional inline advertisement, commands, pack, then the status report.
    pub async fn serve_receive_pack<R, W>(
        &mut self,
        input: R,
        output: &mut W,
        stderr: &mut DynWriter<'_>,
        advertise_first: bool,
    ) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send,
    {
        let mut request = UpdateRequest::default();
        let result = self
            .receive_pack(input, output, stderr, advertise_first, &mut request)
            .await;
        if let Err(e) = &result {
            warn!(service = %self.service, error = %e, "receive-pack failed");
        }
        self.finish(result)
    }

    async fn receive_pack<R, W>(
        &mut self,
        input: R,
        output: &mut W,
        stderr: &mut DynWriter<'_>,
        advertise_first: bool,
        request: &mut UpdateRequest,
    ) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send,
    {
        if advertise_first {
            self.write_advertisement(output, false).await?;
        }
        self.state = SessionState::AwaitingRequest;
        let mut reader = PktLineReader::new(BufReader::new(input));

        loop {
            let line = match reader.read_line().await {
                Ok(Some(line)) => line,
                Ok(None) if request.commands.is_empty() => {
                    debug!("client closed without commands");
                    return Ok(());
                }
                Ok(None) => {
                    let err = ProtocolError::decode("unexpected end of command list");
                    return self.report_failure(output, request, err).await;
                }
                Err(err) => return self.report_failure(output, request, err).await,
            };
            let Some(text) = line.text() else {
                break;
            };
            match parse_ref_command(text) {
                Ok((command, caps)) => {
                    if let Some(caps) = caps.filter(|_| request.commands.is_empty()) {
                        self.capabilities = caps.clone();
                        request.capabilities = caps;
                    }
                    request.commands.push(command);
                }
                Err(err) => return self.report_failure(output, request, err).await,
            }
        }
        if request.commands.is_empty() {
            return Ok(());
        }

        self.state = SessionState::Processing;
        let pack = request
            .expects_pack()
            .then(|| Box::new(reader.into_inner()) as crate::backend::PackReader);
        info!(
            commands = request.commands.len(),
            pack = pack.is_some(),
            "receiving push"
        );
        let report = match self.backend.receive_pack(request, pack, stderr).await {
            Ok(report) => report,
            Err(err) => return self.report_failure(output, request, err).await,
        };

        if request.wants_report() {
            output.write_all(&build_report_status(&report)?).await?;
            output.flush().await?;
            self.reported = true;
        }
        match report.unpack {
            Ok(()) => {
                let rejected = report.commands.iter().filter(|c| c.error.is_some()).count();
                info!(rejected, "push finished");
                Ok(())
            }
            Err(message) => Err(ProtocolError::backend(format!("unpack failed: {message}"))),
        }
    }

    /// Tell a client that asked for a report why nothing was applied, then fail.
    async fn report_failure<W>(
        &mut self,
        output: &mut W,
        request: &UpdateRequest,
        err: ProtocolError,
    ) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        if request.capabilities.contains(&Capability::ReportStatus) {
            let report = ReportStatus::unpack_failed(request, err.to_string());
            if let Ok(section) = build_report_status(&report) {
                let delivered = match output.write_all(&section).await {
                    Ok(()) => output.flush().await,
                    Err(e) => Err(e),
                };
                match delivered {
                    Ok(()) => self.reported = true,
                    Err(e) => debug!(error = %e, "could not deliver failure report"),
                }
            }
        }
        Err(err)
    }
}

async fn write_line<W>(output: &mut W, line: &str) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_pkt_line(output, line.as_bytes()).await?;
    output.flush().await?;
    Ok(())
}

/// Best effort `ERR` line; the peer may already be gone. Returns whether it was written.
async fn send_error_line<W>(output: &mut W, err: &ProtocolError) -> bool
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let message = err.to_string().replace('\n', " ");
    match write_line(output, &format!("ERR {message}\n")).await {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "could not deliver ERR line");
            false
        }
    }
}

/// Counts bytes a backend managed to write, so a failure can tell whether the pack had started.
struct CountingWriter<'a, W: ?Sized> {
    inner: &'a mut W,
    written: u64,
}

impl<'a, W: ?Sized> CountingWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self { inner, written: 0 }
    }
}

impl<W> AsyncWrite for CountingWriter<'_, W>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let poll = Pin::new(&mut *this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            this.written += *n as u64;
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}
