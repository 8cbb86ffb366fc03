//! Smart HTTP endpoint.
//!
//! Two routes, both keyed by `<domain>/<repo>`:
//!
//! - `GET /{domain}/{repo}/info/refs?service=git-upload-pack` returns the advertisement.
//! - `POST /{domain}/{repo}/git-upload-pack` (or `git-receive-pack`) runs one stateless round
//!   of the service. The request body is streamed into the session and the response is streamed
//!   back through a bounded channel, so neither side is buffered whole.
//!
//! The repository is resolved and the access check passes before any backend is opened.

use std::{
    io::{self, Read},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
};

use axum::{
    Router,
    body::Body,
    extract::{Path, Query, State},
    http::{
        HeaderMap, StatusCode,
        header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine;
use bytes::Bytes;
use futures_util::TryStreamExt;
use serde::Deserialize;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter, DuplexStream},
    runtime::Handle,
    sync::mpsc,
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::{
    io::{StreamReader, SyncIoBridge},
    sync::PollSender,
};
use tracing::{debug, info, warn};

use super::{
    core::{AccessPolicy, Identity, RepositoryResolver},
    smart::TransportSession,
    types::{ProtocolError, ServiceKind},
};
use crate::{
    backend::{BackendSelector, RepoHandle},
    config::HttpConfig,
};

/// Largest inflated size of a gzip-encoded request body.
const MAX_INFLATED_REQUEST: u64 = 256 << 20;
const INFLATE_PIPE_SIZE: usize = 64 << 10;

/// Shared by every request.
#[derive(Clone)]
pub struct AppState {
    pub selector: Arc<BackendSelector>,
    pub resolver: Arc<dyn RepositoryResolver>,
    pub policy: Arc<dyn AccessPolicy>,
    pub config: Arc<HttpConfig>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/{domain}/{repo}/info/refs", get(info_refs))
        .route("/{domain}/{repo}/{service}", post(service_rpc))
        .with_state(state)
}

impl IntoResponse for ProtocolError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProtocolError::NotFound(_) => StatusCode::NOT_FOUND,
            ProtocolError::Forbidden(_) => StatusCode::FORBIDDEN,
            ProtocolError::Decode(_)
            | ProtocolError::UnsupportedService(_)
            | ProtocolError::UnsupportedRequest(_) => StatusCode::BAD_REQUEST,
            ProtocolError::Backend { .. } | ProtocolError::Handshake(_) | ProtocolError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct ServiceQuery {
    service: Option<String>,
}

/// User named by `Authorization: Basic`, anonymous otherwise. The password is not checked here.
pub fn identity_from_headers(headers: &HeaderMap) -> Identity {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Basic "))
        .and_then(|encoded| base64::engine::general_purpose::STANDARD.decode(encoded.trim()).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok())
        .map(|credentials| {
            let user = credentials.split_once(':').map_or(credentials.as_str(), |(u, _)| u);
            Identity::new(user)
        })
        .filter(|identity| !identity.user.is_empty())
        .unwrap_or_else(Identity::anonymous)
}

fn strip_git_suffix(repo: &str) -> &str {
    repo.strip_suffix(".git").unwrap_or(repo)
}

fn check_access(
    state: &AppState,
    headers: &HeaderMap,
    handle: &RepoHandle,
    service: ServiceKind,
) -> Result<(), ProtocolError> {
    let identity = identity_from_headers(headers);
    if !state.policy.authorize(&identity, handle, service.action()) {
        debug!(user = %identity, repo = %handle.storage_path, %service, "access denied");
        return Err(ProtocolError::forbidden(&handle.storage_path));
    }
    Ok(())
}

async fn info_refs(
    State(state): State<AppState>,
    Path((domain, repo)): Path<(String, String)>,
    Query(query): Query<ServiceQuery>,
    headers: HeaderMap,
) -> Result<Response, ProtocolError> {
    let handle = state.resolver.resolve(&domain, strip_git_suffix(&repo)).await?;
    let service: ServiceKind = query
        .service
        .as_deref()
        .ok_or_else(|| ProtocolError::invalid_service("missing service parameter"))?
        .parse()?;
    check_access(&state, &headers, &handle, service)?;

    let backend = state.selector.open(&handle).await?;
    let mut session = TransportSession::new(service, backend);
    let mut body = Vec::new();
    session.advertise_refs(&mut body).await?;
    info!(repo = %handle.storage_path, %service, bytes = body.len(), "served info/refs");

    let content_type = service.advertisement_content_type();
    Ok((
        [
            (CONTENT_TYPE, content_type.as_str()),
            (CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

async fn service_rpc(
    State(state): State<AppState>,
    Path((domain, repo, service)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ProtocolError> {
    let service: ServiceKind = service.parse()?;
    let handle = state.resolver.resolve(&domain, strip_git_suffix(&repo)).await?;
    check_access(&state, &headers, &handle, service)?;
    let input = request_reader(&headers, body);
    let backend = state.selector.open(&handle).await?;

    let (tx, rx) = mpsc::channel(state.config.channel_message_size.max(1));
    let abort = tx.clone();
    let repo = handle.storage_path.clone();
    tokio::spawn(async move {
        let mut output = BufWriter::new(BodyWriter::new(tx));
        let mut session = TransportSession::new(service, backend);
        let result = session
            .serve(input, &mut output, &mut tokio::io::sink(), false)
            .await;
        let flushed = output.flush().await;
        drop(output);
        match (result, flushed) {
            (Ok(()), Ok(())) => debug!(%repo, %service, "rpc finished"),
            (Ok(()), Err(e)) => debug!(%repo, %service, error = %e, "client went away"),
            // the client already holds the status report or ERR line
            (Err(e), Ok(())) if session.reported() => {
                warn!(%repo, %service, error = %e, "rpc failed, reported to client");
            }
            (Err(e), _) => {
                warn!(%repo, %service, error = %e, "rpc failed mid-stream");
                let _ = abort.send(Err(io::Error::other(e.to_string()))).await;
            }
        }
    });

    let content_type = service.result_content_type();
    Ok((
        [
            (CONTENT_TYPE, content_type.as_str()),
            (CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response())
}

/// The request body as a byte stream. git gzips large negotiation requests; those are inflated
/// on a blocking task as they arrive.
fn request_reader(headers: &HeaderMap, body: Body) -> Box<dyn AsyncRead + Unpin + Send> {
    let gzip = headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip") || v.eq_ignore_ascii_case("x-gzip"));
    let stream = StreamReader::new(body.into_data_stream().map_err(io::Error::other));
    if gzip {
        Box::new(inflate_stream(stream, MAX_INFLATED_REQUEST))
    } else {
        Box::new(stream)
    }
}

/// Gunzip `compressed` into the returned reader, never holding more than one pipe buffer.
///
/// Output past `limit` bytes, or a corrupt stream, ends the reader early; the session then sees a
/// truncated request.
fn inflate_stream<R>(compressed: R, limit: u64) -> DuplexStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (reader, writer) = tokio::io::duplex(INFLATE_PIPE_SIZE);
    let runtime = Handle::current();
    tokio::task::spawn_blocking(move || {
        let source = SyncIoBridge::new_with_handle(compressed, runtime.clone());
        let mut decoder = flate2::read::GzDecoder::new(source).take(limit + 1);
        let mut sink = SyncIoBridge::new_with_handle(writer, runtime);
        match io::copy(&mut decoder, &mut sink) {
            Ok(n) if n > limit => warn!(limit, "gzip request body too large, truncating"),
            Ok(_) => {
                if let Err(e) = sink.shutdown() {
                    debug!(error = %e, "request pipe closed");
                }
            }
            Err(e) => warn!(error = %e, "invalid gzip request body"),
        }
    });
    reader
}

/// `AsyncWrite` into the response body channel. Each write becomes one body chunk.
struct BodyWriter {
    tx: PollSender<Result<Bytes, io::Error>>,
}

impl BodyWriter {
    fn new(tx: mpsc::Sender<Result<Bytes, io::Error>>) -> Self {
        Self {
            tx: PollSender::new(tx),
        }
    }
}

fn body_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "response body dropped")
}

impl AsyncWrite for BodyWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        ready!(self.tx.poll_reserve(cx)).map_err(|_| body_closed())?;
        self.tx
            .send_item(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| body_closed())?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.tx.close();
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn test_identity_from_basic_auth() {
        let mut headers = HeaderMap::new();
        assert!(identity_from_headers(&headers).is_anonymous());

        let encoded = base64::engine::general_purpose::STANDARD.encode("alice:secret");
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {encoded}")).unwrap(),
        );
        assert_eq!(identity_from_headers(&headers).user, "alice");

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer token"));
        assert!(identity_from_headers(&headers).is_anonymous());
    }

    #[test]
    fn test_error_status_codes() {
        let cases = [
            (ProtocolError::not_found("a/b"), StatusCode::NOT_FOUND),
            (ProtocolError::forbidden("a/b"), StatusCode::FORBIDDEN),
            (ProtocolError::invalid_service("git-frob"), StatusCode::BAD_REQUEST),
            (ProtocolError::backend("disk"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
        assert_eq!(strip_git_suffix("widgets.git"), "widgets");
        assert_eq!(strip_git_suffix("widgets"), "widgets");
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        use std::io::Write;
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test]
    async fn test_inflate_stream_round() {
        use tokio::io::AsyncReadExt;
        let compressed = gzip(b"0032want 0123456789012345678901234567890123456789\n");
        let mut reader = inflate_stream(std::io::Cursor::new(compressed), 1024);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(&out[..], b"0032want 0123456789012345678901234567890123456789\n");
    }

    #[tokio::test]
    async fn test_inflate_stream_stops_at_limit() {
        use tokio::io::AsyncReadExt;
        // a megabyte of zeros compresses to about a kilobyte
        let compressed = gzip(&vec![0u8; 1 << 20]);
        assert!(compressed.len() < 8 << 10);
        let mut reader = inflate_stream(std::io::Cursor::new(compressed), 4096);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert!(out.len() <= 4096 + INFLATE_PIPE_SIZE, "{}", out.len());
        assert!(out.len() < 1 << 20);
    }

    #[tokio::test]
    async fn test_inflate_stream_rejects_garbage() {
        use tokio::io::AsyncReadExt;
        let mut reader = inflate_stream(std::io::Cursor::new(b"not gzip".to_vec()), 1024);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_body_writer_chunks_and_close() {
        let (tx, mut rx) = mpsc::channel(2);
        let mut writer = BodyWriter::new(tx);
        writer.write_all(b"0008NAK\n").await.unwrap();
        let chunk = rx.recv().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"0008NAK\n");

        drop(rx);
        assert_eq!(
            writer.write_all(b"more").await.unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
    }
}
