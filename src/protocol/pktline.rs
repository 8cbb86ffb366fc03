//! pkt-line framing.
//!
//! Every line carries a four character lowercase hex length that counts the header itself, so
//! `0006a\n` holds the two bytes `a\n`. The length `0000` is the flush packet that ends a section.
//! Lengths 1 to 3 cannot be produced by a conforming peer and are rejected, as is any payload over
//! [`MAX_PKT_PAYLOAD`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::types::ProtocolError;

pub const PKT_LINE_END_MARKER: &[u8; 4] = b"0000";

/// Largest payload a single pkt-line may carry (65520 minus the header).
pub const MAX_PKT_PAYLOAD: usize = 65516;

const HEADER_LEN: usize = 4;

/// One decoded pkt-line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    Flush,
    Data(Bytes),
}

impl PktLine {
    /// Payload of a data line with a single trailing LF removed.
    pub fn text(&self) -> Option<&[u8]> {
        match self {
            PktLine::Flush => None,
            PktLine::Data(data) => Some(data.strip_suffix(b"\n").unwrap_or(data)),
        }
    }

    pub fn is_flush(&self) -> bool {
        matches!(self, PktLine::Flush)
    }
}

/// Append a data line.
pub fn add_pkt_line(stream: &mut BytesMut, data: &[u8]) -> Result<(), ProtocolError> {
    if data.len() > MAX_PKT_PAYLOAD {
        return Err(ProtocolError::decode(format!(
            "pkt-line payload of {} bytes exceeds {MAX_PKT_PAYLOAD}",
            data.len()
        )));
    }
    stream.reserve(HEADER_LEN + data.len());
    stream.put(format!("{:04x}", data.len() + HEADER_LEN).as_bytes());
    stream.put(data);
    Ok(())
}

pub fn add_pkt_line_string(stream: &mut BytesMut, line: &str) -> Result<(), ProtocolError> {
    add_pkt_line(stream, line.as_bytes())
}

pub fn add_flush(stream: &mut BytesMut) {
    stream.put(&PKT_LINE_END_MARKER[..]);
}

/// Parse a pkt-line header into the payload length, `None` meaning flush.
pub fn parse_header(header: &[u8; HEADER_LEN]) -> Result<Option<usize>, ProtocolError> {
    let mut length = 0usize;
    for &c in header {
        let digit = match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'f' => c - b'a' + 10,
            b'A'..=b'F' => c - b'A' + 10,
            _ => {
                return Err(ProtocolError::decode(format!(
                    "invalid pkt-line header {:?}",
                    String::from_utf8_lossy(header)
                )));
            }
        };
        length = (length << 4) | digit as usize;
    }
    match length {
        0 => Ok(None),
        1..=3 => Err(ProtocolError::decode(format!("invalid pkt-line length {length}"))),
        n if n - HEADER_LEN > MAX_PKT_PAYLOAD => Err(ProtocolError::decode(format!(
            "pkt-line length {n} exceeds the maximum"
        ))),
        n => Ok(Some(n - HEADER_LEN)),
    }
}

/// Take one complete pkt-line off the front of `bytes`.
///
/// Returns `Ok(None)` without consuming anything when the buffer holds only part of a line.
pub fn read_pkt_line(bytes: &mut Bytes) -> Result<Option<PktLine>, ProtocolError> {
    if bytes.len() < HEADER_LEN {
        return Ok(None);
    }
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&bytes[..HEADER_LEN]);
    match parse_header(&header)? {
        None => {
            bytes.advance(HEADER_LEN);
            Ok(Some(PktLine::Flush))
        }
        Some(len) if bytes.len() < HEADER_LEN + len => Ok(None),
        Some(len) => {
            bytes.advance(HEADER_LEN);
            Ok(Some(PktLine::Data(bytes.split_to(len))))
        }
    }
}

/// Decode a buffer that must consist of whole pkt-lines only.
pub fn read_all_pkt_lines(mut bytes: Bytes) -> Result<Vec<PktLine>, ProtocolError> {
    let mut lines = Vec::new();
    while !bytes.is_empty() {
        match read_pkt_line(&mut bytes)? {
            Some(line) => lines.push(line),
            None => return Err(ProtocolError::decode("truncated pkt-line")),
        }
    }
    Ok(lines)
}

/// Frame `data` as one pkt-line and write it.
pub async fn write_pkt_line<W>(writer: &mut W, data: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BytesMut::new();
    add_pkt_line(&mut buf, data)?;
    writer.write_all(&buf).await?;
    Ok(())
}

/// Reads pkt-lines from a byte stream without reading past the last line returned, so the
/// remainder of the stream (a pack, typically) can be taken back with [`Self::into_inner`].
pub struct PktLineReader<R> {
    inner: R,
}

impl<R> PktLineReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Next line, or `None` when the stream ends cleanly between lines.
    pub async fn read_line(&mut self) -> Result<Option<PktLine>, ProtocolError> {
        let mut header = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            let n = self.inner.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(ProtocolError::decode("truncated pkt-line header"));
            }
            filled += n;
        }

        match parse_header(&header)? {
            None => Ok(Some(PktLine::Flush)),
            Some(len) => {
                let mut data = vec![0u8; len];
                self.inner.read_exact(&mut data).await.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        ProtocolError::decode("truncated pkt-line payload")
                    } else {
                        ProtocolError::Io(e)
                    }
                })?;
                Ok(Some(PktLine::Data(Bytes::from(data))))
            }
        }
    }

    /// Next line, treating end of stream as a protocol error.
    pub async fn expect_line(&mut self) -> Result<PktLine, ProtocolError> {
        self.read_line()
            .await?
            .ok_or_else(|| ProtocolError::decode("unexpected end of stream"))
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}
