//! Buffered inflate reader that decodes Git's zlib-compressed objects while simultaneously tracking
//! the object id for integrity verification.

use std::{io, io::BufRead};

use flate2::{Decompress, FlushDecompress, Status};
use sha1::{Digest, Sha1};

use crate::{hash::ObjectHash, internal::object::types::ObjectType};

/// ReadBoxed unzips a DEFLATE stream from a [`BufRead`] without consuming any byte past the end
/// of the stream, so consecutive pack entries can be read from the same source.
pub struct ReadBoxed<R> {
    pub inner: R,
    pub decompressor: Box<Decompress>,
    /// Running object id over `"<type> <size>\0"` and the inflated bytes. `None` for delta payloads.
    hash: Option<Sha1>,
}

impl<R> ReadBoxed<R>
where
    R: BufRead,
{
    /// Reader for a base object whose id is computed while inflating.
    pub fn new(inner: R, obj_type: ObjectType, size: usize) -> Self {
        let mut hash = Sha1::new();
        hash.update(obj_type.loose_header(size));
        ReadBoxed {
            inner,
            hash: Some(hash),
            decompressor: Box::new(Decompress::new(true)),
        }
    }

    /// Reader for delta instructions, which have no id of their own.
    pub fn new_for_delta(inner: R) -> Self {
        ReadBoxed {
            inner,
            hash: None,
            decompressor: Box::new(Decompress::new(true)),
        }
    }

    /// Id of the object inflated so far; only meaningful once the stream is exhausted.
    pub fn object_hash(&self) -> Option<ObjectHash> {
        let digest = self.hash.as_ref()?.clone().finalize();
        ObjectHash::from_bytes(digest.as_ref()).ok()
    }

    /// Compressed bytes consumed from `inner`.
    pub fn total_in(&self) -> u64 {
        self.decompressor.total_in()
    }
}

impl<R> io::Read for ReadBoxed<R>
where
    R: BufRead,
{
    fn read(&mut self, into: &mut [u8]) -> io::Result<usize> {
        let o = read(&mut self.inner, &mut self.decompressor, into)?;
        if let Some(hash) = self.hash.as_mut() {
            hash.update(&into[..o]);
        }
        Ok(o)
    }
}

/// Read bytes from `rd` and decompress them using `state` into `dst`, returning the amount of bytes written.
fn read(rd: &mut impl BufRead, state: &mut Decompress, mut dst: &mut [u8]) -> io::Result<usize> {
    let mut total_written = 0;
    loop {
        let (written, consumed, ret, eof);
        {
            let input = rd.fill_buf()?;
            eof = input.is_empty();
            let before_out = state.total_out();
            let before_in = state.total_in();
            let flush = if eof {
                FlushDecompress::Finish
            } else {
                FlushDecompress::None
            };
            ret = state.decompress(input, dst, flush);
            written = (state.total_out() - before_out) as usize;
            total_written += written;
            dst = &mut dst[written..];
            consumed = (state.total_in() - before_in) as usize;
        }
        rd.consume(consumed);

        match ret {
            Ok(Status::StreamEnd) => return Ok(total_written),
            Ok(Status::Ok | Status::BufError) if eof || dst.is_empty() => return Ok(total_written),
            Ok(Status::Ok | Status::BufError) if consumed != 0 || written != 0 => continue,
            Ok(Status::Ok | Status::BufError) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "deflate stream made no progress",
                ));
            }
            Err(..) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "corrupt deflate stream",
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Read, Write};

    use flate2::{Compression, write::ZlibEncoder};

    use super::*;

    fn zlib_compress(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn inflate_object_counts_hash() {
        let body = b"hello\n";
        let compressed = zlib_compress(body);
        let mut reader = ReadBoxed::new(io::Cursor::new(compressed), ObjectType::Blob, body.len());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, body);
        assert_eq!(
            reader.object_hash(),
            Some(ObjectHash::from_type_and_data(ObjectType::Blob, body))
        );
    }

    /// The reader must stop at the end of the deflate stream and leave trailing bytes alone.
    #[test]
    fn inflate_stops_at_stream_end() {
        let mut data = zlib_compress(b"delta bytes");
        let compressed_len = data.len();
        data.extend_from_slice(b"NEXT");
        let mut cursor = io::Cursor::new(data);
        let mut out = Vec::new();
        {
            let mut reader = ReadBoxed::new_for_delta(&mut cursor);
            reader.read_to_end(&mut out).unwrap();
            assert!(reader.object_hash().is_none());
            assert_eq!(reader.total_in(), compressed_len as u64);
        }
        assert_eq!(out, b"delta bytes");
        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"NEXT");
    }

    #[test]
    fn corrupt_stream_returns_error() {
        let data = b"not a valid zlib stream";
        let mut reader = ReadBoxed::new(io::Cursor::new(data), ObjectType::Blob, data.len());
        let mut out = [0u8; 16];
        let err = reader.read(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
