//! Shared I/O utilities: exact reads and a reader that tracks how many bytes were consumed and
//! their SHA-1, which is what pack decoding needs to locate entries and verify the trailer.

use std::{
    io,
    io::{BufRead, Read},
};

use sha1::{Digest, Sha1};

use crate::hash::ObjectHash;

pub fn read_bytes(file: &mut impl Read, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_sha(file: &mut impl Read) -> io::Result<ObjectHash> {
    ObjectHash::from_stream(file)
}

/// A lightweight wrapper that counts and hashes bytes read from the underlying reader.
pub struct CountingReader<R> {
    pub inner: R,
    pub bytes_read: u64,
    hash: Sha1,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            bytes_read: 0,
            hash: Sha1::new(),
        }
    }

    /// SHA-1 of everything consumed so far.
    pub fn current_hash(&self) -> ObjectHash {
        let digest = self.hash.clone().finalize();
        // a SHA-1 digest is always 20 bytes
        ObjectHash::from_bytes(digest.as_ref()).unwrap_or_default()
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hash.update(&buf[..n]);
        self.bytes_read += n as u64;
        Ok(n)
    }
}

impl<R: BufRead> BufRead for CountingReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        // the buffer is already filled, so this does not touch the underlying reader
        if let Ok(buf) = self.inner.fill_buf() {
            self.hash.update(&buf[..amt.min(buf.len())]);
        }
        self.bytes_read += amt as u64;
        self.inner.consume(amt);
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Cursor, Read};

    use super::CountingReader;
    use crate::hash::ObjectHash;

    #[test]
    fn test_counts_and_hashes_both_read_paths() {
        let data = b"0123456789abcdef".to_vec();
        let mut reader = CountingReader::new(BufReader::with_capacity(4, Cursor::new(data.clone())));

        let mut head = [0u8; 3];
        reader.read_exact(&mut head).unwrap();
        let buf = reader.fill_buf().unwrap();
        let n = buf.len().min(2);
        reader.consume(n);
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();

        assert_eq!(reader.bytes_read, data.len() as u64);
        assert_eq!(reader.current_hash(), ObjectHash::new(&data));
    }
}
