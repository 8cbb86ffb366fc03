//! zlib helpers: streaming inflate for pack entries and whole-buffer helpers for loose objects.

pub mod stream;

use std::io::{self, Write};

use flate2::{Compression, write::ZlibEncoder};

/// Compress a whole buffer at the default level.
pub fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}
