//! Decoder for Git-style delta instructions that rebuilds target objects from a base buffer and the
//! instruction stream (base size + result size + op codes).

use std::io::{ErrorKind, Read};

use super::{errors::GitDeltaError, utils};

const COPY_INSTRUCTION_FLAG: u8 = 1 << 7; // msb set => copy from base, otherwise inline data
const COPY_OFFSET_BYTES: u8 = 4;
const COPY_SIZE_BYTES: u8 = 3;
const COPY_ZERO_SIZE: usize = 0x10000;
const MAX_PREALLOC: usize = 1 << 20;

/// Apply a delta stream to `base_info`, returning the reconstructed target bytes.
/// - leading base size, then result size (varint)
/// - sequence of ops: data instructions (msb=0, lower 7 bits = literal length) or copy instructions
///   (msb=1, following bytes encode offset/size).
pub fn delta_decode(
    mut stream: &mut impl Read,
    base_info: &[u8],
) -> Result<Vec<u8>, GitDeltaError> {
    let base_size = utils::read_size_encoding(&mut stream)?;
    if base_info.len() != base_size {
        return Err(GitDeltaError::DeltaDecoderError(format!(
            "base object len {} is not equal to declared {base_size}",
            base_info.len()
        )));
    }

    let result_size = utils::read_size_encoding(&mut stream)?;
    let mut buffer = Vec::with_capacity(result_size.min(MAX_PREALLOC));
    loop {
        let instruction = match utils::read_bytes(stream) {
            Ok([instruction]) => instruction,
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        };

        if instruction & COPY_INSTRUCTION_FLAG == 0 {
            // git disallows zero-length inserts
            if instruction == 0 {
                return Err(GitDeltaError::DeltaDecoderError(
                    "Invalid data instruction".to_string(),
                ));
            }
            let mut data = vec![0; instruction as usize];
            stream.read_exact(&mut data)?;
            buffer.extend_from_slice(&data);
        } else {
            let mut nonzero_bytes = instruction;
            let offset =
                utils::read_partial_int(&mut stream, COPY_OFFSET_BYTES, &mut nonzero_bytes)?;
            let mut size =
                utils::read_partial_int(&mut stream, COPY_SIZE_BYTES, &mut nonzero_bytes)?;
            if size == 0 {
                size = COPY_ZERO_SIZE;
            }
            let data = offset
                .checked_add(size)
                .and_then(|end| base_info.get(offset..end))
                .ok_or_else(|| {
                    GitDeltaError::DeltaDecoderError(format!(
                        "copy {offset}+{size} outside base of {base_size} bytes"
                    ))
                })?;
            buffer.extend_from_slice(data);
        }
        if buffer.len() > result_size {
            return Err(GitDeltaError::DeltaDecoderError(format!(
                "delta output exceeds declared {result_size} bytes"
            )));
        }
    }

    if buffer.len() != result_size {
        return Err(GitDeltaError::DeltaDecoderError(format!(
            "rebuilt {} bytes, delta declared {result_size}",
            buffer.len()
        )));
    }
    Ok(buffer)
}
