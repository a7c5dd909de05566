//! Zstd stream decoding helpers.
//!
//! Manifests and chunks travel zstd-compressed. Manifests are small enough to
//! decode into memory; chunk payloads stream through a caller-provided buffer
//! so decompression never holds more than one copy buffer per task.

use std::io::{Read, Write};

use crate::error::EngineResult;

/// Decompress everything in `reader` into a fresh buffer.
pub fn decode_to_vec<R: Read>(reader: R) -> EngineResult<Vec<u8>> {
    let bytes = zstd::stream::decode_all(reader)?;
    Ok(bytes)
}

/// Stream-decompress `reader` into `writer` through `buffer`.
///
/// Returns the number of decompressed bytes written.
pub fn copy_decoded<R: Read, W: Write>(
    reader: R,
    writer: &mut W,
    buffer: &mut [u8],
) -> EngineResult<u64> {
    let mut decoder = zstd::stream::Decoder::new(reader)?;
    let mut written = 0u64;
    loop {
        let n = decoder.read(buffer)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n])?;
        written += n as u64;
    }
    Ok(written)
}
