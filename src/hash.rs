//! Hashing primitives used for chunk and asset identity.
//!
//! The wire format pins two digests: MD5 for decompressed content (chunk
//! ranges and whole assets) and XXH64 for compressed chunk blobs, where the
//! hash doubles as the leading token of the chunk's file name. All helpers
//! emit lowercase hex and observe the cooperative cancellation token between
//! buffer fills so multi-gigabyte files never pin a worker.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use md5::{Digest, Md5};
use tokio_util::sync::CancellationToken;
use xxhash_rust::xxh64::Xxh64;

use crate::error::{EngineError, EngineResult};

/// Buffer size for reading streams during hash calculation (64 KiB).
const BUFFER_SIZE: usize = 64 * 1024;

/// MD5 of an in-memory buffer as lowercase hex.
pub fn md5_hex(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// MD5 of everything remaining in `reader`, as lowercase hex.
pub fn md5_hex_of_reader<R: Read>(
    reader: &mut R,
    cancel: &CancellationToken,
) -> EngineResult<String> {
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// XXH64 (seed 0) of everything remaining in `reader`, as lowercase hex.
pub fn xxh64_hex_of_reader<R: Read>(
    reader: &mut R,
    cancel: &CancellationToken,
) -> EngineResult<String> {
    let mut hasher = Xxh64::new(0);
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:016x}", hasher.digest()))
}

/// XXH64 (seed 0) of a file's contents, as lowercase hex.
pub fn xxh64_hex_of_file(path: &Path, cancel: &CancellationToken) -> EngineResult<String> {
    let mut file = File::open(path).map_err(|e| EngineError::read(path, e))?;
    xxh64_hex_of_reader(&mut file, cancel)
}

/// Case-insensitive comparison for hex digests coming off the wire.
pub fn hex_eq(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}
