//! Asset verification against the manifest.
//!
//! Each asset is streamed chunk range by chunk range: read
//! `chunk_size_decompressed` bytes at `chunk_on_file_offset`, MD5 the slice,
//! compare to the manifest. The first mismatch condemns the asset - the
//! remaining chunks are skipped but still reported as finished units so the
//! observer's totals stay consistent. The verifier is the single authority
//! on correctness; repair is a second pass of the normal pipeline over the
//! conflict set.

use std::fs::{self, File};
use std::io;
use std::path::Path;

use md5::{Digest, Md5};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::assemble::BufferPool;
use crate::error::{EngineError, EngineResult};
use crate::manifest::{AssetChunk, AssetProperty};
use crate::progress::ProgressSink;

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

/// Verify one asset under `game_dir`.
///
/// Returns `Ok(true)` when every chunk range matches, `Ok(false)` when the
/// asset belongs in the conflict set. Directory assets are materialized and
/// always pass.
pub fn verify_asset(
    game_dir: &Path,
    asset: &AssetProperty,
    buffers: &BufferPool,
    sink: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> EngineResult<bool> {
    let path = game_dir.join(&asset.asset_name);

    if asset.is_directory() {
        fs::create_dir_all(&path).map_err(|e| EngineError::create_dir(&path, e))?;
        return Ok(true);
    }

    let file = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(asset = %asset.asset_name, "asset missing on disk");
            for _ in &asset.asset_chunks {
                sink.advance(0, true);
            }
            return Ok(false);
        }
        Err(e) => return Err(EngineError::read(path, e)),
    };

    let mut buffer = buffers.take();
    let result = verify_chunks(&file, &path, asset, &mut buffer, sink, cancel);
    buffers.give(buffer);
    result
}

fn verify_chunks(
    file: &File,
    path: &Path,
    asset: &AssetProperty,
    buffer: &mut [u8],
    sink: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> EngineResult<bool> {
    for (index, chunk) in asset.asset_chunks.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if !chunk_range_matches(file, path, chunk, buffer)? {
            warn!(
                asset = %asset.asset_name,
                chunk = %chunk.chunk_name,
                "chunk range failed verification"
            );
            // Skip the rest of the asset but keep the unit count moving.
            for _ in index..asset.asset_chunks.len() {
                sink.advance(0, true);
            }
            return Ok(false);
        }
        sink.advance(chunk.chunk_size_decompressed, true);
    }
    Ok(true)
}

/// MD5 the on-disk byte range of `chunk` and compare it to the manifest.
fn chunk_range_matches(
    file: &File,
    path: &Path,
    chunk: &AssetChunk,
    buffer: &mut [u8],
) -> EngineResult<bool> {
    let mut hasher = Md5::new();
    let mut remaining = chunk.chunk_size_decompressed;
    let mut offset = chunk.chunk_on_file_offset;

    while remaining > 0 {
        let step = buffer.len().min(remaining as usize);
        let read = match read_at(file, &mut buffer[..step], offset) {
            Ok(read) => read,
            Err(e) => return Err(EngineError::read(path, e)),
        };
        if read == 0 {
            // File is shorter than the manifest says: range mismatch.
            return Ok(false);
        }
        hasher.update(&buffer[..read]);
        remaining -= read as u64;
        offset += read as u64;
    }

    let actual = format!("{:x}", hasher.finalize());
    Ok(actual.eq_ignore_ascii_case(&chunk.chunk_decompressed_hash_md5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash;
    use crate::manifest::DIRECTORY_ASSET_TYPE;
    use crate::progress::ProgressCounters;

    fn chunk_at(content: &[u8], offset: u64, name: &str) -> AssetChunk {
        AssetChunk {
            chunk_name: name.to_string(),
            chunk_size: content.len() as u64 / 2,
            chunk_size_decompressed: content.len() as u64,
            chunk_on_file_offset: offset,
            chunk_decompressed_hash_md5: hash::md5_hex(content),
        }
    }

    fn two_chunk_asset(head: &[u8], tail: &[u8]) -> AssetProperty {
        let mut whole = head.to_vec();
        whole.extend_from_slice(tail);
        AssetProperty {
            asset_name: "a.bin".to_string(),
            asset_type: 0,
            asset_size: whole.len() as u64,
            asset_hash_md5: hash::md5_hex(&whole),
            asset_chunks: vec![
                chunk_at(head, 0, "c0_0"),
                chunk_at(tail, head.len() as u64, "c1_1"),
            ],
        }
    }

    #[test]
    fn test_verify_clean_asset() {
        let dir = tempfile::TempDir::new().unwrap();
        let head = b"HEADHEAD";
        let tail = b"tailtail";
        let asset = two_chunk_asset(head, tail);

        let mut whole = head.to_vec();
        whole.extend_from_slice(tail);
        fs::write(dir.path().join("a.bin"), &whole).unwrap();

        let buffers = BufferPool::new(4);
        let counters = ProgressCounters::new();
        let cancel = CancellationToken::new();
        let ok = verify_asset(dir.path(), &asset, &buffers, &counters, &cancel).unwrap();

        assert!(ok);
        assert_eq!(counters.bytes(), whole.len() as u64);
        assert_eq!(counters.finished_units(), 2);
    }

    #[test]
    fn test_verify_corrupted_tail() {
        let dir = tempfile::TempDir::new().unwrap();
        let head = b"HEADHEAD";
        let tail = b"tailtail";
        let asset = two_chunk_asset(head, tail);

        let mut corrupted = head.to_vec();
        corrupted.extend_from_slice(b"tailtaiX");
        fs::write(dir.path().join("a.bin"), &corrupted).unwrap();

        let buffers = BufferPool::new(1024);
        let counters = ProgressCounters::new();
        let cancel = CancellationToken::new();
        let ok = verify_asset(dir.path(), &asset, &buffers, &counters, &cancel).unwrap();

        assert!(!ok);
        // First chunk counted with bytes, bad one and beyond as bare units.
        assert_eq!(counters.bytes(), head.len() as u64);
        assert_eq!(counters.finished_units(), 2);
    }

    #[test]
    fn test_verify_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let asset = two_chunk_asset(b"aaaa", b"bbbb");

        let buffers = BufferPool::new(1024);
        let counters = ProgressCounters::new();
        let cancel = CancellationToken::new();
        let ok = verify_asset(dir.path(), &asset, &buffers, &counters, &cancel).unwrap();

        assert!(!ok);
        assert_eq!(counters.bytes(), 0);
        assert_eq!(counters.finished_units(), 2);
    }

    #[test]
    fn test_verify_truncated_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let head = b"HEADHEAD";
        let tail = b"tailtail";
        let asset = two_chunk_asset(head, tail);

        fs::write(dir.path().join("a.bin"), head).unwrap();

        let buffers = BufferPool::new(1024);
        let counters = ProgressCounters::new();
        let cancel = CancellationToken::new();
        let ok = verify_asset(dir.path(), &asset, &buffers, &counters, &cancel).unwrap();

        assert!(!ok);
        assert_eq!(counters.finished_units(), 2);
    }

    #[test]
    fn test_verify_directory_asset_materializes() {
        let dir = tempfile::TempDir::new().unwrap();
        let asset = AssetProperty {
            asset_name: "Audio/Voice".to_string(),
            asset_type: DIRECTORY_ASSET_TYPE,
            ..Default::default()
        };

        let buffers = BufferPool::new(1024);
        let counters = ProgressCounters::new();
        let cancel = CancellationToken::new();
        let ok = verify_asset(dir.path(), &asset, &buffers, &counters, &cancel).unwrap();

        assert!(ok);
        assert!(dir.path().join("Audio/Voice").is_dir());
        assert_eq!(counters.finished_units(), 0);
    }

    #[test]
    fn test_verify_cancelled() {
        let dir = tempfile::TempDir::new().unwrap();
        let asset = two_chunk_asset(b"aaaa", b"bbbb");
        fs::write(dir.path().join("a.bin"), b"aaaabbbb").unwrap();

        let buffers = BufferPool::new(1024);
        let counters = ProgressCounters::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = verify_asset(dir.path(), &asset, &buffers, &counters, &cancel);
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }
}
