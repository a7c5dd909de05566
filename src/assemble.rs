//! Asset assembly: turning stored chunks into target files.
//!
//! Full assembly streams every chunk of an asset through the zstd decoder
//! into positional writes at the chunk's file offset. Diff assembly builds
//! the new file in a temporary file next to the target, copying unchanged
//! ranges out of the old file and decompressing only the fetched diff
//! chunks, then renames over the target once every old-file read has
//! completed - the old file is never overwritten while it is still a source.
//!
//! Both paths are blocking and run on the blocking thread pool; each task
//! holds at most one pooled copy buffer.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::manifest::{AssetChunk, AssetProperty};
use crate::progress::ProgressSink;
use crate::store::ChunkStore;

/// Preallocation hint applied when opening an assembly target (32 KiB).
/// Positional writes extend the file past the hint as chunks land.
const PREALLOC_HINT: u64 = 32 * 1024;

// =============================================================================
// Positional I/O
// =============================================================================

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut written = 0usize;
    while written < buf.len() {
        let n = file.seek_write(&buf[written..], offset + written as u64)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "seek_write wrote 0 bytes"));
        }
        written += n;
    }
    Ok(())
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut read = 0usize;
    while read < buf.len() {
        let n = file.seek_read(&mut buf[read..], offset + read as u64)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short read"));
        }
        read += n;
    }
    Ok(())
}

// =============================================================================
// Buffer pool
// =============================================================================

/// Pool of copy buffers shared by assembly and verification tasks.
///
/// Bounds allocations under high concurrency: a task takes one buffer, uses
/// it for the whole asset, and returns it.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            buffer_size,
        }
    }

    pub fn take(&self) -> Vec<u8> {
        if let Ok(mut buffers) = self.buffers.lock() {
            if let Some(buf) = buffers.pop() {
                return buf;
            }
        }
        vec![0u8; self.buffer_size]
    }

    pub fn give(&self, buf: Vec<u8>) {
        if buf.len() == self.buffer_size {
            if let Ok(mut buffers) = self.buffers.lock() {
                buffers.push(buf);
            }
        }
    }
}

// =============================================================================
// Assembler
// =============================================================================

/// Assembles target files from stored chunks.
pub struct Assembler<'a> {
    store: &'a ChunkStore,
    buffers: &'a BufferPool,
}

impl<'a> Assembler<'a> {
    pub fn new(store: &'a ChunkStore, buffers: &'a BufferPool) -> Self {
        Self { store, buffers }
    }

    /// Assemble `asset` from scratch under `game_dir`.
    ///
    /// On return the target file satisfies the layout invariant: every chunk's
    /// decompressed payload sits at its file offset and the ranges tile the
    /// whole file.
    pub fn assemble_full(
        &self,
        game_dir: &Path,
        asset: &AssetProperty,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let target = game_dir.join(&asset.asset_name);
        if asset.is_directory() {
            fs::create_dir_all(&target).map_err(|e| EngineError::create_dir(&target, e))?;
            return Ok(());
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| EngineError::create_dir(parent, e))?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&target)
            .map_err(|e| EngineError::write(&target, e))?;
        file.set_len(asset.asset_size.min(PREALLOC_HINT))
            .map_err(|e| EngineError::write(&target, e))?;

        let mut buffer = self.buffers.take();
        let result = self.write_chunks(&file, &target, asset, &mut buffer, sink, cancel);
        self.buffers.give(buffer);
        result?;

        debug!(asset = %asset.asset_name, size = asset.asset_size, "asset assembled");
        Ok(())
    }

    fn write_chunks(
        &self,
        file: &File,
        target: &Path,
        asset: &AssetProperty,
        buffer: &mut [u8],
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        for chunk in &asset.asset_chunks {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            self.write_one_chunk(file, target, chunk, buffer)?;
            sink.advance(chunk.chunk_size_decompressed, true);
        }
        Ok(())
    }

    /// Decompress one stored chunk into the target at its file offset.
    ///
    /// A chunk that cannot be opened or decoded (a download that failed hash
    /// admission, truncated bytes) is skipped with a warning - its range
    /// stays wrong on disk and the verify pass schedules the asset for
    /// repair. Only target-side write failures are fatal.
    fn write_one_chunk(
        &self,
        file: &File,
        target: &Path,
        chunk: &AssetChunk,
        buffer: &mut [u8],
    ) -> EngineResult<()> {
        let source = match self.store.open_read(&chunk.chunk_name) {
            Ok(source) => source,
            Err(e) => {
                warn!(chunk = %chunk.chunk_name, error = %e, "chunk unreadable, leaving range for repair");
                return Ok(());
            }
        };
        let mut decoder = match zstd::stream::Decoder::new(io::BufReader::new(source)) {
            Ok(decoder) => decoder,
            Err(e) => {
                warn!(chunk = %chunk.chunk_name, error = %e, "chunk not decodable, leaving range for repair");
                return Ok(());
            }
        };

        let mut offset = chunk.chunk_on_file_offset;
        loop {
            match io::Read::read(&mut decoder, buffer) {
                Ok(0) => break,
                Ok(n) => {
                    write_at(file, &buffer[..n], offset).map_err(|e| EngineError::write(target, e))?;
                    offset += n as u64;
                }
                Err(e) => {
                    warn!(chunk = %chunk.chunk_name, error = %e, "chunk decode failed, leaving range for repair");
                    break;
                }
            }
        }

        let written = offset - chunk.chunk_on_file_offset;
        if written != chunk.chunk_size_decompressed {
            warn!(
                chunk = %chunk.chunk_name,
                expected = chunk.chunk_size_decompressed,
                actual = written,
                "decompressed chunk length disagrees with manifest"
            );
        }
        Ok(())
    }

    /// Assemble the new revision of a modified asset from the old file plus
    /// the fetched diff chunks.
    pub fn assemble_diff(
        &self,
        game_dir: &Path,
        old: &AssetProperty,
        new_asset: &AssetProperty,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let target = game_dir.join(&new_asset.asset_name);
        if new_asset.is_directory() {
            fs::create_dir_all(&target).map_err(|e| EngineError::create_dir(&target, e))?;
            return Ok(());
        }
        let parent = target.parent().unwrap_or(game_dir);
        fs::create_dir_all(parent).map_err(|e| EngineError::create_dir(parent, e))?;

        let scratch = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| EngineError::write(parent, e))?;
        scratch
            .as_file()
            .set_len(new_asset.asset_size.min(PREALLOC_HINT))
            .map_err(|e| EngineError::write(scratch.path(), e))?;

        let old_path = game_dir.join(&old.asset_name);
        let mut buffer = self.buffers.take();
        let result = self.patch_into_scratch(
            scratch.as_file(),
            &target,
            &old_path,
            old,
            new_asset,
            &mut buffer,
            sink,
            cancel,
        );
        self.buffers.give(buffer);
        result?;

        // Every old-file read is done; the old revision may now be replaced.
        if target.exists() {
            fs::remove_file(&target).map_err(|e| EngineError::write(&target, e))?;
        }
        scratch
            .persist(&target)
            .map_err(|e| EngineError::write(&target, e.error))?;

        debug!(asset = %new_asset.asset_name, "asset patched");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn patch_into_scratch(
        &self,
        scratch: &File,
        target: &Path,
        old_path: &Path,
        old: &AssetProperty,
        new_asset: &AssetProperty,
        buffer: &mut [u8],
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let old_by_md5: HashMap<String, &AssetChunk> = old
            .asset_chunks
            .iter()
            .map(|c| (c.chunk_decompressed_hash_md5.to_ascii_lowercase(), c))
            .collect();

        // Open the old revision only when some range actually survives. A
        // vanished old file is not fatal: its ranges stay wrong in the
        // scratch output and the verify pass schedules a full repair.
        let reuses_old = new_asset.asset_chunks.iter().any(|c| {
            old_by_md5.contains_key(&c.chunk_decompressed_hash_md5.to_ascii_lowercase())
        });
        let old_file = if reuses_old {
            match File::open(old_path) {
                Ok(file) => Some(file),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(old = %old_path.display(), "old revision missing, ranges left for repair");
                    None
                }
                Err(e) => return Err(EngineError::read(old_path, e)),
            }
        } else {
            None
        };

        for chunk in &new_asset.asset_chunks {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let key = chunk.chunk_decompressed_hash_md5.to_ascii_lowercase();
            match (old_by_md5.get(&key), old_file.as_ref()) {
                (Some(old_chunk), Some(src)) => {
                    // Unchanged content: copy from the old file's old offset
                    // to the new offset.
                    copy_range(
                        src,
                        old_chunk.chunk_on_file_offset,
                        scratch,
                        chunk.chunk_on_file_offset,
                        chunk.chunk_size_decompressed,
                        buffer,
                    )
                    .map_err(|e| EngineError::read(old_path, e))?;
                }
                (Some(_), None) => {}
                (None, _) => self.write_one_chunk(scratch, target, chunk, buffer)?,
            }
            sink.advance(chunk.chunk_size_decompressed, true);
        }
        Ok(())
    }
}

/// Copy `len` bytes from `src@src_offset` to `dst@dst_offset` through `buffer`.
fn copy_range(
    src: &File,
    src_offset: u64,
    dst: &File,
    dst_offset: u64,
    len: u64,
    buffer: &mut [u8],
) -> io::Result<()> {
    let mut copied = 0u64;
    while copied < len {
        let step = buffer.len().min((len - copied) as usize);
        read_exact_at(src, &mut buffer[..step], src_offset + copied)?;
        write_at(dst, &buffer[..step], dst_offset + copied)?;
        copied += step as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash;
    use crate::progress::{NullSink, ProgressCounters};
    use std::io::Cursor;

    /// Compress `content`, store it under its content-addressed name, and
    /// return the chunk record placing it at `offset`.
    fn seed_chunk(
        store: &ChunkStore,
        content: &[u8],
        offset: u64,
        suffix: &str,
    ) -> AssetChunk {
        let cancel = CancellationToken::new();
        let compressed = zstd::stream::encode_all(Cursor::new(content), 0).unwrap();
        let xxh = hash::xxh64_hex_of_reader(&mut Cursor::new(&compressed), &cancel).unwrap();
        let name = format!("{xxh}_{suffix}");
        assert!(store.put(&name, &compressed, &cancel).unwrap());
        AssetChunk {
            chunk_name: name,
            chunk_size: compressed.len() as u64,
            chunk_size_decompressed: content.len() as u64,
            chunk_on_file_offset: offset,
            chunk_decompressed_hash_md5: hash::md5_hex(content),
        }
    }

    fn file_asset(name: &str, chunks: Vec<AssetChunk>, content: &[u8]) -> AssetProperty {
        AssetProperty {
            asset_name: name.to_string(),
            asset_type: 0,
            asset_size: content.len() as u64,
            asset_hash_md5: hash::md5_hex(content),
            asset_chunks: chunks,
        }
    }

    #[test]
    fn test_full_assembly_two_chunks() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path().join("chunks"));
        let game = dir.path().join("game");
        fs::create_dir_all(&game).unwrap();

        let head = b"HEADHEAD";
        let tail = b"tailtailtail";
        let mut whole = Vec::new();
        whole.extend_from_slice(head);
        whole.extend_from_slice(tail);

        // Deliberately listed out of file order; offsets rule.
        let chunks = vec![
            seed_chunk(&store, tail, head.len() as u64, "1"),
            seed_chunk(&store, head, 0, "0"),
        ];
        let asset = file_asset("data/a.bin", chunks, &whole);

        let pool = BufferPool::new(1024);
        let assembler = Assembler::new(&store, &pool);
        let counters = ProgressCounters::new();
        let cancel = CancellationToken::new();
        assembler
            .assemble_full(&game, &asset, &counters, &cancel)
            .unwrap();

        let written = fs::read(game.join("data/a.bin")).unwrap();
        assert_eq!(written, whole);
        assert_eq!(counters.bytes(), whole.len() as u64);
        assert_eq!(counters.finished_units(), 2);
    }

    #[test]
    fn test_full_assembly_directory_asset() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path().join("chunks"));
        let game = dir.path().join("game");

        let asset = AssetProperty {
            asset_name: "Audio/Voice".to_string(),
            asset_type: crate::manifest::DIRECTORY_ASSET_TYPE,
            ..Default::default()
        };

        let pool = BufferPool::new(1024);
        let assembler = Assembler::new(&store, &pool);
        let cancel = CancellationToken::new();
        assembler
            .assemble_full(&game, &asset, &NullSink, &cancel)
            .unwrap();
        assert!(game.join("Audio/Voice").is_dir());
    }

    #[test]
    fn test_diff_assembly_moves_and_fetches() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path().join("chunks"));
        let game = dir.path().join("game");
        fs::create_dir_all(&game).unwrap();

        let part_a = b"AAAAAAAAAA"; // survives, but moves to the back
        let part_b = b"BBBBB"; // replaced
        let part_c = b"CCCCCCC"; // new content, comes from the store

        // Old file layout: [A][B]; write it directly, its chunks were purged
        // long ago so only metadata remains.
        let mut old_content = Vec::new();
        old_content.extend_from_slice(part_a);
        old_content.extend_from_slice(part_b);
        fs::write(game.join("a.bin"), &old_content).unwrap();
        let old = AssetProperty {
            asset_name: "a.bin".to_string(),
            asset_type: 0,
            asset_size: old_content.len() as u64,
            asset_hash_md5: hash::md5_hex(&old_content),
            asset_chunks: vec![
                AssetChunk {
                    chunk_name: "oldA_0".to_string(),
                    chunk_size: 0,
                    chunk_size_decompressed: part_a.len() as u64,
                    chunk_on_file_offset: 0,
                    chunk_decompressed_hash_md5: hash::md5_hex(part_a),
                },
                AssetChunk {
                    chunk_name: "oldB_1".to_string(),
                    chunk_size: 0,
                    chunk_size_decompressed: part_b.len() as u64,
                    chunk_on_file_offset: part_a.len() as u64,
                    chunk_decompressed_hash_md5: hash::md5_hex(part_b),
                },
            ],
        };

        // New layout: [C][A]; only C is in the store.
        let mut new_content = Vec::new();
        new_content.extend_from_slice(part_c);
        new_content.extend_from_slice(part_a);
        let chunk_c = seed_chunk(&store, part_c, 0, "c");
        let moved_a = AssetChunk {
            chunk_name: "reusedA_0".to_string(),
            chunk_size: 0,
            chunk_size_decompressed: part_a.len() as u64,
            chunk_on_file_offset: part_c.len() as u64,
            chunk_decompressed_hash_md5: hash::md5_hex(part_a),
        };
        let new_asset = file_asset("a.bin", vec![chunk_c, moved_a], &new_content);

        let pool = BufferPool::new(4);
        let assembler = Assembler::new(&store, &pool);
        let counters = ProgressCounters::new();
        let cancel = CancellationToken::new();
        assembler
            .assemble_diff(&game, &old, &new_asset, &counters, &cancel)
            .unwrap();

        let written = fs::read(game.join("a.bin")).unwrap();
        assert_eq!(written, new_content);
        assert_eq!(counters.bytes(), new_content.len() as u64);
    }

    #[test]
    fn test_diff_assembly_missing_store_chunk_defers_to_repair() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path().join("chunks"));
        let game = dir.path().join("game");
        fs::create_dir_all(&game).unwrap();
        fs::write(game.join("a.bin"), b"old").unwrap();

        let old = file_asset("a.bin", vec![], b"old");
        let new_asset = AssetProperty {
            asset_name: "a.bin".to_string(),
            asset_type: 0,
            asset_size: 4,
            asset_hash_md5: "00".to_string(),
            asset_chunks: vec![AssetChunk {
                chunk_name: "feedbead_0".to_string(),
                chunk_size: 4,
                chunk_size_decompressed: 4,
                chunk_on_file_offset: 0,
                chunk_decompressed_hash_md5: "11".to_string(),
            }],
        };

        let pool = BufferPool::new(1024);
        let assembler = Assembler::new(&store, &pool);
        let cancel = CancellationToken::new();
        // The missing chunk is not fatal: the range stays zeroed and the
        // verify pass flags the asset for a full repair.
        assembler
            .assemble_diff(&game, &old, &new_asset, &NullSink, &cancel)
            .unwrap();
        assert_eq!(fs::read(game.join("a.bin")).unwrap(), vec![0u8; 4]);
    }

    #[test]
    fn test_buffer_pool_reuse() {
        let pool = BufferPool::new(128);
        let buf = pool.take();
        assert_eq!(buf.len(), 128);
        pool.give(buf);
        let again = pool.take();
        assert_eq!(again.len(), 128);
        // Foreign-sized buffers are dropped, not pooled.
        pool.give(vec![0u8; 64]);
        assert_eq!(pool.take().len(), 128);
    }

    #[test]
    fn test_cancelled_assembly_stops() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path().join("chunks"));
        let game = dir.path().join("game");
        fs::create_dir_all(&game).unwrap();

        let content = b"payload";
        let chunk = seed_chunk(&store, content, 0, "0");
        let asset = file_asset("a.bin", vec![chunk], content);

        let pool = BufferPool::new(1024);
        let assembler = Assembler::new(&store, &pool);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = assembler.assemble_full(&game, &asset, &NullSink, &cancel);
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }
}
