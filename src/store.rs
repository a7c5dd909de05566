//! On-disk chunk store.
//!
//! A flat scratch directory holding downloaded compressed chunks, one file
//! per chunk named exactly after the chunk. Identity is content-addressed:
//! the token of the name before the first `_` is the XXH64 hex of the blob,
//! so a chunk that survives a cancelled run can be trusted again on resume
//! without refetching. The store is safe for concurrent puts on distinct
//! names; the orchestrator never schedules the same chunk twice.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{EngineError, EngineResult};
use crate::hash;

/// Flat directory of downloaded chunk files keyed by chunk name.
#[derive(Clone, Debug)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    /// Create a store rooted at `root`. The directory is created lazily on
    /// the first `put`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path a chunk with this name occupies (whether or not it exists).
    pub fn path(&self, chunk_name: &str) -> PathBuf {
        self.root.join(chunk_name)
    }

    pub fn exists(&self, chunk_name: &str) -> bool {
        self.path(chunk_name).is_file()
    }

    /// Store a downloaded blob under `chunk_name`, then verify it against
    /// the XXH64 token of the name.
    ///
    /// Returns `true` when the stored blob hashes correctly. On mismatch the
    /// file is retained and `false` is returned; downstream consumers treat
    /// the chunk as invalid and the verify/repair pass recovers it.
    pub fn put(
        &self,
        chunk_name: &str,
        bytes: &[u8],
        cancel: &CancellationToken,
    ) -> EngineResult<bool> {
        fs::create_dir_all(&self.root).map_err(|e| EngineError::create_dir(&self.root, e))?;

        let path = self.path(chunk_name);
        let mut file = File::create(&path).map_err(|e| EngineError::write(&path, e))?;
        file.write_all(bytes).map_err(|e| EngineError::write(&path, e))?;
        file.flush().map_err(|e| EngineError::write(&path, e))?;
        drop(file);

        let actual = hash::xxh64_hex_of_file(&path, cancel)?;
        let expected = expected_xxh64(chunk_name);
        let ok = hash::hex_eq(&actual, expected);
        if !ok {
            warn!(chunk = chunk_name, %actual, %expected, "stored chunk failed hash admission");
        }
        Ok(ok)
    }

    /// Whether a previously stored chunk exists and still hashes correctly.
    /// Drives resume and predownload reuse: valid chunks are never refetched.
    pub fn has_valid(&self, chunk_name: &str, cancel: &CancellationToken) -> EngineResult<bool> {
        let path = self.path(chunk_name);
        if !path.is_file() {
            return Ok(false);
        }
        match hash::xxh64_hex_of_file(&path, cancel) {
            Ok(actual) => Ok(hash::hex_eq(&actual, expected_xxh64(chunk_name))),
            Err(EngineError::Cancelled) => Err(EngineError::Cancelled),
            Err(_) => Ok(false),
        }
    }

    /// Open a stored chunk for reading.
    pub fn open_read(&self, chunk_name: &str) -> EngineResult<File> {
        let path = self.path(chunk_name);
        File::open(&path).map_err(|e| EngineError::read(path, e))
    }

    /// Remove the whole store directory. Missing directory is not an error.
    pub fn purge_all(&self) -> EngineResult<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::write(&self.root, e)),
        }
    }
}

/// XXH64 hex a chunk with this name must hash to.
fn expected_xxh64(chunk_name: &str) -> &str {
    chunk_name.split('_').next().unwrap_or(chunk_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Name a blob the way the CDN does: XXH64 of the bytes plus a suffix.
    pub fn chunk_name_for(bytes: &[u8], suffix: &str) -> String {
        let cancel = CancellationToken::new();
        let hex = hash::xxh64_hex_of_reader(&mut Cursor::new(bytes), &cancel).unwrap();
        format!("{hex}_{suffix}")
    }

    #[test]
    fn test_put_and_read_valid_chunk() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path().join("chunks"));
        let cancel = CancellationToken::new();

        let blob = b"compressed chunk payload".to_vec();
        let name = chunk_name_for(&blob, "0001");

        assert!(store.put(&name, &blob, &cancel).unwrap());
        assert!(store.exists(&name));
        assert!(store.has_valid(&name, &cancel).unwrap());

        let mut reread = Vec::new();
        std::io::Read::read_to_end(&mut store.open_read(&name).unwrap(), &mut reread).unwrap();
        assert_eq!(reread, blob);
    }

    #[test]
    fn test_put_mismatch_retains_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path().join("chunks"));
        let cancel = CancellationToken::new();

        let verified = store
            .put("0000000000000000_bad", b"whatever bytes", &cancel)
            .unwrap();
        assert!(!verified);
        // File stays on disk but is reported invalid.
        assert!(store.exists("0000000000000000_bad"));
        assert!(!store.has_valid("0000000000000000_bad", &cancel).unwrap());
    }

    #[test]
    fn test_has_valid_missing_chunk() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path().join("chunks"));
        let cancel = CancellationToken::new();
        assert!(!store.has_valid("cafebabe_1", &cancel).unwrap());
    }

    #[test]
    fn test_purge_all() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path().join("chunks"));
        let cancel = CancellationToken::new();

        let blob = b"x".to_vec();
        let name = chunk_name_for(&blob, "1");
        store.put(&name, &blob, &cancel).unwrap();

        store.purge_all().unwrap();
        assert!(!store.root().exists());

        // Purging an already-missing store is fine.
        store.purge_all().unwrap();
    }
}
