//! Operation inputs and persisted predownload state.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::manifest::{AudioSelection, Build};

/// Which pipeline an operation runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Install,
    Verify,
    Update,
    Predownload,
}

/// Everything an operation needs: paths, branch descriptors and the audio
/// language selection.
#[derive(Clone, Debug)]
pub struct OperationContext {
    pub kind: OperationKind,

    /// Root of the installed game tree.
    pub game_directory: PathBuf,

    /// Scratch directory for downloaded chunks; created lazily, removed
    /// after a successful end state of assembling operations.
    pub chunks_directory: PathBuf,

    /// Where the predownload status JSON lives.
    pub predownload_status_path: PathBuf,

    /// The currently installed build, when one exists.
    pub local_branch: Option<Build>,

    /// The build being installed, verified against or updated to.
    pub remote_branch: Build,

    pub audio: AudioSelection,
}

/// Persisted marker telling the launcher a predownload has been staged.
///
/// Written with `finished: false` before the first chunk is fetched and
/// rewritten with `finished: true` once every block is in the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredownloadStatus {
    #[serde(rename = "Tag")]
    pub tag: String,
    #[serde(rename = "Finished")]
    pub finished: bool,
    #[serde(rename = "TotalBlocks")]
    pub total_blocks: u64,
}

impl PredownloadStatus {
    /// Serialize to `path`, creating parent directories as needed.
    pub async fn write_to(&self, path: &Path) -> EngineResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::create_dir(parent, e))?;
        }
        let body = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, body)
            .await
            .map_err(|e| EngineError::write(path, e))
    }

    /// Read a previously written status file.
    pub async fn read_from(path: &Path) -> EngineResult<Self> {
        let body = tokio::fs::read(path)
            .await
            .map_err(|e| EngineError::read(path, e))?;
        Ok(serde_json::from_slice(&body)?)
    }
}
