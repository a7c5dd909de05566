//! chunkmill - content-addressed game package engine.
//!
//! This library reconciles an on-disk game installation with a remote build
//! description composed of hundreds of thousands of compressed chunks. It
//! downloads and decodes build manifests, computes the difference between two
//! builds, fetches only the chunks that changed, assembles target files from
//! decompressed chunk ranges, and verifies every file byte-for-byte against
//! the manifest. A self-repair pass re-fetches and re-assembles anything that
//! fails verification.
//!
//! The entry point is [`PackageEngine`], which runs one operation at a time
//! (install, verify, update or predownload) under cooperative cancellation:
//!
//! ```ignore
//! use chunkmill::{EngineConfig, HttpRemoteSource, PackageEngine, ProgressCounters};
//! use std::sync::Arc;
//!
//! let remote = Arc::new(HttpRemoteSource::new()?);
//! let sink = Arc::new(ProgressCounters::new());
//! let engine = PackageEngine::new(remote, sink, EngineConfig::default());
//!
//! let finished = engine.start_operation(context).await?;
//! ```

pub mod assemble;
pub mod codec;
pub mod config;
pub mod diff;
pub mod error;
pub mod hash;
pub mod manifest;
pub mod ops;
pub mod progress;
pub mod remote;
pub mod store;
pub mod verify;

pub use config::EngineConfig;
pub use diff::{diff_builds, BuildDiff, ModifiedAsset, RemoteAsset};
pub use error::{EngineError, EngineResult};
pub use manifest::{
    decode_build, AudioSelection, Build, DecodedBuild, DecodedManifest, ManifestStub, MatchingField,
};
pub use ops::{OperationContext, OperationKind, OperationState, PackageEngine, PredownloadStatus};
pub use progress::{ProgressCounters, ProgressReporter, ProgressSink};
pub use remote::{HttpRemoteSource, RemoteSource};
pub use store::ChunkStore;
