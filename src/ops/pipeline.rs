//! The four operation pipelines.
//!
//! A pipeline runs its stages strictly in order; within a stage, assets fan
//! out over a bounded task pool and each asset's chunks fan out with the
//! same degree. Every task shares one cooperative cancellation token. Chunk
//! downloads are single-shot: anything that slips through bad lands in the
//! conflict set of the verify stage, and repair is one more bounded pass of
//! the same download-and-assemble machinery.

use std::fs;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::assemble::{Assembler, BufferPool};
use crate::config::EngineConfig;
use crate::diff::{all_assets, diff_builds, BuildDiff, ModifiedAsset, RemoteAsset};
use crate::error::{EngineError, EngineResult};
use crate::manifest::{chunk_url, decode_build, AssetChunk, AssetProperty, Build, DecodedBuild};
use crate::ops::context::{OperationContext, OperationKind, PredownloadStatus};
use crate::progress::{prettify_bytes, ProgressSink};
use crate::remote::RemoteSource;
use crate::store::ChunkStore;
use crate::verify;

/// How a pipeline ended when it did not fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PipelineOutcome {
    /// Every stage ran to the end.
    Completed,
    /// A precondition stopped the pipeline; a user-visible status was
    /// already pushed through the sink.
    Stopped,
}

/// One operation in flight. Cheap to clone; per-task state is shared.
#[derive(Clone)]
pub(crate) struct Pipeline {
    remote: Arc<dyn RemoteSource>,
    sink: Arc<dyn ProgressSink>,
    config: EngineConfig,
    ctx: Arc<OperationContext>,
    store: ChunkStore,
    buffers: Arc<BufferPool>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub(crate) fn new(
        remote: Arc<dyn RemoteSource>,
        sink: Arc<dyn ProgressSink>,
        config: EngineConfig,
        ctx: OperationContext,
        cancel: CancellationToken,
    ) -> Self {
        let store = ChunkStore::new(&ctx.chunks_directory);
        let buffers = Arc::new(BufferPool::new(config.copy_buffer_size));
        Self {
            remote,
            sink,
            config,
            ctx: Arc::new(ctx),
            store,
            buffers,
            cancel,
        }
    }

    pub(crate) async fn run(self) -> EngineResult<PipelineOutcome> {
        match self.ctx.kind {
            OperationKind::Install => self.run_install().await,
            OperationKind::Verify => self.run_verify().await,
            OperationKind::Update => self.run_update().await,
            OperationKind::Predownload => self.run_predownload().await,
        }
    }

    // =========================================================================
    // Pipelines
    // =========================================================================

    async fn run_install(&self) -> EngineResult<PipelineOutcome> {
        let decoded = match self.decode_branch(&self.ctx.remote_branch).await {
            Ok(decoded) => decoded,
            Err(e) => return self.stop_for(e),
        };

        if !self.admit(decoded.total_uncompressed_bytes)? {
            return Ok(PipelineOutcome::Stopped);
        }

        let assets = all_assets(&decoded);
        info!(assets = assets.len(), "install: downloading and assembling");
        self.sink.status("downloading");
        self.run_parallel(assets.clone(), |p, asset| async move {
            p.install_asset(asset).await
        })
        .await?;

        self.verify_and_repair(assets).await?;
        self.purge_store().await?;
        Ok(PipelineOutcome::Completed)
    }

    async fn run_verify(&self) -> EngineResult<PipelineOutcome> {
        let local = match self.local_branch() {
            Some(build) => build.clone(),
            None => {
                self.sink.status("no local build to verify");
                return Ok(PipelineOutcome::Stopped);
            }
        };
        let decoded = match self.decode_branch(&local).await {
            Ok(decoded) => decoded,
            Err(e) => return self.stop_for(e),
        };

        let assets = all_assets(&decoded);
        self.sink.status("verifying");
        let conflicts = self.verify_assets(assets).await?;
        if conflicts.is_empty() {
            // Clean verify leaves the chunk store untouched.
            info!("verify: no conflicts");
            return Ok(PipelineOutcome::Completed);
        }

        info!(conflicts = conflicts.len(), "verify: repairing");
        self.sink.status("repairing");
        self.run_parallel(conflicts.clone(), |p, asset| async move {
            p.install_asset(asset).await
        })
        .await?;
        self.report_unrepaired(conflicts).await?;
        self.purge_store().await?;
        Ok(PipelineOutcome::Completed)
    }

    async fn run_update(&self) -> EngineResult<PipelineOutcome> {
        let local = match self.local_branch() {
            Some(build) => build.clone(),
            None => {
                self.sink.status("no local build to update from");
                return Ok(PipelineOutcome::Stopped);
            }
        };
        let (local_decoded, remote_decoded) = match self.decode_both(&local).await {
            Ok(pair) => pair,
            Err(e) => return self.stop_for(e),
        };

        let diff = diff_builds(&local_decoded, &remote_decoded);
        info!(
            added = diff.added.len(),
            modified = diff.modified.len(),
            deleted = diff.deleted.len(),
            "update: diff computed"
        );
        if !self.admit(diff.bytes_needed())? {
            return Ok(PipelineOutcome::Stopped);
        }

        self.sink.status("downloading");
        self.run_parallel(diff.added.clone(), |p, asset| async move {
            p.install_asset(asset).await
        })
        .await?;
        self.run_parallel(diff.modified.clone(), |p, modified| async move {
            p.update_modified_asset(modified).await
        })
        .await?;
        self.remove_deleted(diff.deleted.clone()).await?;

        let assets = all_assets(&remote_decoded);
        self.verify_and_repair(assets).await?;
        self.purge_store().await?;
        Ok(PipelineOutcome::Completed)
    }

    async fn run_predownload(&self) -> EngineResult<PipelineOutcome> {
        let local = match self.local_branch() {
            Some(build) => build.clone(),
            None => {
                self.sink.status("no local build to predownload against");
                return Ok(PipelineOutcome::Stopped);
            }
        };
        let (local_decoded, remote_decoded) = match self.decode_both(&local).await {
            Ok(pair) => pair,
            Err(e) => return self.stop_for(e),
        };

        let diff = diff_builds(&local_decoded, &remote_decoded);
        if !self.admit(diff.bytes_needed())? {
            return Ok(PipelineOutcome::Stopped);
        }

        let mut status = PredownloadStatus {
            tag: remote_decoded.tag.clone(),
            finished: false,
            total_blocks: diff.total_blocks(),
        };
        status.write_to(&self.ctx.predownload_status_path).await?;

        info!(blocks = status.total_blocks, "predownload: staging chunks");
        self.sink.status("downloading");
        self.predownload_chunks(&diff).await?;

        status.finished = true;
        status.write_to(&self.ctx.predownload_status_path).await?;
        Ok(PipelineOutcome::Completed)
    }

    // =========================================================================
    // Per-asset work items
    // =========================================================================

    /// Download every chunk of an asset, then assemble it from scratch.
    /// Used by install, by added assets of an update, and by repair.
    async fn install_asset(&self, asset: RemoteAsset) -> EngineResult<()> {
        self.download_chunks(
            &asset.chunk_url_prefix,
            asset.property.asset_chunks.clone(),
            false,
        )
        .await?;
        self.assemble_full_blocking(asset.property).await
    }

    /// Download only the diff chunks of a modified asset, then rebuild it
    /// from the old file plus those chunks.
    async fn update_modified_asset(&self, modified: ModifiedAsset) -> EngineResult<()> {
        self.download_chunks(
            &modified.asset.chunk_url_prefix,
            modified.asset.diff_chunks.clone(),
            false,
        )
        .await?;
        self.assemble_diff_blocking(modified.old, modified.asset.property)
            .await
    }

    /// Fetch chunks for every added asset and the diff chunks of every
    /// modified asset; no assembly.
    async fn predownload_chunks(&self, diff: &BuildDiff) -> EngineResult<()> {
        self.run_parallel(diff.added.clone(), |p, asset: RemoteAsset| async move {
            p.download_chunks(
                &asset.chunk_url_prefix,
                asset.property.asset_chunks.clone(),
                true,
            )
            .await
        })
        .await?;
        self.run_parallel(
            diff.modified.clone(),
            |p, modified: ModifiedAsset| async move {
                p.download_chunks(
                    &modified.asset.chunk_url_prefix,
                    modified.asset.diff_chunks.clone(),
                    true,
                )
                .await
            },
        )
        .await
    }

    // =========================================================================
    // Chunk downloads
    // =========================================================================

    /// Fetch `chunks` into the store, skipping any whose stored blob already
    /// hashes correctly. `report` routes per-chunk progress to the sink
    /// (predownload has no assembly stage to account for it otherwise).
    async fn download_chunks(
        &self,
        url_prefix: &str,
        chunks: Vec<AssetChunk>,
        report: bool,
    ) -> EngineResult<()> {
        futures::stream::iter(chunks.into_iter().map(|chunk| {
            let prefix = url_prefix.to_string();
            async move { self.download_chunk(&prefix, chunk, report).await }
        }))
        .buffer_unordered(self.config.concurrency)
        .collect::<Vec<EngineResult<()>>>()
        .await
        .into_iter()
        .collect::<EngineResult<Vec<()>>>()?;
        Ok(())
    }

    async fn download_chunk(
        &self,
        url_prefix: &str,
        chunk: AssetChunk,
        report: bool,
    ) -> EngineResult<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let already_valid = {
            let store = self.store.clone();
            let name = chunk.chunk_name.clone();
            let cancel = self.cancel.clone();
            task::spawn_blocking(move || store.has_valid(&name, &cancel))
                .await
                .map_err(|e| EngineError::Task(e.to_string()))??
        };

        if already_valid {
            debug!(chunk = %chunk.chunk_name, "chunk already staged, skipping fetch");
        } else {
            let url = chunk_url(url_prefix, &chunk.chunk_name);
            let body = tokio::select! {
                _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                body = self.remote.fetch(&url) => body?,
            };

            let store = self.store.clone();
            let name = chunk.chunk_name.clone();
            let cancel = self.cancel.clone();
            let admitted = task::spawn_blocking(move || store.put(&name, &body, &cancel))
                .await
                .map_err(|e| EngineError::Task(e.to_string()))??;
            if !admitted {
                // No in-loop retry: the verify pass owns recovery.
                warn!(chunk = %chunk.chunk_name, "downloaded chunk failed admission");
            }
        }

        if report {
            self.sink.advance(chunk.chunk_size, true);
        }
        Ok(())
    }

    // =========================================================================
    // Blocking file work
    // =========================================================================

    async fn assemble_full_blocking(&self, property: AssetProperty) -> EngineResult<()> {
        let store = self.store.clone();
        let buffers = Arc::clone(&self.buffers);
        let game_dir = self.ctx.game_directory.clone();
        let sink = Arc::clone(&self.sink);
        let cancel = self.cancel.clone();
        task::spawn_blocking(move || {
            Assembler::new(&store, &buffers).assemble_full(
                &game_dir,
                &property,
                sink.as_ref(),
                &cancel,
            )
        })
        .await
        .map_err(|e| EngineError::Task(e.to_string()))?
    }

    async fn assemble_diff_blocking(
        &self,
        old: AssetProperty,
        new_asset: AssetProperty,
    ) -> EngineResult<()> {
        let store = self.store.clone();
        let buffers = Arc::clone(&self.buffers);
        let game_dir = self.ctx.game_directory.clone();
        let sink = Arc::clone(&self.sink);
        let cancel = self.cancel.clone();
        task::spawn_blocking(move || {
            Assembler::new(&store, &buffers).assemble_diff(
                &game_dir,
                &old,
                &new_asset,
                sink.as_ref(),
                &cancel,
            )
        })
        .await
        .map_err(|e| EngineError::Task(e.to_string()))?
    }

    async fn verify_asset_blocking(&self, property: AssetProperty) -> EngineResult<bool> {
        let buffers = Arc::clone(&self.buffers);
        let game_dir = self.ctx.game_directory.clone();
        let sink = Arc::clone(&self.sink);
        let cancel = self.cancel.clone();
        task::spawn_blocking(move || {
            verify::verify_asset(&game_dir, &property, &buffers, sink.as_ref(), &cancel)
        })
        .await
        .map_err(|e| EngineError::Task(e.to_string()))?
    }

    async fn remove_deleted(&self, deleted: Vec<AssetProperty>) -> EngineResult<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if deleted.is_empty() {
            return Ok(());
        }
        let game_dir = self.ctx.game_directory.clone();
        task::spawn_blocking(move || {
            for asset in &deleted {
                let path = game_dir.join(&asset.asset_name);
                let removed = if asset.is_directory() {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                };
                match removed {
                    Ok(()) => debug!(asset = %asset.asset_name, "deleted"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(EngineError::write(path, e)),
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Task(e.to_string()))?
    }

    async fn purge_store(&self) -> EngineResult<()> {
        // A cancellation landing between stages must never cost the staged
        // chunks; resumption depends on them.
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let store = self.store.clone();
        task::spawn_blocking(move || store.purge_all())
            .await
            .map_err(|e| EngineError::Task(e.to_string()))?
    }

    // =========================================================================
    // Verify / repair
    // =========================================================================

    /// Verify `assets`; returns those that failed, in no particular order.
    async fn verify_assets(&self, assets: Vec<RemoteAsset>) -> EngineResult<Vec<RemoteAsset>> {
        let conflicts: Arc<Mutex<Vec<RemoteAsset>>> = Arc::new(Mutex::new(Vec::new()));
        let collector = Arc::clone(&conflicts);
        self.run_parallel(assets, move |p, asset: RemoteAsset| {
            let collector = Arc::clone(&collector);
            async move {
                let ok = p.verify_asset_blocking(asset.property.clone()).await?;
                if !ok {
                    if let Ok(mut list) = collector.lock() {
                        list.push(asset);
                    }
                }
                Ok(())
            }
        })
        .await?;

        let conflicts = match Arc::try_unwrap(conflicts) {
            Ok(mutex) => mutex.into_inner().unwrap_or_default(),
            Err(shared) => shared.lock().map(|list| list.clone()).unwrap_or_default(),
        };
        Ok(conflicts)
    }

    /// Verify stage followed by one bounded repair pass.
    async fn verify_and_repair(&self, assets: Vec<RemoteAsset>) -> EngineResult<()> {
        self.sink.status("verifying");
        let conflicts = self.verify_assets(assets).await?;
        if conflicts.is_empty() {
            return Ok(());
        }

        info!(conflicts = conflicts.len(), "repairing conflicting assets");
        self.sink.status("repairing");
        self.run_parallel(conflicts.clone(), |p, asset| async move {
            p.install_asset(asset).await
        })
        .await?;
        self.report_unrepaired(conflicts).await
    }

    /// Re-verify repaired assets; anything still broken is logged, not
    /// retried again - repair is a single bounded pass.
    async fn report_unrepaired(&self, repaired: Vec<RemoteAsset>) -> EngineResult<()> {
        let still_bad = self.verify_assets(repaired).await?;
        for asset in &still_bad {
            warn!(asset = %asset.property.asset_name, "asset still fails verification after repair");
        }
        Ok(())
    }

    // =========================================================================
    // Shared stage machinery
    // =========================================================================

    /// Run `work` over `items` with bounded parallelism. The first
    /// non-cancellation error wins; remaining tasks are cancelled and
    /// drained.
    async fn run_parallel<T, F, Fut>(&self, items: Vec<T>, work: F) -> EngineResult<()>
    where
        T: Send + 'static,
        F: Fn(Pipeline, T) -> Fut,
        Fut: std::future::Future<Output = EngineResult<()>> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut tasks = JoinSet::new();
        let mut first_error: Option<EngineError> = None;

        for item in items {
            if self.cancel.is_cancelled() {
                record_error(&mut first_error, EngineError::Cancelled);
                break;
            }
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let future = work(self.clone(), item);
            let cancel = self.cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = future.await;
                if let Err(e) = &result {
                    if !e.is_cancelled() {
                        // A fatal fault stops sibling scheduling promptly.
                        cancel.cancel();
                    }
                }
                result
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => record_error(&mut first_error, e),
                Err(join_error) => {
                    self.cancel.cancel();
                    record_error(&mut first_error, EngineError::Task(join_error.to_string()));
                }
            }
        }

        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    // =========================================================================
    // Preconditions
    // =========================================================================

    fn local_branch(&self) -> Option<&Build> {
        self.ctx.local_branch.as_ref()
    }

    async fn decode_branch(&self, build: &Build) -> EngineResult<DecodedBuild> {
        decode_build(self.remote.as_ref(), build, &self.ctx.audio, &self.cancel).await
    }

    async fn decode_both(&self, local: &Build) -> EngineResult<(DecodedBuild, DecodedBuild)> {
        let local_decoded = self.decode_branch(local).await?;
        let remote_decoded = self.decode_branch(&self.ctx.remote_branch).await?;
        Ok((local_decoded, remote_decoded))
    }

    /// Check the target volume can hold `needed` more bytes. On shortfall a
    /// user-visible status is pushed and `false` returned.
    fn admit(&self, needed: u64) -> EngineResult<bool> {
        fs::create_dir_all(&self.ctx.game_directory)
            .map_err(|e| EngineError::create_dir(&self.ctx.game_directory, e))?;
        let free = fs2::available_space(&self.ctx.game_directory)
            .map_err(|e| EngineError::read(&self.ctx.game_directory, e))?;
        if free < needed {
            let message = format!(
                "insufficient disk space: need {}, free {}",
                prettify_bytes(needed),
                prettify_bytes(free)
            );
            warn!(needed, free, "disk space admission failed");
            self.sink.status(&message);
            return Ok(false);
        }
        Ok(true)
    }

    /// Turn a manifest-stage failure into a controlled stop where the error
    /// taxonomy says so; everything else stays fatal.
    fn stop_for(&self, error: EngineError) -> EngineResult<PipelineOutcome> {
        let message = match &error {
            EngineError::ManifestChecksum { id, .. } => {
                Some(format!("manifest {id} failed checksum verification"))
            }
            EngineError::RemoteStatus { url, status } => {
                Some(format!("manifest fetch failed: HTTP {status} for {url}"))
            }
            _ => None,
        };
        match message {
            Some(message) => {
                warn!(%error, "operation stopped by precondition");
                self.sink.status(&message);
                Ok(PipelineOutcome::Stopped)
            }
            None => Err(error),
        }
    }
}

/// Keep the most meaningful error: the first fatal one, or cancellation
/// when nothing worse happened.
fn record_error(slot: &mut Option<EngineError>, error: EngineError) {
    let replace = match slot.as_ref() {
        None => true,
        Some(EngineError::Cancelled) => !error.is_cancelled(),
        Some(_) => false,
    };
    if replace {
        *slot = Some(error);
    }
}
