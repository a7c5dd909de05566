//! Operation lifecycle: one pipeline at a time, start/cancel semantics.
//!
//! The engine runs at most one operation per instance. Starting a new
//! operation cancels any running one and waits for it to drain before the
//! replacement begins. Cancellation is cooperative: the shared token is
//! observed at every await point and in every blocking loop, the pipeline
//! unwinds as `Cancelled`, and the chunk store is left intact so a later
//! operation resumes without refetching verified chunks.
//!
//! State machine: Idle -> Running -> (Completed | Cancelled | Failed), and
//! any terminal state admits the next `start_operation`, which installs a
//! fresh cancellation token and completion signal.

pub mod context;
mod pipeline;

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::progress::ProgressSink;
use crate::remote::RemoteSource;

use pipeline::{Pipeline, PipelineOutcome};

pub use context::{OperationContext, OperationKind, PredownloadStatus};

/// Lifecycle state of the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

struct Lifecycle {
    state: OperationState,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

/// The package engine: installs, verifies, updates and pre-downloads one
/// game distribution.
pub struct PackageEngine {
    remote: Arc<dyn RemoteSource>,
    sink: Arc<dyn ProgressSink>,
    config: EngineConfig,
    lifecycle: Mutex<Lifecycle>,
}

impl PackageEngine {
    pub fn new(
        remote: Arc<dyn RemoteSource>,
        sink: Arc<dyn ProgressSink>,
        config: EngineConfig,
    ) -> Self {
        // A pre-completed signal so waiting on a never-started engine
        // returns immediately.
        let (done_tx, done_rx) = watch::channel(true);
        drop(done_tx);
        Self {
            remote,
            sink,
            config,
            lifecycle: Mutex::new(Lifecycle {
                state: OperationState::Idle,
                cancel: CancellationToken::new(),
                done: done_rx,
            }),
        }
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> OperationState {
        self.lifecycle.lock().await.state
    }

    /// Run the operation described by `ctx`.
    ///
    /// Any operation already in flight is cancelled and drained first.
    /// Returns `Ok(true)` when the pipeline completed (including controlled
    /// precondition stops, which push their explanation through the progress
    /// sink), `Ok(false)` when the operation was cancelled, and `Err(_)` on
    /// a fatal fault.
    pub async fn start_operation(&self, ctx: OperationContext) -> EngineResult<bool> {
        let (cancel, done_tx) = self.claim_slot().await;

        info!(kind = ?ctx.kind, game_dir = %ctx.game_directory.display(), "operation starting");
        let pipeline = Pipeline::new(
            Arc::clone(&self.remote),
            Arc::clone(&self.sink),
            self.config.clone(),
            ctx,
            cancel,
        );
        let outcome = pipeline.run().await;

        let (state, result) = match outcome {
            Ok(PipelineOutcome::Completed) => {
                info!("operation completed");
                (OperationState::Completed, Ok(true))
            }
            Ok(PipelineOutcome::Stopped) => {
                info!("operation stopped by precondition");
                (OperationState::Completed, Ok(true))
            }
            Err(e) if e.is_cancelled() => {
                info!("operation cancelled; chunk store retained");
                (OperationState::Cancelled, Ok(false))
            }
            Err(e) => {
                warn!(error = %e, "operation failed");
                (OperationState::Failed, Err(e))
            }
        };

        self.lifecycle.lock().await.state = state;
        let _ = done_tx.send(true);
        result
    }

    /// Request cancellation of the running operation and wait for it to
    /// drain. No-op when nothing is running.
    pub async fn cancel_operation(&self) {
        let mut done = {
            let lifecycle = self.lifecycle.lock().await;
            if lifecycle.state != OperationState::Running {
                return;
            }
            lifecycle.cancel.cancel();
            lifecycle.done.clone()
        };
        wait_done(&mut done).await;
    }

    /// Cancel and drain whatever operation is in flight, then mark the
    /// engine Running with a fresh token and completion signal.
    async fn claim_slot(&self) -> (CancellationToken, watch::Sender<bool>) {
        loop {
            let mut done = {
                let mut lifecycle = self.lifecycle.lock().await;
                // A Running state whose completion sender is gone belongs to
                // an operation that died without reporting; reclaim it.
                let running =
                    lifecycle.state == OperationState::Running && lifecycle.done.has_changed().is_ok();
                if !running {
                    let cancel = CancellationToken::new();
                    let (done_tx, done_rx) = watch::channel(false);
                    lifecycle.state = OperationState::Running;
                    lifecycle.cancel = cancel.clone();
                    lifecycle.done = done_rx;
                    return (cancel, done_tx);
                }
                lifecycle.cancel.cancel();
                lifecycle.done.clone()
            };
            wait_done(&mut done).await;
        }
    }
}

async fn wait_done(done: &mut watch::Receiver<bool>) {
    while !*done.borrow_and_update() {
        if done.changed().await.is_err() {
            break;
        }
    }
}
