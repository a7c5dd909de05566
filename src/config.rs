//! Engine tuning configuration.

use std::thread;
use std::time::Duration;

/// Size of the pooled copy buffer used by assembly and verification (80 KiB).
pub const COPY_BUFFER_SIZE: usize = 80 * 1024;

/// Default poll interval for progress reporting.
pub const DEFAULT_PROGRESS_POLL: Duration = Duration::from_millis(100);

/// Tuning knobs for [`crate::PackageEngine`].
///
/// The defaults match the production deployment: one worker per hardware
/// thread at both the asset and the chunk level, and an 80 KiB pooled copy
/// buffer per in-flight task.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Degree of parallelism for asset-level and chunk-level fan-out.
    pub concurrency: usize,

    /// Size of each pooled copy buffer in bytes.
    pub copy_buffer_size: usize,

    /// Poll interval used by the progress reporter.
    pub progress_poll: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            copy_buffer_size: COPY_BUFFER_SIZE,
            progress_poll: DEFAULT_PROGRESS_POLL,
        }
    }
}

impl EngineConfig {
    /// Set the fan-out degree (minimum 1).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the pooled copy buffer size.
    pub fn with_copy_buffer_size(mut self, size: usize) -> Self {
        self.copy_buffer_size = size.max(4096);
        self
    }
}
