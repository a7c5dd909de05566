//! Progress aggregation and reporting.
//!
//! Worker tasks report `(bytes, finished)` events from many threads at once;
//! the aggregator folds them into atomic counters and a dedicated reporter
//! thread marshals snapshots to a single observer callback. The reporter is
//! the only consumer-facing hop - it is never a synchronization point for
//! engine state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

// =============================================================================
// Sink trait
// =============================================================================

/// Receiver for progress events emitted by engine workers.
///
/// Implementations must be safe to call concurrently from many tasks.
pub trait ProgressSink: Send + Sync {
    /// Report `bytes` of completed work; `finished` marks the end of one
    /// unit (a chunk downloaded, assembled or verified).
    fn advance(&self, bytes: u64, finished: bool);

    /// Push a user-visible status line ("verifying", "repairing", ...).
    fn status(&self, text: &str);
}

/// Sink that drops every event. Used where a pipeline stage must not
/// contribute to the visible totals.
#[derive(Debug, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn advance(&self, _bytes: u64, _finished: bool) {}
    fn status(&self, _text: &str) {}
}

// =============================================================================
// Aggregating counters
// =============================================================================

/// Thread-safe aggregator of progress events.
#[derive(Debug, Default)]
pub struct ProgressCounters {
    bytes: AtomicU64,
    finished_units: AtomicU64,
    last_status: Mutex<String>,
}

impl ProgressCounters {
    /// Create a zeroed aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes reported so far.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    /// Number of finished units reported so far.
    pub fn finished_units(&self) -> u64 {
        self.finished_units.load(Ordering::SeqCst)
    }

    /// The most recent status line, if any.
    pub fn last_status(&self) -> String {
        self.last_status.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Reset all counters, e.g. between pipeline stages.
    pub fn reset(&self) {
        self.bytes.store(0, Ordering::SeqCst);
        self.finished_units.store(0, Ordering::SeqCst);
    }
}

impl ProgressSink for ProgressCounters {
    fn advance(&self, bytes: u64, finished: bool) {
        if bytes > 0 {
            self.bytes.fetch_add(bytes, Ordering::SeqCst);
        }
        if finished {
            self.finished_units.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn status(&self, text: &str) {
        if let Ok(mut s) = self.last_status.lock() {
            *s = text.to_string();
        }
    }
}

// =============================================================================
// Speed tracking
// =============================================================================

/// Smoothed throughput tracker using an exponential moving average.
///
/// Workers add raw byte counts; a periodic `update()` turns the delta since
/// the previous update into an instantaneous rate and folds it into the EMA
/// so the displayed speed does not flutter.
#[derive(Debug)]
pub struct SpeedTracker {
    total_bytes: AtomicU64,
    last_bytes: AtomicU64,
    last_update: Mutex<Instant>,
    ema_speed: AtomicU64,
}

impl SpeedTracker {
    const EMA_ALPHA: f64 = 0.5;
    const MIN_UPDATE_MS: u128 = 150;

    pub fn new() -> Self {
        Self {
            total_bytes: AtomicU64::new(0),
            last_bytes: AtomicU64::new(0),
            last_update: Mutex::new(Instant::now()),
            ema_speed: AtomicU64::new(0),
        }
    }

    /// Record bytes moved by a worker.
    pub fn add_bytes(&self, bytes: u64) {
        self.total_bytes.fetch_add(bytes, Ordering::SeqCst);
    }

    /// Total bytes recorded since creation.
    pub fn total(&self) -> u64 {
        self.total_bytes.load(Ordering::SeqCst)
    }

    /// Recompute the smoothed rate. Call periodically; returns bytes/second.
    pub fn update(&self) -> u64 {
        let now = Instant::now();
        let mut last_update = match self.last_update.lock() {
            Ok(guard) => guard,
            Err(_) => return self.ema_speed.load(Ordering::SeqCst),
        };
        let elapsed = now.duration_since(*last_update);
        if elapsed.as_millis() < Self::MIN_UPDATE_MS {
            return self.ema_speed.load(Ordering::SeqCst);
        }

        let current = self.total_bytes.load(Ordering::SeqCst);
        let previous = self.last_bytes.swap(current, Ordering::SeqCst);
        let delta = current.saturating_sub(previous);

        let instant_speed = if elapsed.as_secs_f64() > 0.0 {
            (delta as f64 / elapsed.as_secs_f64()) as u64
        } else {
            0
        };

        let prev_ema = self.ema_speed.load(Ordering::SeqCst);
        let new_ema = if prev_ema == 0 {
            instant_speed
        } else {
            ((Self::EMA_ALPHA * instant_speed as f64) + ((1.0 - Self::EMA_ALPHA) * prev_ema as f64))
                as u64
        };

        self.ema_speed.store(new_ema, Ordering::SeqCst);
        *last_update = now;
        new_ema
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Reporter
// =============================================================================

/// Point-in-time copy of the aggregated progress.
#[derive(Clone, Debug, Default)]
pub struct ProgressSnapshot {
    pub bytes: u64,
    pub finished_units: u64,
    pub status: String,
    /// EMA-smoothed throughput since the previous snapshot.
    pub bytes_per_second: u64,
}

/// Callback invoked with aggregated progress snapshots.
pub type ProgressCallback = Box<dyn Fn(ProgressSnapshot) + Send + Sync>;

/// Background reporter that periodically polls a [`ProgressCounters`] and
/// forwards snapshots to a single observer.
pub struct ProgressReporter {
    handle: Option<JoinHandle<()>>,
    done: Arc<AtomicBool>,
}

impl ProgressReporter {
    /// Start polling `counters` every `poll_interval`.
    pub fn start(
        counters: Arc<ProgressCounters>,
        callback: ProgressCallback,
        poll_interval: Duration,
    ) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let done_flag = Arc::clone(&done);

        let handle = thread::spawn(move || {
            let speed = SpeedTracker::new();
            let mut last_bytes = 0u64;
            let mut snapshot = |counters: &ProgressCounters| {
                let bytes = counters.bytes();
                speed.add_bytes(bytes.saturating_sub(last_bytes));
                last_bytes = bytes;
                ProgressSnapshot {
                    bytes,
                    finished_units: counters.finished_units(),
                    status: counters.last_status(),
                    bytes_per_second: speed.update(),
                }
            };
            while !done_flag.load(Ordering::SeqCst) {
                callback(snapshot(&counters));
                thread::sleep(poll_interval);
            }
            // Final report so the observer always sees the end state.
            callback(snapshot(&counters));
        });

        Self {
            handle: Some(handle),
            done,
        }
    }

    /// Stop the reporter and wait for the final report.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.done.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// Formatting
// =============================================================================

/// Human-readable byte count for user-visible status strings.
pub fn prettify_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_advance() {
        let counters = ProgressCounters::new();
        counters.advance(500, false);
        counters.advance(300, true);
        assert_eq!(counters.bytes(), 800);
        assert_eq!(counters.finished_units(), 1);
    }

    #[test]
    fn test_counters_reset() {
        let counters = ProgressCounters::new();
        counters.advance(100, true);
        counters.reset();
        assert_eq!(counters.bytes(), 0);
        assert_eq!(counters.finished_units(), 0);
    }

    #[test]
    fn test_counters_status() {
        let counters = ProgressCounters::new();
        counters.status("verifying");
        assert_eq!(counters.last_status(), "verifying");
    }

    #[test]
    fn test_speed_tracker_accumulates() {
        let tracker = SpeedTracker::new();
        tracker.add_bytes(1000);
        tracker.add_bytes(24);
        assert_eq!(tracker.total(), 1024);
    }

    #[test]
    fn test_reporter_lifecycle() {
        use std::sync::atomic::AtomicUsize;

        let counters = Arc::new(ProgressCounters::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        let reporter = ProgressReporter::start(
            Arc::clone(&counters),
            Box::new(move |_snapshot| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_millis(10),
        );

        thread::sleep(Duration::from_millis(50));
        reporter.stop();

        assert!(calls.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_prettify_bytes() {
        assert_eq!(prettify_bytes(512), "512 B");
        assert_eq!(prettify_bytes(2048), "2.00 KiB");
        assert_eq!(prettify_bytes(5 * 1024 * 1024), "5.00 MiB");
    }
}
