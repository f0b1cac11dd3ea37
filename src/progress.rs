//! Progress reporting and cancellation support.
//!
//! This module provides [`ProgressCallback`] for monitoring a detection run,
//! [`CancellationToken`] for cooperative cancellation, and [`ProgressInfo`] for
//! progress snapshots.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use unscale::{
//!     DetectionOptions, Detector, MediaSource, ProgressCallback, ProgressInfo,
//!     StepRange, TesterRegistry, UnscaleError,
//! };
//!
//! struct PrintProgress;
//!
//! impl ProgressCallback for PrintProgress {
//!     fn on_progress(&self, info: &ProgressInfo) {
//!         if let Some(pct) = info.percentage {
//!             println!("{pct:.1}% complete");
//!         }
//!     }
//! }
//!
//! let options = DetectionOptions::new().with_progress(Arc::new(PrintProgress));
//! let detector = Detector::new(
//!     Arc::new(MediaSource::new("input.mkv")),
//!     Arc::new(TesterRegistry::with_defaults()),
//!     options,
//! )?;
//! let frames = StepRange::new(0, 240, 24)?.values();
//! let heights: Vec<u32> = (700..=1000).step_by(2).collect();
//! let report = detector.run(&frames, &heights, |_| {})?;
//! # Ok::<(), UnscaleError>(())
//! ```

use std::{
    sync::{
        Arc, Condvar, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

/// A snapshot of detection progress.
///
/// Delivered to [`ProgressCallback::on_progress`] at a cadence controlled
/// by [`DetectionOptions::with_batch_size`](crate::DetectionOptions::with_batch_size)
/// and [`DetectionOptions::with_report_interval`](crate::DetectionOptions::with_report_interval).
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// How many results have been delivered so far.
    pub current: u64,
    /// Total work items expected, if known ahead of time.
    pub total: Option<u64>,
    /// Completion percentage (0.0 to 100.0), if `total` is known.
    pub percentage: Option<f32>,
    /// Wall-clock time elapsed since the run started.
    pub elapsed: Duration,
    /// Estimated time remaining, based on current throughput.
    pub estimated_remaining: Option<Duration>,
    /// Tester of the most recently delivered result.
    pub last_tester: Option<String>,
    /// Candidate height of the most recently delivered result.
    pub last_height: Option<u32>,
}

/// Trait for receiving progress updates during a detection run.
///
/// Implementations must be [`Send`] and [`Sync`] because the driver may
/// report from a different thread than the one that created the callback.
///
/// Progress callbacks are infallible: they observe but cannot halt the
/// run. Use [`CancellationToken`] for cooperative cancellation.
pub trait ProgressCallback: Send + Sync {
    /// Called at regular intervals during a detection run.
    fn on_progress(&self, info: &ProgressInfo);
}

/// A no-op implementation that discards all progress notifications.
///
/// This is the default when no callback is configured.
pub(crate) struct NoOpProgress;

impl ProgressCallback for NoOpProgress {
    fn on_progress(&self, _info: &ProgressInfo) {}
}

#[derive(Debug, Default)]
struct TokenState {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    signal: Condvar,
}

/// Cooperative cancellation token.
///
/// Clone this token and share it between threads; call
/// [`cancel`](CancellationToken::cancel) from any thread to request
/// cancellation. Besides polling [`is_cancelled`](CancellationToken::is_cancelled),
/// a thread can block until cancellation with [`wait`](CancellationToken::wait)
/// or [`wait_timeout`](CancellationToken::wait_timeout).
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use unscale::CancellationToken;
///
/// let token = CancellationToken::new();
/// assert!(!token.is_cancelled());
/// assert!(!token.wait_timeout(Duration::from_millis(1)));
///
/// token.cancel();
/// assert!(token.is_cancelled());
/// assert!(token.wait_timeout(Duration::from_millis(1)));
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    /// Create a new, non-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake every thread blocked in a wait.
    ///
    /// All clones of this token will observe the cancellation.
    pub fn cancel(&self) {
        let _guard = self.state.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.state.cancelled.store(true, Ordering::Release);
        self.state.signal.notify_all();
    }

    /// Check whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Block until the token is cancelled.
    pub fn wait(&self) {
        let mut guard = self.state.lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !self.is_cancelled() {
            guard = self
                .state
                .signal
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the token is cancelled or `timeout` elapses.
    ///
    /// Returns `true` if the token was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.state.lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !self.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .state
                .signal
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            guard = next;
        }
        true
    }
}

/// Tracks progress timing and emits callbacks.
pub(crate) struct ProgressTracker {
    callback: Arc<dyn ProgressCallback>,
    total: Option<u64>,
    current: u64,
    batch_size: u64,
    start_time: Instant,
    items_since_last_report: u64,
    last_tester: Option<String>,
    last_height: Option<u32>,
}

impl ProgressTracker {
    pub(crate) fn new(callback: Arc<dyn ProgressCallback>, total: Option<u64>, batch_size: u64) -> Self {
        Self {
            callback,
            total,
            current: 0,
            batch_size: batch_size.max(1),
            start_time: Instant::now(),
            items_since_last_report: 0,
            last_tester: None,
            last_height: None,
        }
    }

    /// Move the count forward to `current` and fire the callback once at
    /// least a batch of new items has accumulated.
    pub(crate) fn update(&mut self, current: u64, last_tester: Option<&str>, last_height: Option<u32>) {
        if current <= self.current {
            return;
        }
        self.items_since_last_report += current - self.current;
        self.current = current;
        if let Some(tester) = last_tester {
            self.last_tester = Some(tester.to_string());
        }
        if last_height.is_some() {
            self.last_height = last_height;
        }

        if self.items_since_last_report >= self.batch_size {
            self.report();
            self.items_since_last_report = 0;
        }
    }

    /// Unconditionally emit a final progress report.
    pub(crate) fn finish(&mut self) {
        self.report();
    }

    fn report(&self) {
        let elapsed = self.start_time.elapsed();

        let percentage = self
            .total
            .filter(|&total| total > 0)
            .map(|total| (self.current as f32 / total as f32) * 100.0);

        let estimated_remaining = if self.current > 0 {
            self.total.map(|total| {
                let remaining = total.saturating_sub(self.current);
                elapsed.mul_f64(remaining as f64 / self.current as f64)
            })
        } else {
            None
        };

        let info = ProgressInfo {
            current: self.current,
            total: self.total,
            percentage,
            elapsed,
            estimated_remaining,
            last_tester: self.last_tester.clone(),
            last_height: self.last_height,
        };

        self.callback.on_progress(&info);
    }
}
