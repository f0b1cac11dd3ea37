//! Detection configuration.
//!
//! [`DetectionOptions`] is a builder that threads the aspect ratio, worker
//! pool sizing, timeouts, progress callbacks and cancellation tokens through
//! the [`Dispatcher`](crate::Dispatcher) and [`Detector`](crate::Detector)
//! without polluting every function signature.
//!
//! # Example
//!
//! ```
//! use std::{sync::Arc, time::Duration};
//!
//! use unscale::{CancellationToken, DetectionOptions, ProgressCallback, ProgressInfo};
//!
//! struct LogProgress;
//! impl ProgressCallback for LogProgress {
//!     fn on_progress(&self, info: &ProgressInfo) {
//!         println!("{} done", info.current);
//!     }
//! }
//!
//! let token = CancellationToken::new();
//! let options = DetectionOptions::new()
//!     .with_workers(4)
//!     .with_idle_timeout(Duration::from_secs(2))
//!     .with_progress(Arc::new(LogProgress))
//!     .with_cancellation(token.clone())
//!     .with_batch_size(10);
//! assert!(options.validate().is_ok());
//! ```

use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    num::NonZeroUsize,
    sync::Arc,
    thread,
    time::Duration,
};

use crate::{
    error::UnscaleError,
    frame_space::AspectRatio,
    progress::{CancellationToken, NoOpProgress, ProgressCallback},
};

/// Worker idle time after which a worker drains and exits.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest time a single [`Dispatcher::advance`](crate::Dispatcher::advance)
/// call waits for a result.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Restarts allowed per worker slot after crashes.
pub const DEFAULT_MAX_RESTARTS: u32 = 3;

/// Configuration for detection runs.
///
/// All fields have sensible defaults; a default-constructed value runs one
/// worker per available CPU with no progress reporting and no cancellation.
#[derive(Clone)]
pub struct DetectionOptions {
    pub(crate) aspect_ratio: AspectRatio,
    pub(crate) workers: usize,
    /// `None` means four slots per worker.
    pub(crate) queue_capacity: Option<usize>,
    pub(crate) idle_timeout: Duration,
    pub(crate) poll_timeout: Duration,
    pub(crate) recycle_after: Option<u64>,
    pub(crate) max_restarts: u32,
    pub(crate) progress: Arc<dyn ProgressCallback>,
    pub(crate) cancellation: Option<CancellationToken>,
    pub(crate) batch_size: u64,
    pub(crate) report_interval: Duration,
}

impl Debug for DetectionOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("DetectionOptions")
            .field("aspect_ratio", &self.aspect_ratio)
            .field("workers", &self.workers)
            .field("queue_capacity", &self.queue_capacity())
            .field("idle_timeout", &self.idle_timeout)
            .field("poll_timeout", &self.poll_timeout)
            .field("recycle_after", &self.recycle_after)
            .field("max_restarts", &self.max_restarts)
            .field("has_cancellation", &self.cancellation.is_some())
            .field("batch_size", &self.batch_size)
            .field("report_interval", &self.report_interval)
            .finish()
    }
}

impl Default for DetectionOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectionOptions {
    /// Create options with default settings.
    pub fn new() -> Self {
        let workers = thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);

        Self {
            aspect_ratio: AspectRatio::WIDESCREEN,
            workers,
            queue_capacity: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            recycle_after: None,
            max_restarts: DEFAULT_MAX_RESTARTS,
            progress: Arc::new(NoOpProgress),
            cancellation: None,
            batch_size: 1,
            report_interval: Duration::from_millis(250),
        }
    }

    /// Aspect ratio used to turn candidate heights into resolutions.
    #[must_use]
    pub fn with_aspect_ratio(mut self, aspect_ratio: AspectRatio) -> Self {
        self.aspect_ratio = aspect_ratio;
        self
    }

    /// Number of worker threads.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Capacity of the bounded input queue.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// How long a worker may wait for input before draining.
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Longest wait inside one `advance()` call.
    #[must_use]
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Ask each worker to be replaced after serving `items` work items.
    ///
    /// Keeps long-running decoders from accumulating state. `0` disables
    /// recycling.
    #[must_use]
    pub fn with_recycle_after(mut self, items: u64) -> Self {
        self.recycle_after = (items > 0).then_some(items);
        self
    }

    /// Crash restarts allowed per worker slot.
    #[must_use]
    pub fn with_max_restarts(mut self, restarts: u32) -> Self {
        self.max_restarts = restarts;
        self
    }

    /// Attach a progress callback.
    #[must_use]
    pub fn with_progress(mut self, callback: Arc<dyn ProgressCallback>) -> Self {
        self.progress = callback;
        self
    }

    /// Attach a cancellation token.
    ///
    /// When the token is cancelled, the run stops its workers and returns
    /// [`UnscaleError::Cancelled`].
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Fire the progress callback at most once per `size` results.
    ///
    /// Clamped to a minimum of 1.
    #[must_use]
    pub fn with_batch_size(mut self, size: u64) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// How often the driver snapshots its buffers for progress.
    #[must_use]
    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    /// Aspect ratio used for candidate resolutions.
    pub fn aspect_ratio(&self) -> AspectRatio {
        self.aspect_ratio
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Effective input queue capacity.
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
            .unwrap_or_else(|| self.workers.saturating_mul(4))
    }

    /// Reject settings that cannot run.
    ///
    /// # Errors
    ///
    /// Returns [`UnscaleError::InvalidParameter`] for zero workers, a zero
    /// queue capacity or a zero timeout.
    pub fn validate(&self) -> Result<(), UnscaleError> {
        if self.workers == 0 {
            return Err(UnscaleError::InvalidParameter(
                "worker count must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity() == 0 {
            return Err(UnscaleError::InvalidParameter(
                "queue capacity must be at least 1".to_string(),
            ));
        }
        if self.idle_timeout.is_zero() {
            return Err(UnscaleError::InvalidParameter(
                "idle timeout must be positive".to_string(),
            ));
        }
        if self.poll_timeout.is_zero() {
            return Err(UnscaleError::InvalidParameter(
                "poll timeout must be positive".to_string(),
            ));
        }
        if self.report_interval.is_zero() {
            return Err(UnscaleError::InvalidParameter(
                "report interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(|token| token.is_cancelled())
    }
}
