//! The detection driver.
//!
//! [`Detector`] validates the request, probes the source, builds the
//! [`FrameSpace`], and pumps a [`Dispatcher`] from a dedicated polling thread.
//! Every result lands in a per-tester [`SimilarityCurve`] behind one mutex;
//! the calling thread wakes periodically to snapshot the count for progress
//! reporting and to honour cancellation.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use unscale::{DetectionOptions, Detector, MediaSource, TesterRegistry};
//!
//! let detector = Detector::new(
//!     Arc::new(MediaSource::new("input.mkv")),
//!     Arc::new(TesterRegistry::with_defaults()),
//!     DetectionOptions::new(),
//! )?;
//! let heights: Vec<u32> = (600..=1000).step_by(2).collect();
//! let report = detector.run(&[0, 500, 1000], &heights, |_| {})?;
//! for breakpoint in report.breakpoints(5.0) {
//!     println!("{}@{} | {:.2}%", breakpoint.height, breakpoint.tester, breakpoint.score * 100.0);
//! }
//! # Ok::<(), unscale::UnscaleError>(())
//! ```

use std::{
    panic,
    sync::{Arc, Mutex, PoisonError},
    thread,
    time::{Duration, Instant},
};

use image::RgbImage;

use crate::{
    config::DetectionOptions,
    dispatcher::Dispatcher,
    error::UnscaleError,
    frame_space::{FrameSpace, get_resolution},
    outlier::{Breakpoint, SimilarityCurve},
    progress::ProgressTracker,
    session::{SessionSource, VideoInfo},
    tester::TesterRegistry,
    worker::ScoreResult,
};

/// The outcome of a detection run.
#[derive(Debug, Clone)]
pub struct DetectionReport {
    /// Properties of the analysed source.
    pub video: VideoInfo,
    /// One curve per tester, in registry order.
    pub curves: Vec<SimilarityCurve>,
    /// Results delivered.
    pub delivered: u64,
    /// Items taken by workers that never produced a result.
    pub lost_items: u64,
    /// Worker replacements during the run.
    pub restarts: u64,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

impl DetectionReport {
    /// The curve for `tester`.
    pub fn curve(&self, tester: &str) -> Option<&SimilarityCurve> {
        self.curves.iter().find(|curve| &**curve.tester() == tester)
    }

    /// Breakpoints of every curve at `threshold`, in registry order.
    pub fn breakpoints(&self, threshold: f64) -> Vec<Breakpoint> {
        self.curves
            .iter()
            .flat_map(|curve| curve.breakpoints(threshold))
            .collect()
    }
}

#[derive(Default)]
struct Collector {
    curves: Vec<SimilarityCurve>,
    delivered: u64,
    last_tester: Option<Arc<str>>,
    last_height: Option<u32>,
}

impl Collector {
    fn record(&mut self, result: &ScoreResult) {
        match self
            .curves
            .iter_mut()
            .find(|curve| curve.tester() == &result.tester)
        {
            Some(curve) => curve.push(result.height, result.score),
            None => {
                let mut curve = SimilarityCurve::new(Arc::clone(&result.tester));
                curve.push(result.height, result.score);
                self.curves.push(curve);
            }
        }
        self.delivered += 1;
        self.last_tester = Some(Arc::clone(&result.tester));
        self.last_height = Some(result.height);
    }

    /// Copy out what a progress report needs, so the lock can be released
    /// before the callback runs.
    fn progress(&self) -> (u64, Option<Arc<str>>, Option<u32>) {
        (self.delivered, self.last_tester.clone(), self.last_height)
    }
}

struct PollSummary {
    pending: u64,
    lost: u64,
    restarts: u64,
}

/// Runs detections against one source with one set of testers.
pub struct Detector {
    source: Arc<dyn SessionSource>,
    registry: Arc<TesterRegistry>,
    options: DetectionOptions,
}

impl Detector {
    /// Create a detector.
    ///
    /// # Errors
    ///
    /// Returns [`UnscaleError::InvalidParameter`] if the options do not
    /// validate or the registry is empty.
    pub fn new(
        source: Arc<dyn SessionSource>,
        registry: Arc<TesterRegistry>,
        options: DetectionOptions,
    ) -> Result<Self, UnscaleError> {
        options.validate()?;
        if registry.is_empty() {
            return Err(UnscaleError::InvalidParameter(
                "at least one tester must be registered".to_string(),
            ));
        }
        Ok(Self {
            source,
            registry,
            options,
        })
    }

    /// Options this detector runs with.
    pub fn options(&self) -> &DetectionOptions {
        &self.options
    }

    /// Open the source once and read its properties.
    pub fn probe(&self) -> Result<VideoInfo, UnscaleError> {
        let session = self.source.open()?;
        Ok(session.video_info().clone())
    }

    /// Score every tester at every height on every frame.
    ///
    /// `on_result` sees each result as it arrives, on the polling thread.
    ///
    /// # Errors
    ///
    /// Parameter problems are reported before any worker starts:
    /// [`UnscaleError::InvalidParameter`] for empty inputs or zero heights and
    /// [`UnscaleError::FrameOutOfRange`] for frames past the end. A run whose
    /// workers all died with items left fails with
    /// [`UnscaleError::WorkersExhausted`]; a cancelled run with
    /// [`UnscaleError::Cancelled`].
    pub fn run<F>(
        &self,
        frames: &[u64],
        heights: &[u32],
        mut on_result: F,
    ) -> Result<DetectionReport, UnscaleError>
    where
        F: FnMut(&ScoreResult) + Send,
    {
        let space = FrameSpace::new(
            self.registry.names(),
            frames.to_vec(),
            heights.to_vec(),
            self.options.aspect_ratio,
        )?;

        let video = self.probe()?;
        if let Some(&frame_number) = frames
            .iter()
            .find(|&&frame| video.frame_count > 0 && frame >= video.frame_count)
        {
            return Err(UnscaleError::FrameOutOfRange {
                frame_number,
                total_frames: video.frame_count,
            });
        }

        let total = space.len() as u64;
        log::info!(
            "Detecting on {} ({}x{}): {} tester(s) x {} frame(s) x {} height(s) = {} item(s)",
            self.source.describe(),
            video.width,
            video.height,
            space.testers().len(),
            space.frames().len(),
            space.resolutions().len(),
            total
        );

        let started = Instant::now();
        let mut dispatcher = Dispatcher::schedule(
            space,
            Arc::clone(&self.source),
            Arc::clone(&self.registry),
            frames,
            &self.options,
        )?;
        let stop = dispatcher.stop_handle();

        let collector = Arc::new(Mutex::new(Collector {
            curves: self
                .registry
                .names()
                .into_iter()
                .map(SimilarityCurve::new)
                .collect(),
            ..Collector::default()
        }));
        let mut tracker =
            ProgressTracker::new(Arc::clone(&self.options.progress), Some(total), self.options.batch_size);

        let summary = thread::scope(|scope| -> Result<PollSummary, UnscaleError> {
            let shared = Arc::clone(&collector);
            let on_result = &mut on_result;
            let poller = thread::Builder::new()
                .name("unscale-poll".to_string())
                .spawn_scoped(scope, move || {
                    while dispatcher.advance(|result| {
                        on_result(&result);
                        shared
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .record(&result);
                    }) {}
                    PollSummary {
                        pending: dispatcher.pending_items(),
                        lost: dispatcher.lost_items(),
                        restarts: dispatcher.restarts(),
                    }
                })?;

            while !poller.is_finished() {
                let cancelled = match &self.options.cancellation {
                    Some(token) => token.wait_timeout(self.options.report_interval),
                    None => {
                        thread::sleep(self.options.report_interval);
                        false
                    }
                };
                if cancelled {
                    stop.stop();
                }

                let (delivered, last_tester, last_height) = collector
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .progress();
                tracker.update(delivered, last_tester.as_deref(), last_height);
            }

            match poller.join() {
                Ok(summary) => Ok(summary),
                Err(payload) => panic::resume_unwind(payload),
            }
        })?;

        let (delivered, last_tester, last_height) = collector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .progress();
        tracker.update(delivered, last_tester.as_deref(), last_height);
        tracker.finish();

        let state = collector.lock().unwrap_or_else(PoisonError::into_inner);

        if self.options.is_cancelled() {
            log::warn!("Detection cancelled after {} result(s)", state.delivered);
            return Err(UnscaleError::Cancelled);
        }
        if summary.pending > 0 {
            log::error!(
                "All workers died with {} item(s) pending ({} delivered)",
                summary.pending,
                state.delivered
            );
            return Err(UnscaleError::WorkersExhausted {
                pending: summary.pending,
            });
        }
        if summary.lost > 0 {
            log::warn!("{} item(s) were lost with crashed workers", summary.lost);
        }

        let report = DetectionReport {
            video,
            curves: state.curves.clone(),
            delivered: state.delivered,
            lost_items: summary.lost,
            restarts: summary.restarts,
            elapsed: started.elapsed(),
        };
        log::info!(
            "Detection finished in {:.2?}: {} of {} result(s)",
            report.elapsed,
            report.delivered,
            total
        );
        Ok(report)
    }

    /// Render the candidate one tester produces at `height` for `frame`.
    ///
    /// Uses the detector's aspect ratio for the width.
    pub fn render_candidate(
        &self,
        tester: &str,
        height: u32,
        frame: u64,
    ) -> Result<RgbImage, UnscaleError> {
        let resolution = get_resolution(height, self.options.aspect_ratio)?;
        let entry = self.registry.require(tester)?;
        let mut session = self.source.open()?;
        entry.tester.init(session.video_info())?;
        let reference = session.frame(frame)?;
        entry.tester.test(&reference, resolution)
    }
}
