//! Scoring workers.
//!
//! A worker is a named OS thread that owns a private [`VideoSession`] and a
//! private cache of [`ReferenceFrame`]s. It pulls [`WorkItem`]s from the shared
//! input queue, asks the named [`Tester`](crate::Tester) for the
//! rescaled-and-restored frame, scores it against the cached reference and
//! sends a [`ScoreResult`] down its own output channel.
//!
//! A worker moves through four states:
//!
//! 1. initializing: opens its session and runs every tester's `init` hook,
//! 2. priming: renders each reference frame and its baseline,
//! 3. serving: takes items until the queue stays empty for the idle timeout
//!    or is closed,
//! 4. draining: reports and exits.
//!
//! Any failure while scoring an item ends the worker with that error; the
//! [`Dispatcher`](crate::Dispatcher) notices and starts a replacement.

use std::{
    collections::HashMap,
    io::Error as IoError,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use image::RgbImage;

use crate::{
    compare::ReferenceFrame,
    error::UnscaleError,
    frame_space::WorkItem,
    progress::CancellationToken,
    session::{SessionSource, VideoSession},
    tester::TesterRegistry,
};

/// Longest single blocking wait, so cancellation is noticed promptly.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// A scored work item.
#[derive(Debug, Clone)]
pub struct ScoreResult {
    /// Tester that produced the candidate.
    pub tester: Arc<str>,
    /// Candidate width.
    pub width: u32,
    /// Candidate height.
    pub height: u32,
    /// Reference frame index.
    pub frame: u64,
    /// Round-trip distance to the reference (see [`compare`](crate::compare)).
    ///
    /// Divided by the reference's self-comparison baseline when that is
    /// non-zero. The baseline of a deterministic decode is zero, so this is
    /// normally the raw, unnormalised distance: `0.0` for an exact round trip,
    /// unbounded above, and not a fraction of anything.
    pub score: f64,
    /// The rescaled-and-restored candidate frame.
    pub image: RgbImage,
    /// Wall-clock time the score was computed.
    pub completed_at: SystemTime,
    /// Slot id of the worker that produced it.
    pub worker: usize,
}

/// Payload of a [`WorkerEvent`].
#[derive(Debug, Clone)]
pub enum WorkerEventKind {
    /// Free-form status text.
    Message(String),
    /// A finished work item.
    Result(ScoreResult),
    /// Request to (re)start the worker in this slot.
    Restart,
}

/// One message on a worker output channel or the control channel.
#[derive(Debug, Clone)]
pub struct WorkerEvent {
    /// Worker slot the event belongs to.
    pub worker: usize,
    /// What happened.
    pub kind: WorkerEventKind,
}

/// How a worker thread ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The input queue closed or stayed empty for the idle timeout.
    Drained,
    /// The recycle budget was spent and the dispatcher replaced the worker.
    Recycled,
    /// The worker was cancelled or its output channel went away.
    Cancelled,
}

/// Knobs a worker takes from [`DetectionOptions`](crate::DetectionOptions).
#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkerSettings {
    pub(crate) idle_timeout: Duration,
    pub(crate) recycle_after: Option<u64>,
}

/// Everything a worker thread owns.
pub(crate) struct WorkerContext {
    pub(crate) id: usize,
    pub(crate) source: Arc<dyn SessionSource>,
    pub(crate) registry: Arc<TesterRegistry>,
    pub(crate) frames: Arc<[u64]>,
    pub(crate) input: Receiver<WorkItem>,
    pub(crate) output: Sender<WorkerEvent>,
    pub(crate) settings: WorkerSettings,
    /// Cancels this worker only.
    pub(crate) token: CancellationToken,
    /// Cancels every worker of the dispatcher.
    pub(crate) shutdown: CancellationToken,
}

/// Start a worker on its own named thread.
pub(crate) fn start(
    context: WorkerContext,
) -> Result<JoinHandle<Result<WorkerExit, UnscaleError>>, IoError> {
    thread::Builder::new()
        .name(format!("unscale-worker-{}", context.id))
        .spawn(move || context.run())
}

impl WorkerContext {
    fn cancelled(&self) -> bool {
        self.token.is_cancelled() || self.shutdown.is_cancelled()
    }

    fn message(&self, text: impl Into<String>) {
        // A closed output channel means the dispatcher is gone; the
        // cancellation checks end the worker shortly after.
        let _ = self.output.send(WorkerEvent {
            worker: self.id,
            kind: WorkerEventKind::Message(text.into()),
        });
    }

    fn run(self) -> Result<WorkerExit, UnscaleError> {
        log::info!("Worker-{} starting on {}", self.id, self.source.describe());

        self.message("Opening video session");
        let mut session = self.source.open().inspect_err(|error| {
            log::error!("Worker-{} could not open its session: {error}", self.id);
            self.message(format!("Failed to open source: {error}"));
        })?;

        let info = session.video_info().clone();
        self.message("Initializing testers");
        for entry in self.registry.iter() {
            entry.tester.init(&info).inspect_err(|error| {
                log::error!("Worker-{} tester {} failed to initialize: {error}", self.id, entry.name);
                self.message(format!("Failed to initialize tester {}: {error}", entry.name));
            })?;
        }

        self.message("Rendering comparison frames");
        let references = match self.prime(session.as_mut())? {
            Some(references) => references,
            None => return Ok(WorkerExit::Cancelled),
        };

        self.message("Working on queue");
        self.serve(&references)
    }

    /// Render every reference frame. `None` if cancelled meanwhile.
    fn prime(
        &self,
        session: &mut dyn VideoSession,
    ) -> Result<Option<HashMap<u64, ReferenceFrame>>, UnscaleError> {
        let mut references = HashMap::with_capacity(self.frames.len());
        for &index in self.frames.iter() {
            if self.cancelled() {
                return Ok(None);
            }
            if references.contains_key(&index) {
                continue;
            }

            let reference = session
                .frame(index)
                .and_then(|image| ReferenceFrame::new(index, image))
                .inspect_err(|error| {
                    log::error!("Worker-{} failed to render frame {index}: {error}", self.id);
                    self.message(format!("Error rendering reference frame {index}"));
                })?;
            log::debug!(
                "Worker-{} primed frame {index} (baseline {:.6})",
                self.id,
                reference.baseline
            );
            references.insert(index, reference);
        }
        Ok(Some(references))
    }

    fn serve(&self, references: &HashMap<u64, ReferenceFrame>) -> Result<WorkerExit, UnscaleError> {
        let mut served: u64 = 0;
        let mut idle_since = Instant::now();

        loop {
            if self.cancelled() {
                return Ok(WorkerExit::Cancelled);
            }
            if self.settings.recycle_after.is_some_and(|budget| served >= budget) {
                return Ok(self.recycle(served));
            }

            let item = match self.input.recv_timeout(WAIT_SLICE) {
                Ok(item) => item,
                Err(RecvTimeoutError::Timeout) => {
                    if idle_since.elapsed() < self.settings.idle_timeout {
                        continue;
                    }
                    self.message("Empty queue detected.");
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.message("Empty queue detected.");
                    break;
                }
            };

            let result = self.score(&item, references).inspect_err(|error| {
                log::error!(
                    "Worker-{} failed on {}x{}@{} ({}): {error}",
                    self.id,
                    item.width,
                    item.height,
                    item.frame,
                    item.tester
                );
                self.message(format!(
                    "Error in {}x{}@{}",
                    item.width, item.height, item.frame
                ));
            })?;

            // A cancelled worker discards its in-flight result.
            if self.cancelled() {
                return Ok(WorkerExit::Cancelled);
            }
            let event = WorkerEvent {
                worker: self.id,
                kind: WorkerEventKind::Result(result),
            };
            if self.output.send(event).is_err() {
                return Ok(WorkerExit::Cancelled);
            }

            served += 1;
            idle_since = Instant::now();
        }

        log::debug!("Worker-{} drained after {served} item(s)", self.id);
        self.message("Draining");
        Ok(WorkerExit::Drained)
    }

    fn score(
        &self,
        item: &WorkItem,
        references: &HashMap<u64, ReferenceFrame>,
    ) -> Result<ScoreResult, UnscaleError> {
        let reference = references
            .get(&item.frame)
            .ok_or(UnscaleError::MissingReference(item.frame))?;
        let entry = self.registry.require(&item.tester)?;

        let image = entry
            .tester
            .test(&reference.image, item.resolution())
            .map_err(|error| match error {
                UnscaleError::RescaleError { .. } => error,
                other => UnscaleError::RescaleError {
                    tester: item.tester.to_string(),
                    width: item.width,
                    height: item.height,
                    reason: other.to_string(),
                },
            })?;
        let score = reference.score(&image)?;

        log::debug!(
            "Worker-{} scored {} {}x{}@{}: {score:.6}",
            self.id,
            item.tester,
            item.width,
            item.height,
            item.frame
        );

        Ok(ScoreResult {
            tester: Arc::clone(&item.tester),
            width: item.width,
            height: item.height,
            frame: item.frame,
            score,
            image,
            completed_at: SystemTime::now(),
            worker: self.id,
        })
    }

    /// Ask for a replacement, then park until the dispatcher cancels us.
    fn recycle(&self, served: u64) -> WorkerExit {
        log::info!("Worker-{} requesting recycle after {served} item(s)", self.id);
        self.message(format!("Recycling after {served} item(s)"));
        let requested = self
            .output
            .send(WorkerEvent {
                worker: self.id,
                kind: WorkerEventKind::Restart,
            })
            .is_ok();
        if !requested {
            return WorkerExit::Cancelled;
        }

        while !self.token.wait_timeout(WAIT_SLICE) {
            if self.shutdown.is_cancelled() {
                return WorkerExit::Cancelled;
            }
        }
        WorkerExit::Recycled
    }
}
