//! Work distribution.
//!
//! The [`Dispatcher`] owns the bounded input queue, the worker slots and the
//! [`ChannelRing`] of output channels. It is pull-driven: nothing happens
//! until the caller invokes [`Dispatcher::advance`], which refills the input
//! queue, delivers at most one event and, when there is nothing to deliver,
//! checks on the workers.
//!
//! Workers are started lazily. Scheduling seeds one restart request per slot
//! on a control channel, so the first `advance()` calls spawn the pool. The
//! same path replaces workers that asked to be recycled and, up to a bound,
//! workers that crashed. An item held by a crashed worker is lost; it is not
//! requeued.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use unscale::{
//!     AspectRatio, DetectionOptions, Dispatcher, FrameSpace, MediaSource, TesterRegistry,
//! };
//!
//! let registry = Arc::new(TesterRegistry::with_defaults());
//! let frames = vec![0, 120, 240];
//! let heights: Vec<u32> = (700..=900).step_by(2).collect();
//! let space = FrameSpace::new(registry.names(), frames.clone(), heights, AspectRatio::WIDESCREEN)?;
//!
//! let mut dispatcher = Dispatcher::schedule(
//!     space,
//!     Arc::new(MediaSource::new("input.mkv")),
//!     registry,
//!     &frames,
//!     &DetectionOptions::new().with_workers(4),
//! )?;
//! while dispatcher.advance(|result| {
//!     println!("{} {}x{}@{}: {:.4}", result.tester, result.width, result.height, result.frame, result.score);
//! }) {}
//! # Ok::<(), unscale::UnscaleError>(())
//! ```

use std::{
    collections::VecDeque,
    fmt::{Debug, Formatter, Result as FmtResult},
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant, SystemTime},
};

use crossbeam_channel::{
    Receiver, Select, Sender, TryRecvError, TrySendError, bounded, unbounded,
};

use crate::{
    config::DetectionOptions,
    error::UnscaleError,
    frame_space::WorkItem,
    progress::CancellationToken,
    session::SessionSource,
    tester::TesterRegistry,
    worker::{self, ScoreResult, WorkerContext, WorkerEvent, WorkerEventKind, WorkerExit, WorkerSettings},
};

/// Ordered set of event receivers, polled round-robin.
///
/// The receiver that produced the last event moves to the back, so a busy
/// channel cannot starve the others. Receivers are only ever appended; a
/// disconnected one stays in the ring and is skipped.
#[derive(Default)]
pub struct ChannelRing {
    entries: VecDeque<RingEntry>,
}

struct RingEntry {
    receiver: Receiver<WorkerEvent>,
    live: bool,
}

impl Debug for ChannelRing {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("ChannelRing")
            .field("channels", &self.entries.len())
            .field("live", &self.live())
            .finish()
    }
}

impl ChannelRing {
    /// An empty ring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a receiver at the back of the rotation.
    pub fn push(&mut self, receiver: Receiver<WorkerEvent>) {
        self.entries.push_back(RingEntry {
            receiver,
            live: true,
        });
    }

    /// Total receivers, dead ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if no receiver was ever added.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Receivers not yet seen disconnected.
    pub fn live(&self) -> usize {
        self.entries.iter().filter(|entry| entry.live).count()
    }

    /// Take one event from the first receiver, in ring order, that has one.
    pub fn try_next(&mut self) -> Option<WorkerEvent> {
        for position in 0..self.entries.len() {
            let entry = &mut self.entries[position];
            if !entry.live {
                continue;
            }
            match entry.receiver.try_recv() {
                Ok(event) => {
                    if let Some(entry) = self.entries.remove(position) {
                        self.entries.push_back(entry);
                    }
                    return Some(event);
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => entry.live = false,
            }
        }
        None
    }

    /// Block until some live receiver is ready or `timeout` passes.
    ///
    /// Returns `true` if a receiver became ready; a disconnect also counts.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut select = Select::new();
        let mut registered = 0;
        for entry in self.entries.iter().filter(|entry| entry.live) {
            select.recv(&entry.receiver);
            registered += 1;
        }
        if registered == 0 {
            std::thread::sleep(timeout);
            return false;
        }
        select.ready_timeout(timeout).is_ok()
    }
}

/// What one [`Dispatcher::step`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// A worker status message was logged.
    Message {
        /// Worker slot.
        worker: usize,
        /// Message text.
        text: String,
    },
    /// A result was handed to the callback.
    Result {
        /// Worker slot that produced it.
        worker: usize,
    },
    /// The worker in this slot was (re)started.
    Restarted(usize),
    /// Nothing arrived within the poll timeout; workers are still alive.
    Idle,
    /// No worker is alive and none is about to be started.
    Exhausted,
}

/// Lifecycle of a worker slot, as last observed by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// A start or restart request is queued.
    Starting,
    /// The current occupant's thread is running.
    Running,
    /// The current occupant exited cleanly.
    Exited(WorkerExit),
    /// The current occupant failed and will not be replaced.
    Crashed,
}

type WorkerHandle = JoinHandle<Result<WorkerExit, UnscaleError>>;

struct WorkerRecord {
    handle: Option<WorkerHandle>,
    token: CancellationToken,
    status: WorkerStatus,
    generation: u64,
    crash_restarts: u32,
}

/// Cancels a [`Dispatcher`] from another thread.
#[derive(Debug, Clone)]
pub struct StopHandle {
    shutdown: CancellationToken,
}

impl StopHandle {
    /// Ask every worker to stop; the dispatcher reports exhaustion on its
    /// next `advance()`.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

/// Schedules work items onto a pool of restartable workers.
pub struct Dispatcher {
    source: Arc<dyn SessionSource>,
    registry: Arc<TesterRegistry>,
    frames: Arc<[u64]>,
    settings: WorkerSettings,
    poll_timeout: Duration,
    max_restarts: u32,

    items: Box<dyn Iterator<Item = WorkItem> + Send>,
    next_item: Option<WorkItem>,
    items_exhausted: bool,
    input_sender: Option<Sender<WorkItem>>,
    input_receiver: Receiver<WorkItem>,

    control: Sender<WorkerEvent>,
    ring: ChannelRing,
    slots: Vec<WorkerRecord>,
    retired: Vec<WorkerHandle>,

    shutdown: CancellationToken,
    cancellation: Option<CancellationToken>,
    stopped: bool,

    started_at: SystemTime,
    started: Instant,
    dispatched: u64,
    delivered: u64,
    restarts: u64,
}

impl Debug for Dispatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Dispatcher")
            .field("source", &self.source.describe())
            .field("workers", &self.slots.len())
            .field("ring", &self.ring)
            .field("dispatched", &self.dispatched)
            .field("delivered", &self.delivered)
            .field("restarts", &self.restarts)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Prepare to process `work_items` with `options.workers()` workers.
    ///
    /// No thread is started here; the pool comes up over the first
    /// [`advance`](Dispatcher::advance) calls.
    ///
    /// # Errors
    ///
    /// Returns [`UnscaleError::InvalidParameter`] if the options do not
    /// validate or `frames` is empty.
    pub fn schedule<I>(
        work_items: I,
        source: Arc<dyn SessionSource>,
        registry: Arc<TesterRegistry>,
        frames: &[u64],
        options: &DetectionOptions,
    ) -> Result<Self, UnscaleError>
    where
        I: IntoIterator<Item = WorkItem>,
        I::IntoIter: Send + 'static,
    {
        options.validate()?;
        if frames.is_empty() {
            return Err(UnscaleError::InvalidParameter(
                "at least one reference frame is required".to_string(),
            ));
        }

        let worker_count = options.workers();
        let (input_sender, input_receiver) = bounded(options.queue_capacity());
        let (control, control_receiver) = unbounded();

        let mut ring = ChannelRing::new();
        ring.push(control_receiver);

        let mut slots = Vec::with_capacity(worker_count);
        for worker in 0..worker_count {
            // The control receiver is alive for as long as we hold it.
            let _ = control.send(WorkerEvent {
                worker,
                kind: WorkerEventKind::Restart,
            });
            slots.push(WorkerRecord {
                handle: None,
                token: CancellationToken::new(),
                status: WorkerStatus::Starting,
                generation: 0,
                crash_restarts: 0,
            });
        }

        log::info!(
            "Scheduling work on {} worker(s) for {}",
            worker_count,
            source.describe()
        );

        Ok(Self {
            source,
            registry,
            frames: frames.into(),
            settings: WorkerSettings {
                idle_timeout: options.idle_timeout,
                recycle_after: options.recycle_after,
            },
            poll_timeout: options.poll_timeout,
            max_restarts: options.max_restarts,
            items: Box::new(work_items.into_iter()),
            next_item: None,
            items_exhausted: false,
            input_sender: Some(input_sender),
            input_receiver,
            control,
            ring,
            slots,
            retired: Vec::new(),
            shutdown: CancellationToken::new(),
            cancellation: options.cancellation.clone(),
            stopped: false,
            started_at: SystemTime::now(),
            started: Instant::now(),
            dispatched: 0,
            delivered: 0,
            restarts: 0,
        })
    }

    /// Perform one step and report whether there may be more to do.
    ///
    /// Returns `false` once every worker is gone and none is about to be
    /// started; check [`pending_items`](Dispatcher::pending_items) to tell a
    /// finished run from one whose workers all died.
    pub fn advance<F>(&mut self, on_result: F) -> bool
    where
        F: FnMut(ScoreResult),
    {
        self.step(on_result) != Step::Exhausted
    }

    /// Like [`advance`](Dispatcher::advance), but says what happened.
    pub fn step<F>(&mut self, mut on_result: F) -> Step
    where
        F: FnMut(ScoreResult),
    {
        if self.shutdown.is_cancelled()
            || self
                .cancellation
                .as_ref()
                .is_some_and(CancellationToken::is_cancelled)
        {
            self.stop();
        }
        if self.stopped {
            return Step::Exhausted;
        }

        self.refill();

        if let Some(event) = self.ring.try_next() {
            return self.handle(event, &mut on_result);
        }
        if self.ring.wait(self.poll_timeout) {
            self.refill();
            if let Some(event) = self.ring.try_next() {
                return self.handle(event, &mut on_result);
            }
        }

        if self.check_liveness() {
            return Step::Idle;
        }
        // A worker may have sent its last events just before exiting.
        match self.ring.try_next() {
            Some(event) => self.handle(event, &mut on_result),
            None => Step::Exhausted,
        }
    }

    /// Move available items into the input queue until it is full.
    fn refill(&mut self) {
        while let Some(sender) = self.input_sender.as_ref() {
            let Some(item) = self.next_item.take().or_else(|| self.items.next()) else {
                log::debug!("All {} work item(s) queued; closing input queue", self.dispatched);
                self.items_exhausted = true;
                self.input_sender = None;
                break;
            };
            match sender.try_send(item) {
                Ok(()) => self.dispatched += 1,
                Err(TrySendError::Full(item) | TrySendError::Disconnected(item)) => {
                    self.next_item = Some(item);
                    break;
                }
            }
        }
    }

    fn handle<F>(&mut self, event: WorkerEvent, on_result: &mut F) -> Step
    where
        F: FnMut(ScoreResult),
    {
        let worker = event.worker;
        match event.kind {
            WorkerEventKind::Message(text) => {
                log::info!("[Worker-{worker}] {text}");
                Step::Message { worker, text }
            }
            WorkerEventKind::Result(result) => {
                self.delivered += 1;
                on_result(result);
                Step::Result { worker }
            }
            WorkerEventKind::Restart => {
                self.restart_slot(worker);
                Step::Restarted(worker)
            }
        }
    }

    /// Replace the occupant of slot `id` with a fresh worker.
    ///
    /// The previous occupant, if any, is cancelled and no longer tracked as
    /// the slot's worker; its output channel stays in the ring.
    pub fn restart_slot(&mut self, id: usize) {
        if self.stopped {
            return;
        }
        let Some(slot) = self.slots.get_mut(id) else {
            log::warn!("Ignoring restart request for unknown worker {id}");
            return;
        };

        if let Some(handle) = slot.handle.take() {
            log::info!("Restarting worker {id}");
            slot.token.cancel();
            self.retired.push(handle);
            self.restarts += 1;
        } else if slot.generation > 0 {
            log::info!("Restarting worker {id}");
            self.restarts += 1;
        } else {
            log::info!("Starting worker {id}");
        }

        let (output, receiver) = unbounded();
        self.ring.push(receiver);

        let token = CancellationToken::new();
        let context = WorkerContext {
            id,
            source: Arc::clone(&self.source),
            registry: Arc::clone(&self.registry),
            frames: Arc::clone(&self.frames),
            input: self.input_receiver.clone(),
            output,
            settings: self.settings,
            token: token.clone(),
            shutdown: self.shutdown.clone(),
        };

        slot.generation += 1;
        slot.token = token;
        match worker::start(context) {
            Ok(handle) => {
                slot.handle = Some(handle);
                slot.status = WorkerStatus::Running;
            }
            Err(error) => {
                log::error!("Failed to spawn worker {id}: {error}");
                self.crashed(id);
            }
        }
        self.reap_retired();
    }

    /// Queue a restart for a crashed slot if its budget allows.
    fn crashed(&mut self, id: usize) -> bool {
        let shutting_down = self.stopped || self.shutdown.is_cancelled();
        let Some(slot) = self.slots.get_mut(id) else {
            return false;
        };

        if !shutting_down && slot.crash_restarts < self.max_restarts {
            slot.crash_restarts += 1;
            slot.status = WorkerStatus::Starting;
            log::warn!(
                "Worker {id} died; restart {} of {}",
                slot.crash_restarts,
                self.max_restarts
            );
            let _ = self.control.send(WorkerEvent {
                worker: id,
                kind: WorkerEventKind::Restart,
            });
            true
        } else {
            slot.status = WorkerStatus::Crashed;
            if !shutting_down {
                log::error!("Worker {id} died and has no restarts left");
            }
            false
        }
    }

    /// Join finished workers and queue restarts for crashed ones.
    ///
    /// Returns `true` if some worker is running or about to be started.
    fn check_liveness(&mut self) -> bool {
        self.reap_retired();

        let mut alive = false;
        for id in 0..self.slots.len() {
            let slot = &mut self.slots[id];
            if slot.status == WorkerStatus::Starting {
                alive = true;
                continue;
            }

            let finished = slot.handle.as_ref().is_some_and(JoinHandle::is_finished);
            if !finished {
                alive |= slot.handle.is_some();
                continue;
            }
            let Some(handle) = slot.handle.take() else {
                continue;
            };

            let crash = match handle.join() {
                Ok(Ok(WorkerExit::Drained)) => {
                    log::debug!("Worker {id} drained");
                    slot.status = WorkerStatus::Exited(WorkerExit::Drained);
                    false
                }
                Ok(Ok(exit)) => {
                    // Still the slot's occupant, so nobody asked it to go.
                    slot.status = WorkerStatus::Exited(exit);
                    if !self.shutdown.is_cancelled() {
                        log::warn!("Worker {id} was terminated");
                    }
                    true
                }
                Ok(Err(error)) => {
                    log::warn!("Worker {id} exited with an error: {error}");
                    true
                }
                Err(_) => {
                    log::warn!("Worker {id} panicked");
                    true
                }
            };

            if crash && self.crashed(id) {
                alive = true;
            }
        }
        alive
    }

    /// Join replaced workers that have finished.
    fn reap_retired(&mut self) {
        let mut index = 0;
        while index < self.retired.len() {
            if self.retired[index].is_finished() {
                let handle = self.retired.swap_remove(index);
                if let Err(_) | Ok(Err(_)) = handle.join() {
                    log::debug!("A replaced worker ended abnormally");
                }
            } else {
                index += 1;
            }
        }
    }

    /// Forcibly end the current worker in slot `id`.
    ///
    /// The slot keeps the terminated worker as its occupant, so the next
    /// liveness check treats it as a crash and queues a restart.
    pub fn terminate_worker(&mut self, id: usize) {
        if let Some(slot) = self.slots.get(id) {
            log::info!("Terminating worker {id}");
            slot.token.cancel();
        }
    }

    /// Cancel every worker and close the input queue.
    ///
    /// Workers are not joined; any item they hold is lost. Safe to call more
    /// than once.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.shutdown.cancel();
        self.input_sender = None;
        for slot in &self.slots {
            slot.token.cancel();
        }
        log::info!(
            "Dispatcher stopped after {:.2?}: {} dispatched, {} delivered",
            self.started.elapsed(),
            self.dispatched,
            self.delivered
        );
    }

    /// A handle that stops this dispatcher from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    /// Wall-clock time of scheduling; results are reported relative to it.
    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    /// Number of worker slots.
    pub fn worker_count(&self) -> usize {
        self.slots.len()
    }

    /// Last observed status of slot `id`.
    pub fn worker_status(&self, id: usize) -> Option<WorkerStatus> {
        self.slots.get(id).map(|slot| slot.status)
    }

    /// Items moved into the input queue so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Results handed to the callback so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Workers replaced after their first start, for any reason.
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Items not yet taken by any worker.
    ///
    /// After [`stop`](Self::stop) this still counts the items that were never
    /// queued.
    pub fn pending_items(&self) -> u64 {
        let queued = self.input_receiver.len() as u64;
        let held = u64::from(self.next_item.is_some());
        let remaining = if self.items_exhausted {
            0
        } else {
            self.items.size_hint().0 as u64
        };
        queued + held + remaining
    }

    /// Items taken by a worker that produced no result.
    ///
    /// While workers run this includes items in flight; after exhaustion it
    /// counts items lost with crashed workers.
    pub fn lost_items(&self) -> u64 {
        self.dispatched
            .saturating_sub(self.delivered)
            .saturating_sub(self.input_receiver.len() as u64)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
