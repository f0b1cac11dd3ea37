//! Progress and cancellation tests.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, unbounded};
use image::{Rgb, RgbImage, imageops::FilterType};
use unscale::{
    CancellationToken, DetectionOptions, Detector, MemorySource, ProgressCallback, ProgressInfo,
    Resolution, ResizeTester, Tester, TesterRegistry, UnscaleError,
};

// ── CancellationToken ──────────────────────────────────────────────

#[test]
fn cancellation_token_default_not_cancelled() {
    let token = CancellationToken::default();
    assert!(!token.is_cancelled());
}

#[test]
fn cancellation_token_clone_shares_state() {
    let token = CancellationToken::new();
    let clone = token.clone();
    assert!(!clone.is_cancelled());

    token.cancel();
    assert!(clone.is_cancelled());
}

#[test]
fn wait_timeout_expires_without_cancel() {
    let token = CancellationToken::new();
    let started = Instant::now();
    assert!(!token.wait_timeout(Duration::from_millis(30)));
    assert!(started.elapsed() >= Duration::from_millis(30));
}

#[test]
fn wait_wakes_on_cancel_from_another_thread() {
    let token = CancellationToken::new();
    let remote = token.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        remote.cancel();
    });

    assert!(token.wait_timeout(Duration::from_secs(10)));
    token.wait();
    canceller.join().unwrap();
}

#[test]
fn cancel_is_idempotent() {
    let token = CancellationToken::new();
    token.cancel();
    token.cancel();
    assert!(token.is_cancelled());
    assert!(token.wait_timeout(Duration::ZERO));
}

// ── Progress reporting ─────────────────────────────────────────────

#[derive(Default)]
struct Recorder {
    reports: Mutex<Vec<ProgressInfo>>,
}

impl ProgressCallback for Recorder {
    fn on_progress(&self, info: &ProgressInfo) {
        self.reports.lock().unwrap().push(info.clone());
    }
}

fn small_detector(options: DetectionOptions) -> Detector {
    let frame = RgbImage::from_fn(64, 36, |x, y| Rgb([(x * 4) as u8, (y * 7) as u8, 50]));
    let mut registry = TesterRegistry::new();
    registry.register("triangle", "green", Arc::new(ResizeTester::new(FilterType::Triangle)));
    Detector::new(
        Arc::new(MemorySource::new(vec![frame]).unwrap()),
        Arc::new(registry),
        options
            .with_workers(2)
            .with_idle_timeout(Duration::from_secs(2))
            .with_poll_timeout(Duration::from_millis(20))
            .with_report_interval(Duration::from_millis(10)),
    )
    .unwrap()
}

#[test]
fn final_report_covers_every_item() {
    let recorder = Arc::new(Recorder::default());
    let detector = small_detector(DetectionOptions::new().with_progress(recorder.clone()));

    detector.run(&[0], &[12, 14, 16, 18, 20, 22], |_| {}).unwrap();

    let reports = recorder.reports.lock().unwrap();
    let last = reports.last().expect("at least the final report");
    assert_eq!(last.current, 6);
    assert_eq!(last.total, Some(6));
    assert_eq!(last.percentage, Some(100.0));
    assert_eq!(last.last_tester.as_deref(), Some("triangle"));
    assert!(last.last_height.is_some());

    // Counts never go backwards.
    assert!(reports.windows(2).all(|pair| pair[0].current <= pair[1].current));
}

/// Holds up the first progress report until three more results arrive.
struct BlockingReporter {
    results: Receiver<()>,
    waited: AtomicBool,
    starved: AtomicBool,
}

impl ProgressCallback for BlockingReporter {
    fn on_progress(&self, _info: &ProgressInfo) {
        if self.waited.swap(true, Ordering::SeqCst) {
            return;
        }
        while self.results.try_recv().is_ok() {}
        for _ in 0..3 {
            if self.results.recv_timeout(Duration::from_secs(5)).is_err() {
                self.starved.store(true, Ordering::SeqCst);
                return;
            }
        }
    }
}

struct SlowTester;

impl Tester for SlowTester {
    fn test(&self, frame: &RgbImage, _resolution: Resolution) -> Result<RgbImage, UnscaleError> {
        thread::sleep(Duration::from_millis(5));
        Ok(frame.clone())
    }
}

#[test]
fn slow_progress_callback_does_not_stall_results() {
    let (sender, results) = unbounded();
    let reporter = Arc::new(BlockingReporter {
        results,
        waited: AtomicBool::new(false),
        starved: AtomicBool::new(false),
    });

    let mut registry = TesterRegistry::new();
    registry.register("slow", "white", Arc::new(SlowTester));
    let frame = RgbImage::from_fn(64, 36, |x, y| Rgb([(x * 4) as u8, (y * 7) as u8, 50]));
    let detector = Detector::new(
        Arc::new(MemorySource::new(vec![frame]).unwrap()),
        Arc::new(registry),
        DetectionOptions::new()
            .with_workers(2)
            .with_idle_timeout(Duration::from_secs(2))
            .with_poll_timeout(Duration::from_millis(20))
            .with_report_interval(Duration::from_millis(10))
            .with_batch_size(1)
            .with_progress(reporter.clone()),
    )
    .unwrap();

    let heights: Vec<u32> = (12..212).collect();
    let report = detector
        .run(&[0], &heights, |_| {
            let _ = sender.send(());
        })
        .unwrap();

    assert_eq!(report.delivered, 200);
    assert!(reporter.waited.load(Ordering::SeqCst));
    assert!(
        !reporter.starved.load(Ordering::SeqCst),
        "results stopped while the progress callback ran"
    );
}

#[test]
fn pre_cancelled_run_is_reported_as_cancelled() {
    let token = CancellationToken::new();
    token.cancel();
    let detector = small_detector(DetectionOptions::new().with_cancellation(token));

    match detector.run(&[0], &[12, 14, 16], |_| {}) {
        Err(UnscaleError::Cancelled) => {}
        other => panic!("Expected Cancelled, got: {other:?}"),
    }
}
