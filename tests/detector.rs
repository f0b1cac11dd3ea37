//! Detection driver tests.
//!
//! Most tests run on in-memory frames. The FFmpeg-backed test requires
//! fixture files from `tests/fixtures/generate_fixtures.sh`.

use std::{path::Path, sync::Arc, time::Duration};

use image::{Rgb, RgbImage, imageops::FilterType};
use unscale::{
    AspectRatio, DetectionOptions, Detector, MediaSource, MemorySource, Resolution, ResizeTester, Tester,
    TesterRegistry, UnscaleError,
};

fn gradient() -> RgbImage {
    RgbImage::from_fn(64, 36, |x, y| {
        Rgb([(x * 4) as u8, (y * 7) as u8, ((x * y) % 256) as u8])
    })
}

struct FailingTester;

impl Tester for FailingTester {
    fn test(&self, _frame: &RgbImage, _resolution: Resolution) -> Result<RgbImage, UnscaleError> {
        Err(UnscaleError::InvalidParameter("refusing to rescale".to_string()))
    }
}

fn resize_registry() -> TesterRegistry {
    let mut registry = TesterRegistry::new();
    registry.register("triangle", "green", Arc::new(ResizeTester::new(FilterType::Triangle)));
    registry.register("catrom", "red", Arc::new(ResizeTester::new(FilterType::CatmullRom)));
    registry
}

fn quick_options() -> DetectionOptions {
    DetectionOptions::new()
        .with_workers(2)
        .with_idle_timeout(Duration::from_secs(2))
        .with_poll_timeout(Duration::from_millis(20))
        .with_report_interval(Duration::from_millis(10))
}

fn memory_detector(registry: TesterRegistry, options: DetectionOptions) -> Detector {
    let source = MemorySource::new(vec![gradient(), gradient()]).expect("valid source");
    Detector::new(Arc::new(source), Arc::new(registry), options).expect("valid detector")
}

// ── Construction ───────────────────────────────────────────────────

#[test]
fn detector_rejects_empty_registry() {
    let source = Arc::new(MemorySource::new(vec![gradient()]).unwrap());
    match Detector::new(source, Arc::new(TesterRegistry::new()), quick_options()) {
        Err(UnscaleError::InvalidParameter(_)) => {}
        other => panic!("Expected InvalidParameter, got: {:?}", other.err()),
    }
}

#[test]
fn detector_rejects_invalid_options() {
    let source = Arc::new(MemorySource::new(vec![gradient()]).unwrap());
    let result = Detector::new(
        source,
        Arc::new(resize_registry()),
        quick_options().with_workers(0),
    );
    assert!(matches!(result, Err(UnscaleError::InvalidParameter(_))));
}

#[test]
fn probe_reports_source_properties() {
    let detector = memory_detector(resize_registry(), quick_options());
    let info = detector.probe().unwrap();
    assert_eq!((info.width, info.height, info.frame_count), (64, 36, 2));
    assert_eq!(detector.options().workers(), 2);
}

// ── Runs ───────────────────────────────────────────────────────────

#[test]
fn run_collects_one_curve_per_tester() {
    let detector = memory_detector(resize_registry(), quick_options());
    let heights: Vec<u32> = (10..30).step_by(2).collect();

    let mut seen = 0;
    let report = detector.run(&[0, 1], &heights, |_| seen += 1).unwrap();

    assert_eq!(seen, 2 * 2 * 10);
    assert_eq!(report.delivered, 40);
    assert_eq!(report.lost_items, 0);
    assert_eq!(report.restarts, 0);
    assert_eq!(report.video.width, 64);

    let names: Vec<&str> = report.curves.iter().map(|curve| &**curve.tester()).collect();
    assert_eq!(names, ["triangle", "catrom"]);

    let curve = report.curve("catrom").expect("catrom curve");
    assert_eq!(curve.len(), 20);
    assert_eq!(curve.points().len(), 10);
    assert!(curve.points().iter().all(|&(_, score)| score >= 0.0));
    assert!(report.curve("lanczos").is_none());
}

#[test]
fn run_breakpoints_come_from_the_curves() {
    let detector = memory_detector(resize_registry(), quick_options());
    let heights: Vec<u32> = (10..30).step_by(2).collect();
    let report = detector.run(&[0], &heights, |_| {}).unwrap();

    let expected: Vec<_> = report
        .curves
        .iter()
        .flat_map(|curve| curve.breakpoints(5.0))
        .collect();
    let breakpoints = report.breakpoints(5.0);
    assert_eq!(breakpoints.len(), expected.len());
    for (found, wanted) in breakpoints.iter().zip(&expected) {
        assert_eq!((&found.tester, found.height), (&wanted.tester, wanted.height));
    }
}

#[test]
fn run_finds_the_native_height_of_an_upscaled_frame() {
    // Rendered at 42x24, then upscaled to 64x36 with the kernel under test.
    let native = RgbImage::from_fn(42, 24, |x, y| {
        Rgb([
            ((x * 37 + y * 91) % 256) as u8,
            (((x * y * 13) ^ (x * 7 + y * 3)) % 256) as u8,
            (((x * x + y * y) * 11) % 256) as u8,
        ])
    });
    let upscaled = image::imageops::resize(&native, 64, 36, FilterType::CatmullRom);

    let mut registry = TesterRegistry::new();
    registry.register("catrom", "red", Arc::new(ResizeTester::new(FilterType::CatmullRom)));
    let detector = Detector::new(
        Arc::new(MemorySource::new(vec![upscaled]).unwrap()),
        Arc::new(registry),
        quick_options(),
    )
    .unwrap();

    let heights: Vec<u32> = (12..35).collect();
    let report = detector.run(&[0], &heights, |_| {}).unwrap();
    assert_eq!(report.delivered, heights.len() as u64);

    let curve = report.curve("catrom").expect("catrom curve");
    let native_score = curve.score_at(24).unwrap();
    assert!(native_score < curve.score_at(23).unwrap());
    assert!(native_score < curve.score_at(25).unwrap());

    let breakpoints = report.breakpoints(5.0);
    let found: Vec<(&str, u32)> = breakpoints
        .iter()
        .map(|breakpoint| (&*breakpoint.tester, breakpoint.height))
        .collect();
    assert_eq!(found, [("catrom", 24)]);
    assert_eq!(breakpoints[0].score, native_score);
}

#[test]
fn run_rejects_bad_parameters_before_starting() {
    let detector = memory_detector(resize_registry(), quick_options());

    assert!(matches!(
        detector.run(&[0], &[], |_| {}),
        Err(UnscaleError::InvalidParameter(_))
    ));
    assert!(matches!(
        detector.run(&[], &[10], |_| {}),
        Err(UnscaleError::InvalidParameter(_))
    ));
    assert!(matches!(
        detector.run(&[0], &[10, 0], |_| {}),
        Err(UnscaleError::InvalidParameter(_))
    ));
}

#[test]
fn run_rejects_heights_without_a_usable_width() {
    let narrow = quick_options().with_aspect_ratio(AspectRatio::new(1, 9).unwrap());
    let detector = memory_detector(resize_registry(), narrow);
    let mut seen = 0;
    assert!(matches!(
        detector.run(&[0], &[8, 18], |_| seen += 1),
        Err(UnscaleError::InvalidParameter(_))
    ));
    assert_eq!(seen, 0);

    let detector = memory_detector(resize_registry(), quick_options());
    assert!(matches!(
        detector.run(&[0], &[18, 3_000_000_000], |_| {}),
        Err(UnscaleError::InvalidParameter(_))
    ));
}

#[test]
fn run_rejects_frames_past_the_end() {
    let detector = memory_detector(resize_registry(), quick_options());
    match detector.run(&[0, 5], &[10], |_| {}) {
        Err(UnscaleError::FrameOutOfRange {
            frame_number,
            total_frames,
        }) => {
            assert_eq!(frame_number, 5);
            assert_eq!(total_frames, 2);
        }
        other => panic!("Expected FrameOutOfRange, got: {:?}", other.map(|report| report.delivered)),
    }
}

#[test]
fn run_fails_when_every_worker_dies() {
    let mut registry = TesterRegistry::new();
    registry.register("failing", "white", Arc::new(FailingTester));
    let detector = memory_detector(
        registry,
        quick_options().with_workers(1).with_max_restarts(1),
    );

    match detector.run(&[0], &[10, 12, 14, 16], |_| {}) {
        Err(UnscaleError::WorkersExhausted { pending }) => assert_eq!(pending, 2),
        other => panic!("Expected WorkersExhausted, got: {:?}", other.map(|report| report.delivered)),
    }
}

// ── render_candidate ───────────────────────────────────────────────

#[test]
fn render_candidate_returns_source_sized_frame() {
    let detector = memory_detector(resize_registry(), quick_options());
    let candidate = detector.render_candidate("catrom", 18, 1).unwrap();
    assert_eq!(candidate.dimensions(), (64, 36));
}

#[test]
fn render_candidate_validates_input() {
    let detector = memory_detector(resize_registry(), quick_options());
    assert!(matches!(
        detector.render_candidate("spline64", 18, 0),
        Err(UnscaleError::UnknownTester(_))
    ));
    assert!(matches!(
        detector.render_candidate("catrom", 0, 0),
        Err(UnscaleError::InvalidParameter(_))
    ));
    assert!(matches!(
        detector.render_candidate("catrom", 18, 9),
        Err(UnscaleError::FrameOutOfRange { .. })
    ));
    assert!(matches!(
        detector.render_candidate("catrom", u32::MAX, 0),
        Err(UnscaleError::InvalidParameter(_))
    ));
}

// ── Media files ────────────────────────────────────────────────────

#[test]
fn detects_on_a_media_file() {
    let path = "tests/fixtures/sample_video.mp4";
    if !Path::new(path).exists() {
        return;
    }

    let detector = Detector::new(
        Arc::new(MediaSource::new(path)),
        Arc::new(TesterRegistry::with_defaults().select(&["bilinear"]).unwrap()),
        quick_options(),
    )
    .unwrap();
    let heights: Vec<u32> = (600..=720).step_by(24).collect();
    let report = detector.run(&[0, 24], &heights, |_| {}).unwrap();

    assert_eq!(report.delivered, 2 * heights.len() as u64);
    assert_eq!(report.video.height, 720);
    assert_eq!(report.curves.len(), 1);
}
