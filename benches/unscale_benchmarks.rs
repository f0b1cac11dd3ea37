//! Benchmarks for comparison, rescaling and breakpoint detection.
//!
//! Run with: cargo bench
//!
//! The media benchmark requires fixture files from
//! `tests/fixtures/generate_fixtures.sh`.

use std::{hint::black_box, path::Path, sync::Arc, time::Duration};

use criterion::Criterion;
use ffmpeg_next::software::scaling::Flags as ScalingFlags;
use image::{Rgb, RgbImage, imageops::FilterType};
use unscale::{
    AspectRatio, DetectionOptions, Detector, MediaSource, MemorySource, ResizeTester,
    SimilarityCurve, SwscaleTester, Tester, TesterRegistry, VideoInfo, compare, get_resolution,
    outlier::breakpoint_indices,
};

const SAMPLE_VIDEO: &str = "tests/fixtures/sample_video.mp4";

fn frame_1080p() -> RgbImage {
    RgbImage::from_fn(1920, 1080, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x ^ y) % 256) as u8])
    })
}

fn benchmark_compare(criterion: &mut Criterion) {
    let reference = frame_1080p();
    let candidate = RgbImage::from_fn(1920, 1080, |x, y| {
        Rgb([((x + 3) % 256) as u8, (y % 256) as u8, ((x ^ y) % 256) as u8])
    });

    criterion.bench_function("compare 1080p frames", |bencher| {
        bencher.iter(|| compare(black_box(&candidate), black_box(&reference)).unwrap());
    });
}

fn benchmark_testers(criterion: &mut Criterion) {
    ffmpeg_next::util::log::set_level(ffmpeg_next::util::log::Level::Error);

    let reference = frame_1080p();
    let info = VideoInfo {
        width: 1920,
        height: 1080,
        frame_count: 1,
        frames_per_second: 0.0,
        codec: "raw".to_string(),
    };
    let resolution = get_resolution(810, AspectRatio::WIDESCREEN).unwrap();

    let mut group = criterion.benchmark_group("rescale 1080p via 810p");
    group.sample_size(20);

    let swscale = SwscaleTester::new(ScalingFlags::BICUBIC);
    swscale.init(&info).unwrap();
    group.bench_function("swscale bicubic", |bencher| {
        bencher.iter(|| swscale.test(black_box(&reference), resolution).unwrap());
    });

    let resize = ResizeTester::new(FilterType::CatmullRom);
    group.bench_function("image catmull-rom", |bencher| {
        bencher.iter(|| resize.test(black_box(&reference), resolution).unwrap());
    });

    group.finish();
}

fn benchmark_breakpoints(criterion: &mut Criterion) {
    // A smooth curve with one step, over 400 candidate heights.
    let deltas: Vec<f64> = (0..400)
        .map(|index| if index == 250 { 0.4 } else { 0.001 * (index % 7) as f64 })
        .collect();

    criterion.bench_function("breakpoint indices (400 heights)", |bencher| {
        bencher.iter(|| breakpoint_indices(black_box(&deltas), 5.0));
    });

    criterion.bench_function("similarity curve breakpoints (400 heights x 8 frames)", |bencher| {
        bencher.iter(|| {
            let mut curve = SimilarityCurve::new(Arc::from("bilinear"));
            for frame in 0..8_u32 {
                for index in 0..400_u32 {
                    let score = if index >= 250 { 0.4 } else { 0.0 } + 0.0001 * f64::from(frame);
                    curve.push(500 + index, score);
                }
            }
            curve.breakpoints(5.0)
        });
    });
}

fn benchmark_detection(criterion: &mut Criterion) {
    let frame = RgbImage::from_fn(320, 180, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x * y) % 256) as u8])
    });
    let mut registry = TesterRegistry::new();
    registry.register("catrom", "red", Arc::new(ResizeTester::new(FilterType::CatmullRom)));
    let detector = Detector::new(
        Arc::new(MemorySource::new(vec![frame]).unwrap()),
        Arc::new(registry),
        DetectionOptions::new()
            .with_workers(4)
            .with_poll_timeout(Duration::from_millis(10))
            .with_report_interval(Duration::from_millis(10)),
    )
    .unwrap();
    let heights: Vec<u32> = (100..180).step_by(2).collect();

    let mut group = criterion.benchmark_group("detection");
    group.sample_size(10);
    group.bench_function("in-memory 180p, 40 heights, 4 workers", |bencher| {
        bencher.iter(|| detector.run(&[0], &heights, |_| {}).unwrap());
    });

    if Path::new(SAMPLE_VIDEO).exists() {
        let detector = Detector::new(
            Arc::new(MediaSource::new(SAMPLE_VIDEO)),
            Arc::new(TesterRegistry::with_defaults()),
            DetectionOptions::new().with_poll_timeout(Duration::from_millis(10)),
        )
        .unwrap();
        let heights: Vec<u32> = (600..=720).step_by(8).collect();
        group.bench_function("media file, default testers", |bencher| {
            bencher.iter(|| detector.run(&[0, 48], &heights, |_| {}).unwrap());
        });
    } else {
        eprintln!("Skipping media benchmark: fixture not found");
    }

    group.finish();
}

criterion::criterion_group!(
    benches,
    benchmark_compare,
    benchmark_testers,
    benchmark_breakpoints,
    benchmark_detection,
);
criterion::criterion_main!(benches);
