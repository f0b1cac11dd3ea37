//! Video session tests.
//!
//! FFmpeg-backed tests require fixture files from
//! `tests/fixtures/generate_fixtures.sh`.

use std::path::Path;

use image::{Rgb, RgbImage};
use unscale::{MediaSource, MemorySource, SessionSource, UnscaleError, compare};

fn sample_video_path() -> &'static str {
    "tests/fixtures/sample_video.mp4"
}

fn solid(width: u32, height: u32, value: u8) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb([value, value, value]))
}

// ── MemorySource ───────────────────────────────────────────────────

#[test]
fn memory_source_serves_frames_in_order() {
    let source = MemorySource::new(vec![solid(8, 4, 10), solid(8, 4, 20), solid(8, 4, 30)]).unwrap();
    let mut session = source.open().unwrap();

    let info = session.video_info().clone();
    assert_eq!((info.width, info.height, info.frame_count), (8, 4, 3));
    assert_eq!(info.codec, "raw");

    assert_eq!(session.frame(1).unwrap().get_pixel(0, 0), &Rgb([20, 20, 20]));
    assert_eq!(session.frame(2).unwrap().get_pixel(7, 3), &Rgb([30, 30, 30]));
}

#[test]
fn memory_source_sessions_are_independent() {
    let source = MemorySource::new(vec![solid(4, 4, 1)]).unwrap();
    let mut first = source.open().unwrap();
    let mut second = source.open().unwrap();
    assert_eq!(first.frame(0).unwrap(), second.frame(0).unwrap());
}

#[test]
fn memory_source_frame_out_of_range() {
    let source = MemorySource::new(vec![solid(4, 4, 1), solid(4, 4, 2)]).unwrap();
    let mut session = source.open().unwrap();
    match session.frame(2) {
        Err(UnscaleError::FrameOutOfRange {
            frame_number,
            total_frames,
        }) => {
            assert_eq!(frame_number, 2);
            assert_eq!(total_frames, 2);
        }
        other => panic!("Expected FrameOutOfRange, got: {other:?}"),
    }
}

#[test]
fn memory_source_rejects_empty_and_mixed_sizes() {
    assert!(matches!(
        MemorySource::new(Vec::new()),
        Err(UnscaleError::InvalidParameter(_))
    ));
    assert!(matches!(
        MemorySource::new(vec![solid(4, 4, 0), solid(8, 4, 0)]),
        Err(UnscaleError::DimensionMismatch { .. })
    ));
}

#[test]
fn memory_source_loads_still_images() {
    let directory = tempfile::tempdir().expect("Failed to create temp dir");
    let first = directory.path().join("0001.png");
    let second = directory.path().join("0002.png");
    let gradient = RgbImage::from_fn(16, 9, |x, y| Rgb([(x * 10) as u8, (y * 20) as u8, 7]));
    gradient.save(&first).expect("Failed to write image");
    solid(16, 9, 200).save(&second).expect("Failed to write image");

    let source = MemorySource::open_images(&[&first, &second]).unwrap();
    assert_eq!(source.video_info().frame_count, 2);

    let mut session = source.open().unwrap();
    assert_eq!(compare(&session.frame(0).unwrap(), &gradient).unwrap(), 0.0);
    assert!(source.describe().contains("16x9"));
}

#[test]
fn memory_source_reports_missing_image() {
    let directory = tempfile::tempdir().expect("Failed to create temp dir");
    let missing = directory.path().join("missing.png");
    match MemorySource::open_images(&[&missing]) {
        Err(UnscaleError::FileOpen { path, .. }) => assert_eq!(path, missing),
        other => panic!("Expected FileOpen, got: {other:?}"),
    }
}

// ── MediaSource ────────────────────────────────────────────────────

#[test]
fn media_source_nonexistent_file() {
    let source = MediaSource::new("this_file_does_not_exist.mp4");
    let error = source.open().err().expect("opening a missing file should fail");
    let message = error.to_string();
    assert!(
        message.contains("Failed to open source"),
        "Error message should mention the failed open: {message}",
    );
}

#[test]
fn media_source_invalid_file() {
    let directory = tempfile::tempdir().expect("Failed to create temp dir");
    let path = directory.path().join("invalid.mp4");
    std::fs::write(&path, b"this is not a media file").expect("Failed to write invalid file");

    assert!(MediaSource::new(&path).open().is_err());
}

#[test]
fn media_source_reads_video_info() {
    let path = sample_video_path();
    if !Path::new(path).exists() {
        return;
    }

    let source = MediaSource::new(path);
    let session = source.open().expect("Failed to open fixture");
    let info = session.video_info();
    assert!(info.width > 0);
    assert!(info.height > 0);
    assert!(info.frames_per_second > 0.0);
    assert!(info.frame_count > 0);
}

#[test]
fn media_source_decodes_frames_at_source_size() {
    let path = sample_video_path();
    if !Path::new(path).exists() {
        return;
    }

    let mut session = MediaSource::new(path).open().expect("Failed to open fixture");
    let (width, height) = (session.video_info().width, session.video_info().height);

    let first = session.frame(0).expect("Failed to decode frame 0");
    assert_eq!(first.dimensions(), (width, height));

    // Decoding the same frame twice is deterministic.
    let again = session.frame(0).expect("Failed to decode frame 0 again");
    assert_eq!(compare(&first, &again).unwrap(), 0.0);
}

#[test]
fn media_source_frame_out_of_range() {
    let path = sample_video_path();
    if !Path::new(path).exists() {
        return;
    }

    let mut session = MediaSource::new(path).open().expect("Failed to open fixture");
    let total = session.video_info().frame_count;
    assert!(matches!(
        session.frame(total + 10),
        Err(UnscaleError::FrameOutOfRange { .. })
    ));
}
