//! Error types for the `unscale` crate.
//!
//! This module defines [`UnscaleError`], the unified error type returned by all
//! fallible operations in the crate. Errors carry the context needed to tell
//! a bad parameter apart from a failing worker: file paths, frame numbers,
//! tester names and resolutions.

use std::{io::Error as IoError, path::PathBuf};

use ffmpeg_next::Error as FfmpegError;
use image::ImageError;
use thiserror::Error;

/// The unified error type for all `unscale` operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UnscaleError {
    /// The source could not be opened.
    #[error("Failed to open source at {path}: {reason}")]
    FileOpen {
        /// Path that was passed to the session source.
        path: PathBuf,
        /// Underlying reason the open failed.
        reason: String,
    },

    /// The file does not contain a video stream.
    #[error("No video stream found in file")]
    NoVideoStream,

    /// A video frame could not be decoded.
    #[error("Failed to decode video frame: {0}")]
    VideoDecodeError(String),

    /// The requested frame number exceeds the total frame count.
    #[error("Frame {frame_number} is out of range (source has {total_frames} frames)")]
    FrameOutOfRange {
        /// The frame number that was requested.
        frame_number: u64,
        /// The total number of frames in the source.
        total_frames: u64,
    },

    /// A range's start value is greater than or equal to its end value.
    #[error("Invalid range: start ({start}) must be less than stop ({stop})")]
    InvalidRange {
        /// The start of the range.
        start: String,
        /// The (exclusive) end of the range.
        stop: String,
    },

    /// A step value of zero was provided.
    #[error("Step must be greater than zero")]
    InvalidInterval,

    /// An aspect ratio was malformed or had a zero component.
    #[error("Invalid aspect ratio: {0}")]
    InvalidAspectRatio(String),

    /// A numeric or structural parameter was rejected before scheduling.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Two frames that must share dimensions did not.
    #[error("Frame dimensions differ: expected {expected_width}x{expected_height}, got {actual_width}x{actual_height}")]
    DimensionMismatch {
        /// Width of the reference frame.
        expected_width: u32,
        /// Height of the reference frame.
        expected_height: u32,
        /// Width of the candidate frame.
        actual_width: u32,
        /// Height of the candidate frame.
        actual_height: u32,
    },

    /// A work item named a tester that is not registered.
    #[error("Unknown tester: {0}")]
    UnknownTester(String),

    /// A tester failed to produce the rescaled frame.
    #[error("Tester {tester} failed at {width}x{height}: {reason}")]
    RescaleError {
        /// Name of the tester.
        tester: String,
        /// Candidate width.
        width: u32,
        /// Candidate height.
        height: u32,
        /// Underlying reason.
        reason: String,
    },

    /// A work item referenced a frame that the worker did not prime.
    #[error("Frame {0} is not a primed reference frame")]
    MissingReference(u64),

    /// Every worker died while work items were still pending.
    #[error("All workers exited with {pending} work item(s) still pending")]
    WorkersExhausted {
        /// Items that were never scored.
        pending: u64,
    },

    /// The operation was cancelled via a [`CancellationToken`](crate::CancellationToken).
    #[error("Operation cancelled")]
    Cancelled,

    /// An error originating from the FFmpeg libraries.
    #[error("FFmpeg error: {0}")]
    FfmpegError(String),

    /// An I/O error occurred (including failure to spawn a worker thread).
    #[error("I/O error: {0}")]
    IoError(#[from] IoError),

    /// An error from the `image` crate.
    #[error("Image processing error: {0}")]
    ImageError(#[from] ImageError),
}

impl From<FfmpegError> for UnscaleError {
    fn from(error: FfmpegError) -> Self {
        UnscaleError::FfmpegError(error.to_string())
    }
}
