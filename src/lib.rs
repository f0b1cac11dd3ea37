//! # unscale
//!
//! Infer the native resolution of upscaled video.
//!
//! `unscale` downscales reference frames to many candidate resolutions with a
//! set of rescaling "testers", restores them to the source size, and scores
//! how far each round trip lands from the original. A video that was upscaled
//! from, say, 810p survives the 810p round trip almost untouched, which shows
//! up as a break in the per-tester similarity curve. Frames are decoded with
//! FFmpeg via the [`ffmpeg-next`](https://crates.io/crates/ffmpeg-next) crate.
//!
//! ## Quick Start
//!
//! ### Run a Detection
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use unscale::{DetectionOptions, Detector, MediaSource, StepRange, TesterRegistry};
//!
//! let detector = Detector::new(
//!     Arc::new(MediaSource::new("input.mkv")),
//!     Arc::new(TesterRegistry::with_defaults()),
//!     DetectionOptions::new().with_workers(8),
//! )
//! .unwrap();
//!
//! let frames = StepRange::new(0, 2400, 240).unwrap().values();
//! let heights: Vec<u32> = (600..=1000).step_by(2).collect();
//! let report = detector.run(&frames, &heights, |_| {}).unwrap();
//!
//! for breakpoint in report.breakpoints(5.0) {
//!     println!("{}@{}", breakpoint.height, breakpoint.tester);
//! }
//! ```
//!
//! ### Drive the Dispatcher Yourself
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use unscale::{AspectRatio, DetectionOptions, Dispatcher, FrameSpace, MediaSource, TesterRegistry};
//!
//! let registry = Arc::new(TesterRegistry::with_defaults());
//! let space = FrameSpace::new(registry.names(), vec![0], vec![720, 810, 900], AspectRatio::WIDESCREEN).unwrap();
//! let mut dispatcher = Dispatcher::schedule(
//!     space,
//!     Arc::new(MediaSource::new("input.mkv")),
//!     registry,
//!     &[0],
//!     &DetectionOptions::new(),
//! )
//! .unwrap();
//!
//! while dispatcher.advance(|result| println!("{}: {:.4}", result.tester, result.score)) {}
//! ```
//!
//! ## Features
//!
//! - **Lazy work space**: tester x frame x height enumeration without
//!   materialising the cross product
//! - **Crash-tolerant workers**: one thread and one private decoder per
//!   worker; failed workers are replaced, bounded per slot
//! - **Fair result polling**: round-robin over per-worker channels
//! - **Robust breakpoints**: median/MAD modified z-scores on the similarity
//!   derivative, with run merging
//! - **Pluggable testers**: `swscale` and `image` kernels out of the box,
//!   anything implementing [`Tester`] on top
//! - **Progress & cancellation**: cooperative callbacks and
//!   `CancellationToken` for long-running detections
//!
//! ## Requirements
//!
//! FFmpeg development libraries must be installed on your system.

pub mod compare;
pub mod config;
pub mod detector;
pub mod dispatcher;
pub mod error;
pub mod frame_space;
pub mod outlier;
pub mod progress;
pub mod session;
pub mod tester;
mod utilities;
pub mod worker;

pub use compare::{ReferenceFrame, compare, difference_histogram};
pub use config::DetectionOptions;
pub use detector::{DetectionReport, Detector};
pub use dispatcher::{ChannelRing, Dispatcher, Step, StopHandle, WorkerStatus};
pub use error::UnscaleError;
pub use frame_space::{AspectRatio, FrameSpace, Resolution, StepRange, WorkItem, get_resolution};
pub use outlier::{Breakpoint, DerivativePoint, SimilarityCurve};
pub use progress::{CancellationToken, ProgressCallback, ProgressInfo};
pub use session::{MediaSource, MemorySource, SessionSource, VideoInfo, VideoSession, set_ffmpeg_log_level};
pub use tester::{ResizeTester, SwscaleTester, Tester, TesterEntry, TesterRegistry};
pub use worker::{ScoreResult, WorkerEvent, WorkerEventKind, WorkerExit};
