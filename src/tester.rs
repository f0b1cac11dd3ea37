//! Rescaling testers.
//!
//! A [`Tester`] turns a reference frame into the frame a viewer would see if
//! the video had been produced at a smaller candidate resolution and upscaled
//! back: it downscales to the candidate size and restores the source size
//! with the same kernel. Testers are looked up by name in an explicit
//! [`TesterRegistry`] that is built once and shared by every worker.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use image::imageops::FilterType;
//! use unscale::{ResizeTester, TesterRegistry};
//!
//! let mut registry = TesterRegistry::with_defaults();
//! registry.register("nearest", "white", Arc::new(ResizeTester::new(FilterType::Nearest)));
//! assert_eq!(
//!     registry.names().iter().map(|name| &**name).collect::<Vec<_>>(),
//!     ["bilinear", "bicubic", "catrom", "lanczos", "nearest"],
//! );
//! ```

use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    sync::Arc,
};

use ffmpeg_next::{
    format::Pixel,
    frame::Video as VideoFrame,
    software::scaling::{Context as ScalingContext, Flags as ScalingFlags},
};
use image::{RgbImage, imageops::FilterType};

use crate::{error::UnscaleError, frame_space::Resolution, session::VideoInfo};

/// A named rescaling strategy.
pub trait Tester: Send + Sync {
    /// One-time setup against the source being analysed.
    ///
    /// Called once per worker before any frame is tested. Must be idempotent.
    fn init(&self, _info: &VideoInfo) -> Result<(), UnscaleError> {
        Ok(())
    }

    /// Downscale `frame` to `resolution` and restore it to its own size.
    fn test(&self, frame: &RgbImage, resolution: Resolution) -> Result<RgbImage, UnscaleError>;
}

/// A tester backed by FFmpeg's `swscale`.
#[derive(Debug, Clone, Copy)]
pub struct SwscaleTester {
    flags: ScalingFlags,
}

impl SwscaleTester {
    /// Use the given `swscale` interpolation flags for both directions.
    pub fn new(flags: ScalingFlags) -> Self {
        Self { flags }
    }

    fn scale(&self, source: &VideoFrame, width: u32, height: u32) -> Result<VideoFrame, UnscaleError> {
        let mut scaler = ScalingContext::get(
            Pixel::RGB24,
            source.width(),
            source.height(),
            Pixel::RGB24,
            width,
            height,
            self.flags,
        )?;
        let mut scaled = VideoFrame::empty();
        scaler.run(source, &mut scaled)?;
        Ok(scaled)
    }
}

impl Tester for SwscaleTester {
    fn init(&self, info: &VideoInfo) -> Result<(), UnscaleError> {
        ffmpeg_next::init()?;
        // Fails early on flag combinations this FFmpeg build rejects.
        ScalingContext::get(
            Pixel::RGB24,
            info.width,
            info.height,
            Pixel::RGB24,
            info.width,
            info.height,
            self.flags,
        )?;
        Ok(())
    }

    fn test(&self, frame: &RgbImage, resolution: Resolution) -> Result<RgbImage, UnscaleError> {
        let (width, height) = frame.dimensions();
        let source = crate::utilities::rgb_image_to_frame(frame);
        let reduced = self.scale(&source, resolution.width, resolution.height)?;
        let restored = self.scale(&reduced, width, height)?;
        crate::utilities::frame_to_rgb_image(&restored, width, height)
    }
}

/// A tester backed by `image::imageops::resize`.
#[derive(Debug, Clone, Copy)]
pub struct ResizeTester {
    filter: FilterType,
}

impl ResizeTester {
    /// Use `filter` for both directions.
    pub fn new(filter: FilterType) -> Self {
        Self { filter }
    }
}

impl Tester for ResizeTester {
    fn test(&self, frame: &RgbImage, resolution: Resolution) -> Result<RgbImage, UnscaleError> {
        let (width, height) = frame.dimensions();
        let reduced =
            image::imageops::resize(frame, resolution.width, resolution.height, self.filter);
        Ok(image::imageops::resize(&reduced, width, height, self.filter))
    }
}

/// A registered tester with its display color.
#[derive(Clone)]
pub struct TesterEntry {
    /// Registry key.
    pub name: Arc<str>,
    /// Color name used when presenting this tester (e.g. `"green"`).
    pub color: String,
    /// The implementation.
    pub tester: Arc<dyn Tester>,
}

impl Debug for TesterEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("TesterEntry")
            .field("name", &self.name)
            .field("color", &self.color)
            .finish_non_exhaustive()
    }
}

/// Ordered mapping from tester name to implementation.
///
/// Iteration follows registration order, which also fixes the outermost
/// nesting level of a [`FrameSpace`](crate::FrameSpace).
#[derive(Debug, Clone, Default)]
pub struct TesterRegistry {
    entries: Vec<TesterEntry>,
}

impl TesterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock testers: `bilinear`, `bicubic`, `catrom` and `lanczos`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            "bilinear",
            "green",
            Arc::new(SwscaleTester::new(ScalingFlags::BILINEAR)),
        );
        registry.register(
            "bicubic",
            "blue",
            Arc::new(SwscaleTester::new(ScalingFlags::BICUBIC)),
        );
        registry.register(
            "catrom",
            "red",
            Arc::new(ResizeTester::new(FilterType::CatmullRom)),
        );
        registry.register(
            "lanczos",
            "yellow",
            Arc::new(SwscaleTester::new(ScalingFlags::LANCZOS)),
        );
        registry
    }

    /// Add a tester, replacing any earlier one with the same name in place.
    pub fn register(&mut self, name: &str, color: &str, tester: Arc<dyn Tester>) {
        let entry = TesterEntry {
            name: Arc::from(name),
            color: color.to_string(),
            tester,
        };
        match self.entries.iter_mut().find(|existing| &*existing.name == name) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    /// Look up a tester by name.
    pub fn get(&self, name: &str) -> Option<&TesterEntry> {
        self.entries.iter().find(|entry| &*entry.name == name)
    }

    /// Look up a tester by name, failing with [`UnscaleError::UnknownTester`].
    pub fn require(&self, name: &str) -> Result<&TesterEntry, UnscaleError> {
        self.get(name)
            .ok_or_else(|| UnscaleError::UnknownTester(name.to_string()))
    }

    /// Keep only the named testers, in the order given.
    ///
    /// # Errors
    ///
    /// Returns [`UnscaleError::UnknownTester`] for the first unknown name.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Self, UnscaleError> {
        let mut selected = Self::new();
        for name in names {
            let entry = self.require(name.as_ref())?;
            selected.entries.push(entry.clone());
        }
        Ok(selected)
    }

    /// Registered entries in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &TesterEntry> {
        self.entries.iter()
    }

    /// Registered names in registration order.
    pub fn names(&self) -> Vec<Arc<str>> {
        self.entries.iter().map(|entry| Arc::clone(&entry.name)).collect()
    }

    /// Number of registered testers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
