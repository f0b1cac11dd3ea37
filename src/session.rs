//! Video sessions.
//!
//! A [`SessionSource`] describes where frames come from and opens a private
//! [`VideoSession`] on demand. Every worker opens its own session so that no
//! decoder state is shared between threads.
//!
//! Two sources are provided:
//!
//! - [`MediaSource`] decodes a media file with FFmpeg, seeking to the nearest
//!   keyframe and decoding forward to the requested frame.
//! - [`MemorySource`] serves already decoded images, either handed over
//!   directly or loaded from still image files.
//!
//! # Example
//!
//! ```no_run
//! use unscale::{MediaSource, SessionSource};
//!
//! let source = MediaSource::new("input.mkv");
//! let mut session = source.open()?;
//! println!("{}x{}", session.video_info().width, session.video_info().height);
//! let frame = session.frame(240)?;
//! frame.save("frame_240.png")?;
//! # Ok::<(), unscale::UnscaleError>(())
//! ```

use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    sync::Arc,
};

use ffmpeg_next::{
    codec::context::Context as CodecContext,
    format::{Pixel, context::Input},
    frame::Video as VideoFrame,
    media::Type,
    software::scaling::{Context as ScalingContext, Flags as ScalingFlags},
    util::log::Level,
};
use image::RgbImage;

use crate::error::UnscaleError;

/// Basic properties of a video source.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Number of frames, or `0` when unknown.
    pub frame_count: u64,
    /// Frames per second (approximate for variable-frame-rate content).
    pub frames_per_second: f64,
    /// Codec name, e.g. `"h264"`, or `"raw"` for in-memory sources.
    pub codec: String,
}

/// An open, private decoding session.
///
/// Sessions are deliberately not `Send`: they are created on the worker
/// thread that uses them.
pub trait VideoSession {
    /// Properties of the opened source.
    fn video_info(&self) -> &VideoInfo;

    /// Render frame `index` at source resolution.
    fn frame(&mut self, index: u64) -> Result<RgbImage, UnscaleError>;
}

/// A description of a video that can be opened any number of times.
pub trait SessionSource: Send + Sync {
    /// Open a fresh session.
    fn open(&self) -> Result<Box<dyn VideoSession>, UnscaleError>;

    /// Human-readable description used in logs.
    fn describe(&self) -> String;
}

/// A media file decoded with FFmpeg.
#[derive(Debug, Clone)]
pub struct MediaSource {
    path: PathBuf,
}

impl MediaSource {
    /// Describe the media file at `path`. Nothing is opened yet.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Path of the media file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionSource for MediaSource {
    fn open(&self) -> Result<Box<dyn VideoSession>, UnscaleError> {
        Ok(Box::new(MediaSession::open(&self.path)?))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// An FFmpeg demuxer positioned on the best video stream.
pub struct MediaSession {
    input_context: Input,
    stream_index: usize,
    info: VideoInfo,
}

impl Debug for MediaSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("MediaSession")
            .field("stream_index", &self.stream_index)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl MediaSession {
    /// Open `path` and read the best video stream's properties.
    ///
    /// # Errors
    ///
    /// Returns [`UnscaleError::FileOpen`] if the file cannot be opened, or
    /// [`UnscaleError::NoVideoStream`] if it has no video.
    pub fn open(path: &Path) -> Result<Self, UnscaleError> {
        log::debug!("Opening media file: {}", path.display());

        ffmpeg_next::init().map_err(|error| UnscaleError::FileOpen {
            path: path.to_path_buf(),
            reason: format!("FFmpeg initialisation failed: {error}"),
        })?;

        let input_context =
            ffmpeg_next::format::input(&path).map_err(|error| UnscaleError::FileOpen {
                path: path.to_path_buf(),
                reason: error.to_string(),
            })?;

        let stream = input_context
            .streams()
            .best(Type::Video)
            .ok_or(UnscaleError::NoVideoStream)?;
        let stream_index = stream.index();

        let decoder_context =
            CodecContext::from_parameters(stream.parameters()).map_err(|error| {
                UnscaleError::FileOpen {
                    path: path.to_path_buf(),
                    reason: format!("Failed to read video codec parameters: {error}"),
                }
            })?;
        let decoder = decoder_context
            .decoder()
            .video()
            .map_err(|error| UnscaleError::FileOpen {
                path: path.to_path_buf(),
                reason: format!("Failed to create video decoder: {error}"),
            })?;

        let frame_rate = stream.avg_frame_rate();
        let frames_per_second = if frame_rate.denominator() != 0 {
            frame_rate.numerator() as f64 / frame_rate.denominator() as f64
        } else {
            let rate = stream.rate();
            if rate.denominator() != 0 {
                rate.numerator() as f64 / rate.denominator() as f64
            } else {
                0.0
            }
        };

        let duration_microseconds = input_context.duration();
        let frame_count = if duration_microseconds > 0 && frames_per_second > 0.0 {
            (duration_microseconds as f64 / 1_000_000.0 * frames_per_second) as u64
        } else {
            0
        };

        let info = VideoInfo {
            width: decoder.width(),
            height: decoder.height(),
            frame_count,
            frames_per_second,
            codec: decoder
                .codec()
                .map(|codec| codec.name().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        };

        log::debug!(
            "Video stream {}: {}x{}, {:.3} fps, codec={}, ~{} frames",
            stream_index,
            info.width,
            info.height,
            info.frames_per_second,
            info.codec,
            info.frame_count,
        );

        Ok(Self {
            input_context,
            stream_index,
            info,
        })
    }
}

impl VideoSession for MediaSession {
    fn video_info(&self) -> &VideoInfo {
        &self.info
    }

    fn frame(&mut self, index: u64) -> Result<RgbImage, UnscaleError> {
        let total_frames = self.info.frame_count;
        if total_frames > 0 && index >= total_frames {
            return Err(UnscaleError::FrameOutOfRange {
                frame_number: index,
                total_frames,
            });
        }
        if self.info.frames_per_second <= 0.0 {
            return Err(UnscaleError::VideoDecodeError(
                "Cannot seek in a stream without a frame rate".to_string(),
            ));
        }

        let stream = self
            .input_context
            .stream(self.stream_index)
            .ok_or(UnscaleError::NoVideoStream)?;
        let time_base = stream.time_base();
        let decoder_context = CodecContext::from_parameters(stream.parameters())?;
        let mut decoder = decoder_context.decoder().video()?;

        let (width, height) = (self.info.width, self.info.height);
        let mut scaler = ScalingContext::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            Pixel::RGB24,
            width,
            height,
            ScalingFlags::BILINEAR,
        )?;

        let seek_timestamp =
            crate::utilities::frame_number_to_seek_timestamp(index, self.info.frames_per_second);
        self.input_context.seek(seek_timestamp, ..seek_timestamp)?;

        let mut decoded_frame = VideoFrame::empty();
        let mut rgb_frame = VideoFrame::empty();
        let frames_per_second = self.info.frames_per_second;
        let stream_index = self.stream_index;

        // A seek may land after the target on sparse keyframes; the first
        // frame at or past the target is returned in that case.
        for (stream, packet) in self.input_context.packets() {
            if stream.index() != stream_index {
                continue;
            }

            decoder.send_packet(&packet)?;
            while decoder.receive_frame(&mut decoded_frame).is_ok() {
                let pts = decoded_frame.pts().unwrap_or(0);
                let current =
                    crate::utilities::pts_to_frame_number(pts, time_base, frames_per_second);
                if current >= index {
                    scaler.run(&decoded_frame, &mut rgb_frame)?;
                    return crate::utilities::frame_to_rgb_image(&rgb_frame, width, height);
                }
            }
        }

        decoder.send_eof()?;
        while decoder.receive_frame(&mut decoded_frame).is_ok() {
            let pts = decoded_frame.pts().unwrap_or(0);
            let current = crate::utilities::pts_to_frame_number(pts, time_base, frames_per_second);
            if current >= index {
                scaler.run(&decoded_frame, &mut rgb_frame)?;
                return crate::utilities::frame_to_rgb_image(&rgb_frame, width, height);
            }
        }

        Err(UnscaleError::VideoDecodeError(format!(
            "Could not locate frame {index} in the video stream"
        )))
    }
}

/// Already decoded frames held in memory.
///
/// Cloning is cheap; all sessions opened from the same source share the
/// frame buffers read-only.
#[derive(Clone)]
pub struct MemorySource {
    frames: Arc<[RgbImage]>,
    info: VideoInfo,
}

impl Debug for MemorySource {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("MemorySource")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl MemorySource {
    /// Serve `frames` as a clip. All frames must share the first frame's size.
    ///
    /// # Errors
    ///
    /// Returns [`UnscaleError::InvalidParameter`] for an empty list and
    /// [`UnscaleError::DimensionMismatch`] for frames of differing size.
    pub fn new(frames: Vec<RgbImage>) -> Result<Self, UnscaleError> {
        let first = frames.first().ok_or_else(|| {
            UnscaleError::InvalidParameter("a memory source needs at least one frame".to_string())
        })?;
        let (width, height) = first.dimensions();

        if let Some(odd) = frames.iter().find(|frame| frame.dimensions() != (width, height)) {
            return Err(UnscaleError::DimensionMismatch {
                expected_width: width,
                expected_height: height,
                actual_width: odd.width(),
                actual_height: odd.height(),
            });
        }

        let info = VideoInfo {
            width,
            height,
            frame_count: frames.len() as u64,
            frames_per_second: 0.0,
            codec: "raw".to_string(),
        };
        Ok(Self {
            frames: frames.into(),
            info,
        })
    }

    /// Load still images from disk, one frame per file, in the given order.
    pub fn open_images<P: AsRef<Path>>(paths: &[P]) -> Result<Self, UnscaleError> {
        let mut frames = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let image = image::open(path).map_err(|error| UnscaleError::FileOpen {
                path: path.to_path_buf(),
                reason: error.to_string(),
            })?;
            frames.push(image.to_rgb8());
        }
        Self::new(frames)
    }

    /// Properties of the clip.
    pub fn video_info(&self) -> &VideoInfo {
        &self.info
    }
}

impl SessionSource for MemorySource {
    fn open(&self) -> Result<Box<dyn VideoSession>, UnscaleError> {
        Ok(Box::new(MemorySession {
            frames: Arc::clone(&self.frames),
            info: self.info.clone(),
        }))
    }

    fn describe(&self) -> String {
        format!(
            "{} in-memory frame(s) at {}x{}",
            self.frames.len(),
            self.info.width,
            self.info.height
        )
    }
}

struct MemorySession {
    frames: Arc<[RgbImage]>,
    info: VideoInfo,
}

impl VideoSession for MemorySession {
    fn video_info(&self) -> &VideoInfo {
        &self.info
    }

    fn frame(&mut self, index: u64) -> Result<RgbImage, UnscaleError> {
        self.frames
            .get(index as usize)
            .cloned()
            .ok_or(UnscaleError::FrameOutOfRange {
                frame_number: index,
                total_frames: self.info.frame_count,
            })
    }
}

/// Set FFmpeg's own console verbosity from a `log` level filter.
///
/// FFmpeg logs through its own channel to stderr; this keeps it in step with
/// the level chosen for the Rust side.
pub fn set_ffmpeg_log_level(level: log::LevelFilter) {
    let level = match level {
        log::LevelFilter::Off => Level::Quiet,
        log::LevelFilter::Error => Level::Error,
        log::LevelFilter::Warn => Level::Warning,
        log::LevelFilter::Info => Level::Info,
        log::LevelFilter::Debug => Level::Debug,
        log::LevelFilter::Trace => Level::Trace,
    };
    ffmpeg_next::util::log::set_level(level);
}
