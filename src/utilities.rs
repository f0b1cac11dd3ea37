//! Internal helpers shared by the FFmpeg-backed session and testers.
//!
//! Pixel copies between padded FFmpeg planes and tightly packed
//! [`image::RgbImage`] buffers, and timestamp/frame-number conversions.

use ffmpeg_next::{Rational, format::Pixel, frame::Video as VideoFrame};
use image::RgbImage;

use crate::error::UnscaleError;

const RGB_BYTES_PER_PIXEL: usize = 3;

/// Copy an RGB24 FFmpeg frame into an [`RgbImage`], dropping row padding.
pub(crate) fn frame_to_rgb_image(
    video_frame: &VideoFrame,
    width: u32,
    height: u32,
) -> Result<RgbImage, UnscaleError> {
    let stride = video_frame.stride(0);
    let row_bytes = (width as usize) * RGB_BYTES_PER_PIXEL;
    let data = video_frame.data(0);

    let buffer = if stride == row_bytes {
        data[..row_bytes * (height as usize)].to_vec()
    } else {
        let mut buffer = Vec::with_capacity(row_bytes * (height as usize));
        for row in 0..(height as usize) {
            let row_start = row * stride;
            buffer.extend_from_slice(&data[row_start..row_start + row_bytes]);
        }
        buffer
    };

    RgbImage::from_raw(width, height, buffer).ok_or_else(|| {
        UnscaleError::VideoDecodeError(
            "Failed to construct RGB image from decoded frame data".to_string(),
        )
    })
}

/// Copy an [`RgbImage`] into a freshly allocated RGB24 FFmpeg frame.
pub(crate) fn rgb_image_to_frame(image: &RgbImage) -> VideoFrame {
    let (width, height) = image.dimensions();
    let mut video_frame = VideoFrame::new(Pixel::RGB24, width, height);
    let stride = video_frame.stride(0);
    let row_bytes = (width as usize) * RGB_BYTES_PER_PIXEL;
    let source = image.as_raw();
    let plane = video_frame.data_mut(0);

    for row in 0..(height as usize) {
        let from = row * row_bytes;
        let to = row * stride;
        plane[to..to + row_bytes].copy_from_slice(&source[from..from + row_bytes]);
    }
    video_frame
}

/// Rescale a PTS value to a frame number.
pub(crate) fn pts_to_frame_number(pts: i64, time_base: Rational, frames_per_second: f64) -> u64 {
    let seconds = pts as f64 * time_base.numerator() as f64 / time_base.denominator() as f64;
    (seconds.max(0.0) * frames_per_second) as u64
}

/// Convert a frame number to a seek timestamp in AV_TIME_BASE (microseconds).
///
/// `Input::seek` with no stream index expects container-level timestamps.
pub(crate) fn frame_number_to_seek_timestamp(frame_number: u64, frames_per_second: f64) -> i64 {
    let seconds = frame_number as f64 / frames_per_second;
    (seconds * 1_000_000.0) as i64
}
