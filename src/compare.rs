//! Frame comparison.
//!
//! [`compare`] is a root-mean-weighted difference metric: it builds the
//! per-channel histogram of absolute pixel differences, weights every bin by
//! the difference it counts, averages over the pixel count and takes the
//! square root. Large differences therefore weigh more than many small ones.
//! It is a distance, not a perceptual quality metric.
//!
//! ```
//! use image::RgbImage;
//! use unscale::compare;
//!
//! let frame = RgbImage::from_pixel(4, 4, image::Rgb([12, 34, 56]));
//! assert_eq!(compare(&frame, &frame)?, 0.0);
//! # Ok::<(), unscale::UnscaleError>(())
//! ```

use image::RgbImage;

use crate::error::UnscaleError;

/// Bins per colour channel.
pub const CHANNEL_BINS: usize = 256;

/// Total bins of a flattened RGB difference histogram.
pub const HISTOGRAM_BINS: usize = CHANNEL_BINS * 3;

fn ensure_same_dimensions(candidate: &RgbImage, reference: &RgbImage) -> Result<(), UnscaleError> {
    if candidate.dimensions() != reference.dimensions() {
        return Err(UnscaleError::DimensionMismatch {
            expected_width: reference.width(),
            expected_height: reference.height(),
            actual_width: candidate.width(),
            actual_height: candidate.height(),
        });
    }
    Ok(())
}

/// Histogram of absolute per-channel differences, flattened R, G, B.
///
/// Bin `c * 256 + d` counts the pixels whose channel `c` differs by `d`.
pub fn difference_histogram(
    candidate: &RgbImage,
    reference: &RgbImage,
) -> Result<[u64; HISTOGRAM_BINS], UnscaleError> {
    ensure_same_dimensions(candidate, reference)?;

    let mut histogram = [0_u64; HISTOGRAM_BINS];
    for (left, right) in candidate.pixels().zip(reference.pixels()) {
        for channel in 0..3 {
            let difference = left.0[channel].abs_diff(right.0[channel]) as usize;
            histogram[channel * CHANNEL_BINS + difference] += 1;
        }
    }
    Ok(histogram)
}

/// Distance between two equally sized frames. Zero for identical frames.
///
/// # Errors
///
/// Returns [`UnscaleError::DimensionMismatch`] if the frames differ in size.
pub fn compare(candidate: &RgbImage, reference: &RgbImage) -> Result<f64, UnscaleError> {
    let histogram = difference_histogram(candidate, reference)?;

    let pixel_count = reference.width() as f64 * reference.height() as f64;
    if pixel_count == 0.0 {
        return Ok(0.0);
    }

    let weighted: f64 = histogram
        .chunks_exact(CHANNEL_BINS)
        .flat_map(|channel| channel.iter().enumerate())
        .map(|(difference, &count)| difference as f64 * count as f64)
        .sum();

    Ok((weighted / pixel_count).sqrt())
}

/// A rendered reference frame and its self-comparison baseline.
///
/// Each worker renders its own reference frames once at startup; they are
/// never shared between workers.
#[derive(Debug, Clone)]
pub struct ReferenceFrame {
    /// Frame index in the source.
    pub index: u64,
    /// The rendered frame at source resolution.
    pub image: RgbImage,
    /// `compare(image, image)`, kept as the normalising denominator.
    pub baseline: f64,
}

impl ReferenceFrame {
    /// Cache `image` as the reference for frame `index`.
    pub fn new(index: u64, image: RgbImage) -> Result<Self, UnscaleError> {
        let baseline = compare(&image, &image)?;
        Ok(Self {
            index,
            image,
            baseline,
        })
    }

    /// Score a candidate against this reference.
    ///
    /// The distance is divided by the baseline; a zero baseline, the usual
    /// case, leaves the distance as is, so the result is not bounded by 1.
    pub fn score(&self, candidate: &RgbImage) -> Result<f64, UnscaleError> {
        let distance = compare(candidate, &self.image)?;
        if self.baseline > 0.0 {
            Ok(distance / self.baseline)
        } else {
            Ok(distance)
        }
    }
}
