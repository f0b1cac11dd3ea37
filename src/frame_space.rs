//! Work-space enumeration.
//!
//! A [`FrameSpace`] is the cross product of testers, reference frames and
//! candidate heights. Iterating it yields one [`WorkItem`] per combination in
//! a fixed nesting order (tester, then frame, then height), lazily and
//! deterministically, so the same space can be walked again by calling
//! [`FrameSpace::iter`] a second time.
//!
//! # Example
//!
//! ```
//! use unscale::{AspectRatio, FrameSpace};
//!
//! let space = FrameSpace::new(
//!     vec!["bilinear".into(), "bicubic".into()],
//!     vec![0, 24],
//!     vec![720, 810, 900],
//!     AspectRatio::WIDESCREEN,
//! )?;
//! assert_eq!(space.len(), 12);
//!
//! let first = space.iter().next().unwrap();
//! assert_eq!((&*first.tester, first.width, first.height, first.frame), ("bilinear", 1280, 720, 0));
//! # Ok::<(), unscale::UnscaleError>(())
//! ```

use std::{
    borrow::Borrow,
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
    sync::Arc,
};

use crate::error::UnscaleError;

/// A display aspect ratio such as `16:9`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AspectRatio {
    /// Horizontal component.
    pub width: u32,
    /// Vertical component.
    pub height: u32,
}

impl AspectRatio {
    /// The 16:9 ratio used by nearly all HD sources.
    pub const WIDESCREEN: AspectRatio = AspectRatio {
        width: 16,
        height: 9,
    };

    /// Create an aspect ratio, rejecting zero components.
    pub fn new(width: u32, height: u32) -> Result<Self, UnscaleError> {
        if width == 0 || height == 0 {
            return Err(UnscaleError::InvalidAspectRatio(format!(
                "{width}:{height} has a zero component"
            )));
        }
        Ok(Self { width, height })
    }
}

impl Default for AspectRatio {
    fn default() -> Self {
        Self::WIDESCREEN
    }
}

impl Display for AspectRatio {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}:{}", self.width, self.height)
    }
}

impl FromStr for AspectRatio {
    type Err = UnscaleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = value.trim().split(':').collect();
        if parts.len() != 2 {
            return Err(UnscaleError::InvalidAspectRatio(format!(
                "expected W:H, got {value:?}"
            )));
        }

        let parse = |part: &str| {
            part.trim().parse::<u32>().map_err(|_| {
                UnscaleError::InvalidAspectRatio(format!("{part:?} is not a whole number"))
            })
        };
        Self::new(parse(parts[0])?, parse(parts[1])?)
    }
}

/// A candidate output resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Resolution {
    /// Width in pixels. Always even when produced by [`get_resolution`].
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Display for Resolution {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Convert a candidate height to a resolution honouring `aspect`.
///
/// The width is rounded to the nearest even number so that codecs requiring
/// even dimensions accept it.
///
/// ```
/// use unscale::{AspectRatio, get_resolution};
///
/// let resolution = get_resolution(481, AspectRatio::WIDESCREEN)?;
/// assert_eq!((resolution.width, resolution.height), (854, 481));
/// # Ok::<(), unscale::UnscaleError>(())
/// ```
///
/// # Errors
///
/// Returns [`UnscaleError::InvalidParameter`] if `height` is zero, or if the
/// derived width rounds to zero or does not fit in a `u32`.
pub fn get_resolution(height: u32, aspect: AspectRatio) -> Result<Resolution, UnscaleError> {
    if height == 0 {
        return Err(UnscaleError::InvalidParameter(
            "candidate heights must be positive".to_string(),
        ));
    }

    let half_width =
        (f64::from(height) * f64::from(aspect.width) / f64::from(aspect.height) / 2.0).round();
    let width = half_width * 2.0;
    if width < 2.0 {
        return Err(UnscaleError::InvalidParameter(format!(
            "height {height} at {aspect} gives a zero width"
        )));
    }
    if width > f64::from(u32::MAX) {
        return Err(UnscaleError::InvalidParameter(format!(
            "height {height} at {aspect} gives a width that does not fit in 32 bits"
        )));
    }

    Ok(Resolution {
        width: width as u32,
        height,
    })
}

/// One unit of comparison work: score `tester` at `width`x`height` on `frame`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkItem {
    /// Name of the tester in the [`TesterRegistry`](crate::TesterRegistry).
    pub tester: Arc<str>,
    /// Candidate width.
    pub width: u32,
    /// Candidate height.
    pub height: u32,
    /// Reference frame index.
    pub frame: u64,
}

impl WorkItem {
    /// The candidate resolution of this item.
    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.width,
            height: self.height,
        }
    }
}

/// The cross product of testers, frames and candidate heights.
#[derive(Debug, Clone)]
pub struct FrameSpace {
    testers: Vec<Arc<str>>,
    frames: Vec<u64>,
    resolutions: Vec<Resolution>,
}

impl FrameSpace {
    /// Build a frame space.
    ///
    /// # Errors
    ///
    /// Returns [`UnscaleError::InvalidParameter`] if any list is empty or a
    /// height does not map to a usable resolution (see [`get_resolution`]).
    pub fn new(
        testers: Vec<Arc<str>>,
        frames: Vec<u64>,
        heights: Vec<u32>,
        aspect: AspectRatio,
    ) -> Result<Self, UnscaleError> {
        if testers.is_empty() {
            return Err(UnscaleError::InvalidParameter(
                "at least one tester is required".to_string(),
            ));
        }
        if frames.is_empty() {
            return Err(UnscaleError::InvalidParameter(
                "at least one frame index is required".to_string(),
            ));
        }
        if heights.is_empty() {
            return Err(UnscaleError::InvalidParameter(
                "at least one candidate height is required".to_string(),
            ));
        }
        let resolutions = heights
            .into_iter()
            .map(|height| get_resolution(height, aspect))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            testers,
            frames,
            resolutions,
        })
    }

    /// Tester names in enumeration order.
    pub fn testers(&self) -> &[Arc<str>] {
        &self.testers
    }

    /// Reference frame indices in enumeration order.
    pub fn frames(&self) -> &[u64] {
        &self.frames
    }

    /// Candidate resolutions in enumeration order.
    pub fn resolutions(&self) -> &[Resolution] {
        &self.resolutions
    }

    /// Total number of work items.
    pub fn len(&self) -> usize {
        self.testers.len() * self.frames.len() * self.resolutions.len()
    }

    /// Always `false` for a successfully constructed space.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lazily enumerate the work items.
    pub fn iter(&self) -> WorkItems<&FrameSpace> {
        WorkItems::new(self)
    }
}

impl IntoIterator for FrameSpace {
    type Item = WorkItem;
    type IntoIter = WorkItems<FrameSpace>;

    fn into_iter(self) -> Self::IntoIter {
        WorkItems::new(self)
    }
}

impl<'a> IntoIterator for &'a FrameSpace {
    type Item = WorkItem;
    type IntoIter = WorkItems<&'a FrameSpace>;

    fn into_iter(self) -> Self::IntoIter {
        WorkItems::new(self)
    }
}

/// Iterator over the items of a [`FrameSpace`], borrowed or owned.
#[derive(Debug, Clone)]
pub struct WorkItems<S> {
    space: S,
    position: usize,
    total: usize,
}

impl<S: Borrow<FrameSpace>> WorkItems<S> {
    fn new(space: S) -> Self {
        let total = space.borrow().len();
        Self {
            space,
            position: 0,
            total,
        }
    }
}

impl<S: Borrow<FrameSpace>> Iterator for WorkItems<S> {
    type Item = WorkItem;

    fn next(&mut self) -> Option<WorkItem> {
        if self.position >= self.total {
            return None;
        }

        let space = self.space.borrow();
        let per_tester = space.frames.len() * space.resolutions.len();
        let tester = &space.testers[self.position / per_tester];
        let within = self.position % per_tester;
        let frame = space.frames[within / space.resolutions.len()];
        let resolution = space.resolutions[within % space.resolutions.len()];
        self.position += 1;

        Some(WorkItem {
            tester: Arc::clone(tester),
            width: resolution.width,
            height: resolution.height,
            frame,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total - self.position;
        (remaining, Some(remaining))
    }
}

impl<S: Borrow<FrameSpace>> ExactSizeIterator for WorkItems<S> {}

/// A half-open stepped range, written `start:stop[:step]`.
///
/// Used for both frame indices and candidate heights on the command line.
///
/// ```
/// use unscale::StepRange;
///
/// let heights: StepRange = "700:720:4".parse()?;
/// assert_eq!(heights.values(), vec![700, 704, 708, 712, 716]);
/// # Ok::<(), unscale::UnscaleError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepRange {
    /// First value (inclusive).
    pub start: u64,
    /// End value (exclusive).
    pub stop: u64,
    /// Distance between values.
    pub step: u64,
}

impl StepRange {
    /// Create a range, validating `start < stop` and `step > 0`.
    pub fn new(start: u64, stop: u64, step: u64) -> Result<Self, UnscaleError> {
        if step == 0 {
            return Err(UnscaleError::InvalidInterval);
        }
        if start >= stop {
            return Err(UnscaleError::InvalidRange {
                start: start.to_string(),
                stop: stop.to_string(),
            });
        }
        Ok(Self { start, stop, step })
    }

    /// Every value in the range.
    pub fn values(&self) -> Vec<u64> {
        (self.start..self.stop).step_by(self.step as usize).collect()
    }
}

impl FromStr for StepRange {
    type Err = UnscaleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = value.trim().split(':').collect();
        if !(2..=3).contains(&parts.len()) {
            return Err(UnscaleError::InvalidParameter(format!(
                "expected start:stop[:step], got {value:?}"
            )));
        }

        let parse = |part: &str| {
            part.trim().parse::<u64>().map_err(|_| {
                UnscaleError::InvalidParameter(format!("{part:?} is not a whole number"))
            })
        };
        let step = match parts.get(2) {
            Some(part) => parse(part)?,
            None => 1,
        };
        Self::new(parse(parts[0])?, parse(parts[1])?, step)
    }
}
