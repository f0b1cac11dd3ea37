//! Breakpoint detection on similarity curves.
//!
//! A native resolution shows up as a sudden change in how quickly the score
//! improves as the candidate height grows. The detector therefore works on
//! the first differences of the height-ordered curve and flags the ones whose
//! modified z-score (Iglewicz and Hoaglin) exceeds a threshold:
//!
//! ```text
//! M_i = 0.6745 * |x_i - median(x)| / MAD
//! ```
//!
//! Adjacent flagged differences form one run and yield at most one
//! candidate. A negative difference is a drop followed by a recovery and is
//! never a candidate on its own.
//!
//! # Example
//!
//! ```
//! use unscale::outlier::breakpoint_indices;
//!
//! let deltas = [0.0, 0.0, 0.0, 0.5, 0.0, 0.0, 0.0, -0.5, 0.0, 0.0];
//! assert_eq!(breakpoint_indices(&deltas, 1.0), vec![3]);
//! ```

use std::{cmp::Ordering, collections::BTreeMap, sync::Arc};

/// Scale that makes the MAD consistent with a normal standard deviation.
pub const MODIFIED_Z_SCALE: f64 = 0.6745;

/// Scale applied to the mean absolute deviation when the MAD is zero.
pub const MEAN_ABSOLUTE_SCALE: f64 = 1.253314;

/// Fewest differences that give the statistics any meaning.
pub const MIN_POINTS: usize = 3;

/// Median of `values`; `0.0` for an empty slice.
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Modified z-score of every value.
///
/// Falls back to `|x - median| / (1.253314 * mean_abs_deviation)` when the
/// MAD is zero. Returns all zeros when both are zero or there are fewer than
/// [`MIN_POINTS`] values.
pub fn modified_z_scores(values: &[f64]) -> Vec<f64> {
    if values.len() < MIN_POINTS {
        return vec![0.0; values.len()];
    }

    let center = median(values);
    let deviations: Vec<f64> = values.iter().map(|value| (value - center).abs()).collect();
    let mad = median(&deviations);

    if mad > 0.0 {
        return deviations
            .iter()
            .map(|deviation| MODIFIED_Z_SCALE * deviation / mad)
            .collect();
    }

    let mean_deviation = deviations.iter().sum::<f64>() / deviations.len() as f64;
    if mean_deviation > 0.0 {
        deviations
            .iter()
            .map(|deviation| deviation / (MEAN_ABSOLUTE_SCALE * mean_deviation))
            .collect()
    } else {
        vec![0.0; values.len()]
    }
}

/// Indices whose modified z-score exceeds `threshold`.
pub fn outlier_indices(values: &[f64], threshold: f64) -> Vec<usize> {
    modified_z_scores(values)
        .into_iter()
        .enumerate()
        .filter(|&(_, score)| score > threshold)
        .map(|(index, _)| index)
        .collect()
}

/// Outlier indices after run merging.
///
/// Consecutive outliers form a run. The first non-negative member of a run
/// is its candidate; a run with only negative members yields nothing.
pub fn breakpoint_indices(values: &[f64], threshold: f64) -> Vec<usize> {
    let mut candidates = Vec::new();
    let mut previous: Option<usize> = None;
    let mut run_has_candidate = false;

    for index in outlier_indices(values, threshold) {
        let continues_run = previous.is_some_and(|previous| index - previous <= 1);
        if !continues_run {
            run_has_candidate = false;
        }
        if !run_has_candidate && values[index] >= 0.0 {
            candidates.push(index);
            run_has_candidate = true;
        }
        previous = Some(index);
    }
    candidates
}

/// One first difference of a similarity curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivativePoint {
    /// The lower of the two heights the difference spans.
    pub height: u32,
    /// `score(next height) - score(height)`.
    pub delta: f64,
}

/// First differences of `(height, score)` points, after sorting by height.
///
/// Each difference belongs to the height it starts from. A native resolution
/// is a dip in the curve: the drop into it is negative and skipped, and the
/// recovery out of it is attributed to the native height itself.
pub fn derivative(points: &[(u32, f64)]) -> Vec<DerivativePoint> {
    let mut sorted = points.to_vec();
    sorted.sort_by_key(|&(height, _)| height);

    sorted
        .windows(2)
        .map(|pair| DerivativePoint {
            height: pair[0].0,
            delta: pair[1].1 - pair[0].1,
        })
        .collect()
}

/// Heights of the breakpoints in a derivative series.
pub fn detect(series: &[DerivativePoint], threshold: f64) -> Vec<u32> {
    let deltas: Vec<f64> = series.iter().map(|point| point.delta).collect();
    breakpoint_indices(&deltas, threshold)
        .into_iter()
        .map(|index| series[index].height)
        .collect()
}

/// A candidate native resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Breakpoint {
    /// Tester whose curve shows the break.
    pub tester: Arc<str>,
    /// Candidate height.
    pub height: u32,
    /// Mean score (an unnormalised distance) at that height.
    pub score: f64,
}

/// Scores collected for one tester.
///
/// Samples arrive in any order and possibly several per height (one per
/// reference frame); [`points`](SimilarityCurve::points) averages them per
/// height and sorts by height.
#[derive(Debug, Clone)]
pub struct SimilarityCurve {
    tester: Arc<str>,
    samples: Vec<(u32, f64)>,
}

impl SimilarityCurve {
    /// An empty curve for `tester`.
    pub fn new(tester: Arc<str>) -> Self {
        Self {
            tester,
            samples: Vec::new(),
        }
    }

    /// Tester this curve belongs to.
    pub fn tester(&self) -> &Arc<str> {
        &self.tester
    }

    /// Record one score.
    pub fn push(&mut self, height: u32, score: f64) {
        self.samples.push((height, score));
    }

    /// Raw samples in arrival order.
    pub fn samples(&self) -> &[(u32, f64)] {
        &self.samples
    }

    /// Number of raw samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// `true` when nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Mean score per height, sorted by height.
    pub fn points(&self) -> Vec<(u32, f64)> {
        let mut totals: BTreeMap<u32, (f64, u32)> = BTreeMap::new();
        for &(height, score) in &self.samples {
            let total = totals.entry(height).or_insert((0.0, 0));
            total.0 += score;
            total.1 += 1;
        }
        totals
            .into_iter()
            .map(|(height, (sum, count))| (height, sum / f64::from(count)))
            .collect()
    }

    /// Mean score at `height`, if any sample was recorded there.
    pub fn score_at(&self, height: u32) -> Option<f64> {
        let scores: Vec<f64> = self
            .samples
            .iter()
            .filter(|&&(sample_height, _)| sample_height == height)
            .map(|&(_, score)| score)
            .collect();
        (!scores.is_empty()).then(|| scores.iter().sum::<f64>() / scores.len() as f64)
    }

    /// First differences of [`points`](SimilarityCurve::points).
    pub fn derivative(&self) -> Vec<DerivativePoint> {
        derivative(&self.points())
    }

    /// Candidate native resolutions at `threshold`.
    pub fn breakpoints(&self, threshold: f64) -> Vec<Breakpoint> {
        let points = self.points();
        detect(&derivative(&points), threshold)
            .into_iter()
            .filter_map(|height| {
                let score = points
                    .iter()
                    .find(|&&(point_height, _)| point_height == height)
                    .map(|&(_, score)| score)?;
                Some(Breakpoint {
                    tester: Arc::clone(&self.tester),
                    height,
                    score,
                })
            })
            .collect()
    }
}
