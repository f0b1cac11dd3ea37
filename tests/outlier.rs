//! Breakpoint detection tests.

use std::sync::Arc;

use unscale::{
    SimilarityCurve,
    outlier::{
        breakpoint_indices, derivative, detect, median, modified_z_scores, outlier_indices,
    },
};

// ── Statistics ─────────────────────────────────────────────────────

#[test]
fn median_of_odd_and_even_lengths() {
    assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
    assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), 2.5);
    assert_eq!(median(&[]), 0.0);
}

#[test]
fn z_scores_use_mad_when_available() {
    let values = [1.0, 2.0, 3.0, 4.0, 100.0];
    let scores = modified_z_scores(&values);
    // median 3, deviations [2,1,0,1,97], MAD 1
    assert!((scores[4] - 0.6745 * 97.0).abs() < 1e-9);
    assert_eq!(scores[2], 0.0);
}

#[test]
fn z_scores_fall_back_when_mad_is_zero() {
    let values = [0.0, 0.0, 0.0, 0.5, 0.0, 0.0, 0.0, -0.5, 0.0, 0.0];
    let scores = modified_z_scores(&values);
    // mean absolute deviation is 0.1
    let expected = 0.5 / (1.253314 * 0.1);
    assert!((scores[3] - expected).abs() < 1e-9);
    assert!((scores[7] - expected).abs() < 1e-9);
    assert_eq!(scores[0], 0.0);
}

#[test]
fn flat_series_has_no_outliers() {
    let values = [0.25; 12];
    assert!(modified_z_scores(&values).iter().all(|&score| score == 0.0));
    assert!(outlier_indices(&values, 0.0).is_empty());
    assert!(breakpoint_indices(&values, 0.0).is_empty());
}

#[test]
fn short_series_has_no_outliers() {
    assert!(breakpoint_indices(&[], 0.1).is_empty());
    assert!(breakpoint_indices(&[5.0], 0.1).is_empty());
    assert!(breakpoint_indices(&[0.0, 5.0], 0.1).is_empty());
}

// ── Run merging ────────────────────────────────────────────────────

#[test]
fn isolated_spike_yields_one_breakpoint() {
    let deltas = [0.0, 0.0, 0.0, 0.5, 0.0, 0.0, 0.0, -0.5, 0.0, 0.0];
    assert_eq!(outlier_indices(&deltas, 1.0), vec![3, 7]);
    assert_eq!(breakpoint_indices(&deltas, 1.0), vec![3]);
}

#[test]
fn adjacent_outliers_merge_into_the_earlier() {
    let deltas = [0.0, 0.0, 0.0, 0.5, 0.6, 0.0, 0.0, 0.0, 0.0, 0.0];
    assert_eq!(outlier_indices(&deltas, 1.0), vec![3, 4]);
    assert_eq!(breakpoint_indices(&deltas, 1.0), vec![3]);
}

#[test]
fn drop_then_recovery_uses_first_non_negative_member() {
    let deltas = [0.0, 0.0, 0.0, -0.5, 0.5, 0.0, 0.0, 0.0, 0.0, 0.0];
    assert_eq!(breakpoint_indices(&deltas, 1.0), vec![4]);
}

#[test]
fn separate_runs_each_yield_a_candidate() {
    let deltas = [0.0, 0.6, 0.0, 0.0, 0.0, 0.0, 0.7, 0.0, 0.0, 0.0];
    assert_eq!(breakpoint_indices(&deltas, 1.0), vec![1, 6]);
}

#[test]
fn high_threshold_suppresses_everything() {
    let deltas = [0.0, 0.0, 0.0, 0.5, 0.0, 0.0, 0.0, -0.5, 0.0, 0.0];
    assert!(breakpoint_indices(&deltas, 100.0).is_empty());
}

// ── Derivative ─────────────────────────────────────────────────────

/// Scores that improve slowly with height, with a dip at 708.
const DIP: [f64; 11] = [0.50, 0.49, 0.48, 0.47, 0.10, 0.45, 0.44, 0.43, 0.42, 0.41, 0.40];

fn dip_points() -> Vec<(u32, f64)> {
    DIP.iter()
        .enumerate()
        .map(|(index, &score)| (700 + 2 * index as u32, score))
        .collect()
}

#[test]
fn derivative_sorts_by_height_and_uses_starting_height() {
    let points = [(704, 0.3), (700, 0.1), (702, 0.15)];
    let series = derivative(&points);
    assert_eq!(series.len(), 2);
    assert_eq!(series[0].height, 700);
    assert!((series[0].delta - 0.05).abs() < 1e-12);
    assert_eq!(series[1].height, 702);
    assert!((series[1].delta - 0.15).abs() < 1e-12);
}

#[test]
fn detect_reports_the_bottom_of_a_dip() {
    let series = derivative(&dip_points());
    assert!(series[3].delta < 0.0);
    assert!(series[4].delta > 0.0);
    assert_eq!(detect(&series, 1.0), vec![708]);
}

// ── SimilarityCurve ────────────────────────────────────────────────

#[test]
fn curve_averages_frames_at_the_same_height() {
    let mut curve = SimilarityCurve::new(Arc::from("bilinear"));
    curve.push(720, 0.2);
    curve.push(700, 0.1);
    curve.push(720, 0.4);

    assert_eq!(curve.len(), 3);
    assert_eq!(curve.samples()[0], (720, 0.2));

    let points = curve.points();
    assert_eq!(points.len(), 2);
    assert_eq!(points[0], (700, 0.1));
    assert!((points[1].1 - 0.3).abs() < 1e-12);
    assert!((curve.score_at(720).unwrap() - 0.3).abs() < 1e-12);
    assert!(curve.score_at(710).is_none());
}

#[test]
fn curve_reports_breakpoints_with_scores() {
    let mut curve = SimilarityCurve::new(Arc::from("catrom"));
    // Arrival order does not matter.
    for (height, score) in dip_points().into_iter().rev() {
        curve.push(height, score);
    }

    let breakpoints = curve.breakpoints(1.0);
    assert_eq!(breakpoints.len(), 1);
    assert_eq!(&*breakpoints[0].tester, "catrom");
    assert_eq!(breakpoints[0].height, 708);
    assert_eq!(breakpoints[0].score, 0.10);
}

#[test]
fn empty_curve_has_no_breakpoints() {
    let curve = SimilarityCurve::new(Arc::from("bicubic"));
    assert!(curve.is_empty());
    assert!(curve.derivative().is_empty());
    assert!(curve.breakpoints(0.0).is_empty());
}
