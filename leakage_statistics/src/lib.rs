#![deny(unsafe_op_in_unsafe_fn)]

//! Reduction of timing samples and of per repetition results.
//!
//! Every measurement program reduces its samples through [`reduce`], there is
//! no other mean / variance implementation in the workspace.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod histogram;
pub mod repetition;

pub use repetition::{ExperimentStats, RepetitionStats, Spread};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StatsError {
    #[error("insufficient samples: none kept out of {total}")]
    InsufficientSamples { total: usize },
    #[error("histogram bucket width must be positive")]
    ZeroWidth,
    #[error("could not allocate a histogram of {buckets} buckets")]
    HistogramTooLarge { buckets: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub mean: f64,
    /// Population variance over the kept samples.
    pub variance: f64,
    pub std_deviation: f64,
    /// Standard deviation over the square root of the sample count before
    /// filtering.
    pub std_error: f64,
    /// Minimum over all samples, outliers included.
    pub min: f64,
    /// Maximum over all samples, outliers included.
    pub max: f64,
    pub count_kept: usize,
    pub count_total: usize,
}

/// Reduce `samples` to their summary statistics.
///
/// Samples greater or equal to `outlier_threshold` are left out of the mean
/// and the variance, but still count for `min`, `max` and the standard error
/// denominator.
///
/// The variance divides by the kept count, not the kept count minus one; it
/// is biased low for small sample counts.
pub fn reduce<I>(samples: I, outlier_threshold: Option<f64>) -> Result<Summary, StatsError>
where
    I: IntoIterator<Item = f64>,
    I::IntoIter: Clone,
{
    let samples = samples.into_iter();
    let kept = |v: &f64| outlier_threshold.map_or(true, |t| *v < t);

    let mut sum = 0.0;
    let mut count_kept = 0;
    let mut count_total = 0;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for v in samples.clone() {
        count_total += 1;
        if kept(&v) {
            sum += v;
            count_kept += 1;
        }
        min = min.min(v);
        max = max.max(v);
    }

    if count_kept == 0 {
        return Err(StatsError::InsufficientSamples { total: count_total });
    }

    let mean = sum / count_kept as f64;
    let variance = samples
        .filter(kept)
        .map(|v| (v - mean) * (v - mean))
        .sum::<f64>()
        / count_kept as f64;
    let std_deviation = variance.sqrt();

    Ok(Summary {
        mean,
        variance,
        std_deviation,
        std_error: std_deviation / (count_total as f64).sqrt(),
        min,
        max,
        count_kept,
        count_total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn constant_samples() {
        let s = reduce([10.0, 10.0, 10.0, 10.0], None).unwrap();
        assert_eq!(s.mean, 10.0);
        assert_eq!(s.variance, 0.0);
        assert_eq!(s.std_error, 0.0);
        assert_eq!(s.min, 10.0);
        assert_eq!(s.max, 10.0);
        assert_eq!(s.count_kept, 4);
    }

    #[test]
    fn outliers_leave_min_alone() {
        let s = reduce([1.0, 2.0, 3.0, 1000.0], Some(100.0)).unwrap();
        assert_eq!(s.mean, 2.0);
        assert_eq!(s.count_kept, 3);
        assert_eq!(s.count_total, 4);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 1000.0);
        assert!(close(s.variance, 2.0 / 3.0));
        // Denominator of the standard error is the unfiltered count.
        assert!(close(s.std_error, (2.0f64 / 3.0).sqrt() / 2.0));
    }

    #[test]
    fn threshold_is_exclusive() {
        let s = reduce([5.0, 100.0], Some(100.0)).unwrap();
        assert_eq!(s.count_kept, 1);
        assert_eq!(s.mean, 5.0);
    }

    #[test]
    fn population_variance() {
        let s = reduce([2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0], None).unwrap();
        assert_eq!(s.mean, 5.0);
        assert_eq!(s.variance, 4.0);
        assert_eq!(s.std_deviation, 2.0);
    }

    #[test]
    fn empty_input_is_an_error() {
        assert_eq!(
            reduce(std::iter::empty(), None),
            Err(StatsError::InsufficientSamples { total: 0 })
        );
    }

    #[test]
    fn everything_filtered_is_an_error() {
        assert_eq!(
            reduce([500.0, 600.0], Some(100.0)),
            Err(StatsError::InsufficientSamples { total: 2 })
        );
    }

    #[test]
    fn integer_samples_through_map() {
        let raw: [u64; 3] = [90, 100, 110];
        let s = reduce(raw.iter().map(|&v| v as f64), None).unwrap();
        assert_eq!(s.mean, 100.0);
    }
}
