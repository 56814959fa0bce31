use crate::{reduce, StatsError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Outcome of one pass of the recovery over the offset range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RepetitionStats {
    pub elapsed: Duration,
    pub bytes_recovered: usize,
    /// Only known when a ground truth was supplied.
    pub bytes_correct: Option<usize>,
    /// Recovered bytes per second.
    pub leakage_rate: f64,
}

impl RepetitionStats {
    pub fn new(elapsed: Duration, bytes_recovered: usize, bytes_correct: Option<usize>) -> Self {
        let seconds = elapsed.as_secs_f64();
        let leakage_rate = if seconds > 0.0 {
            bytes_recovered as f64 / seconds
        } else {
            0.0
        };
        RepetitionStats {
            elapsed,
            bytes_recovered,
            bytes_correct,
            leakage_rate,
        }
    }

    /// Percentage of recovered bytes that match the ground truth.
    pub fn success_rate(&self) -> Option<f64> {
        self.bytes_correct.map(|correct| {
            if self.bytes_recovered == 0 {
                0.0
            } else {
                correct as f64 / self.bytes_recovered as f64 * 100.0
            }
        })
    }

    pub fn csv(&self) -> String {
        format!(
            "{},{},{},{},{}",
            self.elapsed.as_secs_f64(),
            self.bytes_recovered,
            self.bytes_correct.map_or(String::new(), |c| c.to_string()),
            self.success_rate().map_or(String::new(), |r| r.to_string()),
            self.leakage_rate
        )
    }

    pub fn csv_header() -> &'static str {
        "time_seconds,bytes_recovered,bytes_correct,success_rate,leakage_rate"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Spread {
    pub mean: f64,
    pub std_deviation: f64,
}

impl Spread {
    fn of(values: impl Iterator<Item = f64> + Clone) -> Result<Spread, StatsError> {
        let summary = reduce(values, None)?;
        Ok(Spread {
            mean: summary.mean,
            std_deviation: summary.std_deviation,
        })
    }
}

/// Aggregate over all repetitions of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExperimentStats {
    pub repetitions: usize,
    /// Seconds.
    pub time: Spread,
    /// Bytes per second.
    pub leakage_rate: Spread,
    /// Percent, when every repetition had a ground truth.
    pub success_rate: Option<Spread>,
    pub max_leakage_rate: f64,
}

impl ExperimentStats {
    pub fn from_repetitions(repetitions: &[RepetitionStats]) -> Result<Self, StatsError> {
        let time = Spread::of(repetitions.iter().map(|r| r.elapsed.as_secs_f64()))?;
        let leakage_rate = Spread::of(repetitions.iter().map(|r| r.leakage_rate))?;
        let success_rate = if repetitions.iter().all(|r| r.bytes_correct.is_some()) {
            Some(Spread::of(
                repetitions.iter().filter_map(RepetitionStats::success_rate),
            )?)
        } else {
            None
        };
        let max_leakage_rate = repetitions
            .iter()
            .map(|r| r.leakage_rate)
            .fold(0.0, f64::max);
        Ok(ExperimentStats {
            repetitions: repetitions.len(),
            time,
            leakage_rate,
            success_rate,
            max_leakage_rate,
        })
    }
}
