use crate::batch::Alphabet;
pub use crate::classification::MinimumScope;
use crate::ExperimentError;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::PathBuf;

pub const DEFAULT_CPU: usize = 3;
pub const DEFAULT_MAX_RETRIES: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Secret offsets to recover, `start..end`.
    pub offsets: Range<usize>,
    pub alphabet: Alphabet,
    /// Samples per candidate in one batch.
    pub trials: usize,
    /// Passes over the offset range in one repetition.
    pub reruns: usize,
    pub repetitions: usize,
    pub mistrain_rounds: usize,
    /// Candidates probed after one preparation of the oracle.
    pub slice_length: usize,
    /// Distance between the probe addresses of two consecutive candidates.
    pub stride: usize,
    /// Spin loop iterations before each trial.
    pub settle_iterations: usize,
    pub scope: MinimumScope,
    /// Fewest votes needed to accept a guess.
    pub min_confidence: usize,
    /// Failed attempts tolerated per offset, `None` retries forever.
    pub max_retries: Option<u32>,
    /// Histogram bucket width in the stored files.
    pub histogram_scale: u64,
    pub store: bool,
    pub output_dir: PathBuf,
    /// Expected secret, indexed by offset.
    pub ground_truth: Option<Vec<u8>>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        ExperimentConfig {
            offsets: 3..13,
            alphabet: Alphabet::FULL,
            trials: 5,
            reruns: 1,
            repetitions: 10,
            mistrain_rounds: 8,
            slice_length: 64,
            stride: 4096,
            settle_iterations: 100,
            scope: MinimumScope::Batch,
            min_confidence: 1,
            max_retries: Some(DEFAULT_MAX_RETRIES),
            histogram_scale: 5,
            store: false,
            output_dir: PathBuf::from("."),
            ground_truth: None,
        }
    }
}

impl ExperimentConfig {
    pub fn validate(&self) -> Result<(), ExperimentError> {
        let invalid = |msg: String| Err(ExperimentError::InvalidConfig(msg));
        if self.offsets.is_empty() {
            return invalid(format!(
                "empty offset range {}..{}",
                self.offsets.start, self.offsets.end
            ));
        }
        if self.alphabet.first() > self.alphabet.last() {
            return invalid("inverted alphabet".to_owned());
        }
        if self.trials == 0 {
            return invalid("at least one trial is needed".to_owned());
        }
        if self.reruns == 0 || self.repetitions == 0 {
            return invalid("reruns and repetitions must be positive".to_owned());
        }
        if self.slice_length == 0 {
            return invalid("slice length must be positive".to_owned());
        }
        if self.stride == 0 {
            return invalid("candidate stride must be positive".to_owned());
        }
        if self.histogram_scale == 0 {
            return invalid("histogram scale must be positive".to_owned());
        }
        if self.min_confidence > self.trials {
            return invalid(format!(
                "a confidence of {} can never be reached with {} trials",
                self.min_confidence, self.trials
            ));
        }
        if let Some(truth) = &self.ground_truth {
            if truth.len() < self.offsets.end {
                return invalid(format!(
                    "ground truth holds {} bytes, offsets go up to {}",
                    truth.len(),
                    self.offsets.end - 1
                ));
            }
        }
        Ok(())
    }

    pub fn truth(&self, offset: usize) -> Option<u8> {
        self.ground_truth
            .as_ref()
            .and_then(|t| t.get(offset).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let c = ExperimentConfig::default();
        c.validate().unwrap();
        assert_eq!(c.offsets, 3..13);
        assert_eq!(c.alphabet.len(), 256);
        assert_eq!(c.trials, 5);
        assert_eq!(c.mistrain_rounds, 8);
        assert_eq!(c.stride, 4096);
    }

    #[test]
    fn rejects_degenerate_settings() {
        let check = |f: fn(&mut ExperimentConfig)| {
            let mut c = ExperimentConfig::default();
            f(&mut c);
            assert!(matches!(c.validate(), Err(ExperimentError::InvalidConfig(_))));
        };
        check(|c| c.trials = 0);
        check(|c| c.offsets = 5..5);
        check(|c| c.slice_length = 0);
        check(|c| c.histogram_scale = 0);
        check(|c| c.stride = 0);
        check(|c| c.ground_truth = Some(b"short".to_vec()));
    }

    #[test]
    fn truth_lookup() {
        let c = ExperimentConfig {
            ground_truth: Some(b"0123456789ABC".to_vec()),
            ..Default::default()
        };
        c.validate().unwrap();
        assert_eq!(c.truth(10), Some(b'A'));
        assert_eq!(c.truth(13), None);
        assert_eq!(ExperimentConfig::default().truth(3), None);
    }
}
