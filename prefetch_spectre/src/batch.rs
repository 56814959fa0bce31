//! Timing samples of one offset, grouped by candidate.

use crate::classification::MinimumScope;
use crate::ExperimentError;
use leakage_statistics::{reduce, StatsError, Summary};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Contiguous range of candidate byte values, `first..=last`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alphabet {
    first: u8,
    last: u8,
}

impl Alphabet {
    pub const FULL: Alphabet = Alphabet {
        first: 0,
        last: u8::MAX,
    };

    /// `None` if `first > last`.
    pub fn new(first: u8, last: u8) -> Option<Self> {
        if first > last {
            None
        } else {
            Some(Alphabet { first, last })
        }
    }

    pub fn first(&self) -> u8 {
        self.first
    }

    pub fn last(&self) -> u8 {
        self.last
    }

    pub fn len(&self) -> usize {
        (self.last - self.first) as usize + 1
    }

    /// An alphabet holds at least one candidate.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, candidate: u8) -> bool {
        (self.first..=self.last).contains(&candidate)
    }

    pub fn index(&self, candidate: u8) -> Option<usize> {
        if self.contains(candidate) {
            Some((candidate - self.first) as usize)
        } else {
            None
        }
    }

    /// Candidate at `index`, which must be below [`Alphabet::len`].
    pub fn candidate(&self, index: usize) -> u8 {
        self.first + index as u8
    }

    /// Ascending candidates.
    pub fn iter(&self) -> impl Iterator<Item = u8> + Clone {
        self.first..=self.last
    }

    /// Index ranges of consecutive candidates, `len` at a time. The last
    /// slice may be shorter.
    pub fn slices(&self, len: usize) -> impl Iterator<Item = Range<usize>> {
        let total = self.len();
        let len = len.max(1);
        (0..total)
            .step_by(len)
            .map(move |start| start..(start + len).min(total))
    }

    /// Printable name of a candidate, for logs and CSV headers.
    ///
    /// Alphanumeric ASCII is printed as is, everything else in hexadecimal so
    /// that labels stay unique and safe in file names.
    pub fn label(candidate: u8) -> String {
        if candidate.is_ascii_alphanumeric() {
            (candidate as char).to_string()
        } else {
            format!("{:#04x}", candidate)
        }
    }
}

impl Default for Alphabet {
    fn default() -> Self {
        Alphabet::FULL
    }
}

/// Timings of one candidate, at most `capacity` of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleSet {
    samples: Vec<u64>,
    capacity: usize,
}

impl SampleSet {
    fn new(capacity: usize) -> Self {
        SampleSet {
            samples: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn samples(&self) -> &[u64] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    pub fn min(&self) -> Option<u64> {
        self.samples.iter().copied().min()
    }

    pub fn max(&self) -> Option<u64> {
        self.samples.iter().copied().max()
    }

    /// Number of samples equal to `value`.
    pub fn count_equal(&self, value: u64) -> usize {
        self.samples.iter().filter(|&&s| s == value).count()
    }

    pub fn summary(&self) -> Result<Summary, StatsError> {
        reduce(self.samples.iter().map(|&s| s as f64), None)
    }
}

/// One sample set per candidate, plus the minimum over everything recorded.
///
/// A batch is owned by the classification of a single offset and reused
/// across its attempts through [`Batch::clear`].
#[derive(Debug, Clone)]
pub struct Batch {
    alphabet: Alphabet,
    trials: usize,
    sets: Vec<SampleSet>,
    global_min: Option<u64>,
}

impl Batch {
    pub fn new(alphabet: Alphabet, trials: usize) -> Self {
        Batch {
            alphabet,
            trials,
            sets: (0..alphabet.len()).map(|_| SampleSet::new(trials)).collect(),
            global_min: None,
        }
    }

    pub fn alphabet(&self) -> Alphabet {
        self.alphabet
    }

    pub fn trials(&self) -> usize {
        self.trials
    }

    pub fn record(&mut self, candidate: u8, sample: u64) -> Result<(), ExperimentError> {
        let index =
            self.alphabet
                .index(candidate)
                .ok_or(ExperimentError::CandidateOutOfRange {
                    candidate,
                    first: self.alphabet.first,
                    last: self.alphabet.last,
                })?;
        let set = &mut self.sets[index];
        if set.is_full() {
            return Err(ExperimentError::SampleSetFull {
                candidate,
                capacity: set.capacity,
            });
        }
        set.samples.push(sample);
        self.global_min = Some(self.global_min.map_or(sample, |m| m.min(sample)));
        Ok(())
    }

    /// Smallest sample recorded, across attempts when the floor was carried
    /// over by [`Batch::clear`].
    pub fn global_min(&self) -> Option<u64> {
        self.global_min
    }

    pub fn set(&self, candidate: u8) -> Option<&SampleSet> {
        self.alphabet.index(candidate).map(|i| &self.sets[i])
    }

    /// Candidates in ascending order with their samples.
    pub fn sets(&self) -> impl Iterator<Item = (u8, &SampleSet)> + '_ {
        self.alphabet.iter().zip(self.sets.iter())
    }

    pub fn sample_count(&self) -> usize {
        self.sets.iter().map(SampleSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.iter().all(SampleSet::is_empty)
    }

    /// Row `trial` of the batch: the sample of each candidate taken during
    /// that trial, if any.
    pub fn trial(&self, trial: usize) -> impl Iterator<Item = Option<u64>> + '_ {
        self.sets.iter().map(move |s| s.samples.get(trial).copied())
    }

    /// Drop every sample. With [`MinimumScope::Offset`] the minimum seen so
    /// far survives and later attempts have to reproduce it.
    pub fn clear(&mut self, scope: MinimumScope) {
        for set in &mut self.sets {
            set.samples.clear();
        }
        if scope == MinimumScope::Batch {
            self.global_min = None;
        }
    }
}
