//! Min count voting over a [`Batch`].
//!
//! Every candidate gets one vote per sample equal to the smallest timing of
//! the batch. The candidate with the most votes wins; the number of votes is
//! the confidence of the guess.

use crate::batch::Batch;
use log::debug;
use serde::{Deserialize, Serialize};

/// What the minimum the votes are counted against ranges over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MinimumScope {
    /// Minimum of the current attempt only.
    #[default]
    Batch,
    /// Minimum of every attempt at the current offset. An attempt that never
    /// reproduces an earlier minimum gets no vote at all.
    Offset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationOutcome {
    pub offset: usize,
    pub winner: u8,
    pub confidence: usize,
    pub accepted: bool,
}

/// Progress of the classification of one offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeState {
    Collecting,
    Evaluating,
    Retry,
    Accepted(ClassificationOutcome),
}

/// Per candidate line of the verbose report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandidateReport {
    pub candidate: u8,
    pub mean: f64,
    pub min: u64,
    pub max: u64,
    pub min_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationEngine {
    scope: MinimumScope,
    /// Fewest votes an accepted winner needs, at least 1.
    min_confidence: usize,
}

impl Default for ClassificationEngine {
    fn default() -> Self {
        ClassificationEngine::new(MinimumScope::default(), 1)
    }
}

impl ClassificationEngine {
    pub fn new(scope: MinimumScope, min_confidence: usize) -> Self {
        ClassificationEngine {
            scope,
            min_confidence: min_confidence.max(1),
        }
    }

    pub fn scope(&self) -> MinimumScope {
        self.scope
    }

    pub fn min_confidence(&self) -> usize {
        self.min_confidence
    }

    /// Votes of each candidate, in ascending candidate order. All zero for a
    /// batch without samples.
    pub fn min_counts<'a>(&self, batch: &'a Batch) -> impl Iterator<Item = (u8, usize)> + 'a {
        let global_min = batch.global_min();
        batch.sets().map(move |(candidate, set)| {
            (candidate, global_min.map_or(0, |m| set.count_equal(m)))
        })
    }

    /// Pick the candidate with the most votes. Ties go to the lowest
    /// candidate, so the same batch always yields the same winner.
    pub fn decide(&self, offset: usize, batch: &Batch) -> ClassificationOutcome {
        let mut winner = batch.alphabet().first();
        let mut confidence = 0;
        for (candidate, count) in self.min_counts(batch) {
            if count > confidence {
                winner = candidate;
                confidence = count;
            }
        }
        ClassificationOutcome {
            offset,
            winner,
            confidence,
            accepted: confidence >= self.min_confidence,
        }
    }

    /// Move from one state of the classification of `offset` to the next.
    ///
    /// Collecting has to be done by the caller, who then hands
    /// [`EpisodeState::Evaluating`] back.
    pub fn step(&self, state: EpisodeState, offset: usize, batch: &mut Batch) -> EpisodeState {
        match state {
            EpisodeState::Collecting => EpisodeState::Evaluating,
            EpisodeState::Evaluating => {
                let outcome = self.decide(offset, batch);
                debug!(
                    "Offset {}: {} with {} votes (min {:?})",
                    offset,
                    outcome.winner,
                    outcome.confidence,
                    batch.global_min()
                );
                if outcome.accepted {
                    EpisodeState::Accepted(outcome)
                } else {
                    EpisodeState::Retry
                }
            }
            EpisodeState::Retry => {
                batch.clear(self.scope);
                EpisodeState::Collecting
            }
            accepted @ EpisodeState::Accepted(_) => accepted,
        }
    }

    /// Mean, extremes and votes of every candidate holding samples.
    pub fn report(&self, batch: &Batch) -> Vec<CandidateReport> {
        self.min_counts(batch)
            .zip(batch.sets())
            .filter_map(|((candidate, min_count), (_, set))| {
                let summary = set.summary().ok()?;
                Some(CandidateReport {
                    candidate,
                    mean: summary.mean,
                    min: set.min()?,
                    max: set.max()?,
                    min_count,
                })
            })
            .collect()
    }
}
