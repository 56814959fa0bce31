//! Address scan: time a prefetch of evenly spaced addresses, mapped ones are
//! translated faster than unmapped ones.

use crate::ExperimentError;
use cache_side_channel::{EvictionStrategy, TimingOracle};
use leakage_statistics::{reduce, Summary};
use log::info;
use serde::{Deserialize, Serialize};

const WARMUP_MEASUREMENTS: usize = 2;
const KERNEL_TEXT_START: usize = 0xffff_ffff_8000_0000;
const STEPS_BEFORE: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    pub start: usize,
    pub step: usize,
    pub steps: usize,
    /// Timings reduced per address.
    pub tries: usize,
    /// Back to back probes timed in one window, the timing is their mean.
    pub average: usize,
    pub evict: bool,
    pub outlier_threshold: Option<f64>,
    /// Address to flag in the log, when known.
    pub known: Option<usize>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        // 2 MiB steps over the kernel text window, starting a few steps early.
        let step = 2 << 20;
        ScanConfig {
            start: KERNEL_TEXT_START - STEPS_BEFORE * step,
            step,
            steps: 512 + 2 * STEPS_BEFORE,
            tries: 1000,
            average: 1,
            evict: true,
            outlier_threshold: None,
            known: None,
        }
    }
}

impl ScanConfig {
    pub fn validate(&self) -> Result<(), ExperimentError> {
        if self.step == 0 || self.steps == 0 || self.tries == 0 || self.average == 0 {
            return Err(ExperimentError::InvalidConfig(
                "step, steps, tries and average must be positive".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn address(&self, index: usize) -> usize {
        self.start.wrapping_add(index.wrapping_mul(self.step))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanPoint {
    pub index: usize,
    pub address: usize,
    pub summary: Summary,
}

pub struct AddressScanner<T, E> {
    config: ScanConfig,
    timer: T,
    evictor: E,
}

impl<T: TimingOracle, E: EvictionStrategy> AddressScanner<T, E> {
    pub fn new(config: ScanConfig, timer: T, evictor: E) -> Result<Self, ExperimentError> {
        config.validate()?;
        Ok(AddressScanner {
            config,
            timer,
            evictor,
        })
    }

    /// Mean time of one probe over a window of `average` probes.
    fn time(&mut self, address: usize) -> f64 {
        let addr = address as *const u8;
        if self.config.evict {
            self.evictor.evict(&[addr]);
        }
        // Prefetches of unmapped addresses do not fault.
        let total = unsafe { self.timer.measure_repeated(addr, self.config.average) };
        total as f64 / self.config.average as f64
    }

    /// Reduce `tries` timings of one address.
    pub fn measure(&mut self, address: usize) -> Result<Summary, ExperimentError> {
        let samples: Vec<f64> = (0..self.config.tries).map(|_| self.time(address)).collect();
        Ok(reduce(samples.iter().copied(), self.config.outlier_threshold)?)
    }

    pub fn run(&mut self) -> Result<Vec<ScanPoint>, ExperimentError> {
        for _ in 0..WARMUP_MEASUREMENTS {
            self.measure(self.config.start)?;
        }
        let steps = self.config.steps;
        let mut points = Vec::with_capacity(steps);
        for index in 0..steps {
            let address = self.config.address(index);
            let summary = self.measure(address)?;
            let marker = if self.config.known == Some(address) {
                " <-"
            } else {
                ""
            };
            info!(
                "{:4}/{:4} {:#018x} {:8.2} (min: {:5}, max: {:5}){}",
                index, steps, address, summary.mean, summary.min, summary.max, marker
            );
            points.push(ScanPoint {
                index,
                address,
                summary,
            });
        }
        Ok(points)
    }
}

/// Point with the smallest mean timing.
pub fn fastest(points: &[ScanPoint]) -> Option<&ScanPoint> {
    points
        .iter()
        .min_by(|a, b| a.summary.mean.total_cmp(&b.summary.mean))
}
