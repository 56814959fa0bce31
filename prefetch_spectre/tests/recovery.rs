//! End to end recovery against a simulated oracle.
//!
//! The oracle warms candidate pages in a shared set, the eviction strategy
//! empties it and the timer answers fast for warm pages and slow with some
//! noise otherwise.

use cache_side_channel::{EvictionStrategy, Oracle, TimingOracle};
use prefetch_spectre::batch::Alphabet;
use prefetch_spectre::config::{ExperimentConfig, MinimumScope};
use prefetch_spectre::driver::{ExperimentDriver, OffsetResult};
use prefetch_spectre::export::{read_report, REPORT_FILE, RESULT_FILE};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::Rc;

const BASE: usize = 0x7f00_0000_0000;
const STRIDE: usize = 4096;
const HIT: u64 = 150;

type Warm = Rc<RefCell<BTreeSet<u8>>>;

#[derive(Debug)]
struct SimulatedOracle {
    secret: Vec<u8>,
    warm: Warm,
    /// Configure calls left without a side effect.
    silent: Cell<usize>,
}

impl Oracle for SimulatedOracle {
    fn base_address(&self) -> *const u8 {
        BASE as *const u8
    }

    fn mistrain(&mut self) {
        self.warm.borrow_mut().insert(self.secret[0]);
    }

    fn configure(&mut self, offset: usize) {
        if self.silent.get() > 0 {
            self.silent.set(self.silent.get() - 1);
            return;
        }
        self.warm.borrow_mut().insert(self.secret[offset]);
    }
}

struct SimulatedTimer {
    warm: Warm,
    rng: StdRng,
}

impl TimingOracle for SimulatedTimer {
    unsafe fn measure(&mut self, addr: *const u8) -> u64 {
        let candidate = ((addr as usize - BASE) / STRIDE) as u8;
        if self.warm.borrow().contains(&candidate) {
            HIT
        } else {
            self.rng.random_range(HIT + 10..HIT + 70)
        }
    }
}

struct SimulatedEviction(Warm);

impl EvictionStrategy for SimulatedEviction {
    fn evict(&mut self, _targets: &[*const u8]) {
        self.0.borrow_mut().clear();
    }
}

fn secret() -> Vec<u8> {
    b"A____K_".to_vec()
}

fn driver(
    config: ExperimentConfig,
    silent: usize,
) -> ExperimentDriver<SimulatedOracle, SimulatedTimer, SimulatedEviction> {
    let warm = Warm::default();
    let oracle = SimulatedOracle {
        secret: secret(),
        warm: warm.clone(),
        silent: Cell::new(silent),
    };
    let timer = SimulatedTimer {
        warm: warm.clone(),
        rng: StdRng::seed_from_u64(0x5eed),
    };
    ExperimentDriver::new(config, oracle, timer, SimulatedEviction(warm)).unwrap()
}

#[test]
fn recovers_the_secret_byte() {
    let config = ExperimentConfig {
        offsets: 5..6,
        trials: 100,
        repetitions: 1,
        settle_iterations: 0,
        ground_truth: Some(secret()),
        ..Default::default()
    };
    let report = driver(config, 0).run().unwrap();
    let repetition = &report.repetitions[0];
    match repetition.results[0] {
        OffsetResult::Recovered { outcome, attempts } => {
            assert_eq!(outcome.winner, b'K');
            assert_eq!(outcome.confidence, 100);
            assert_eq!(attempts, 1);
        }
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(repetition.stats.bytes_recovered, 1);
    assert_eq!(repetition.stats.bytes_correct, Some(1));
    assert_eq!(repetition.stats.success_rate(), Some(100.0));
}

#[test]
fn several_offsets_and_reruns() {
    let config = ExperimentConfig {
        offsets: 1..7,
        alphabet: Alphabet::new(b'0', b'z').unwrap(),
        trials: 10,
        reruns: 2,
        repetitions: 2,
        slice_length: 16,
        settle_iterations: 0,
        ground_truth: Some(secret()),
        ..Default::default()
    };
    let report = driver(config, 0).run().unwrap();
    for repetition in &report.repetitions {
        let recovered: Vec<u8> = repetition.secret().into_iter().flatten().collect();
        assert_eq!(recovered, b"____K_____K_".to_vec());
        assert_eq!(repetition.stats.bytes_recovered, 12);
        assert_eq!(repetition.stats.bytes_correct, Some(12));
    }
    let success = report.stats.success_rate.unwrap();
    assert_eq!(success.mean, 100.0);
    assert_eq!(success.std_deviation, 0.0);
}

#[test]
fn low_confidence_batch_is_retried() {
    let config = ExperimentConfig {
        offsets: 5..6,
        trials: 20,
        repetitions: 1,
        settle_iterations: 0,
        min_confidence: 10,
        ..Default::default()
    };
    // One configure per slice and trial: the whole first attempt sees no
    // side effect.
    let slices = 256 / 64;
    let report = driver(config, 20 * slices).run().unwrap();
    match report.repetitions[0].results[0] {
        OffsetResult::Recovered { outcome, attempts } => {
            assert_eq!(outcome.winner, b'K');
            assert_eq!(outcome.confidence, 20);
            assert_eq!(attempts, 2);
        }
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(report.repetitions[0].stats.bytes_correct, None);
}

#[test]
fn exhausted_budget_gives_no_confidence() {
    let config = ExperimentConfig {
        offsets: 5..6,
        trials: 20,
        repetitions: 1,
        settle_iterations: 0,
        min_confidence: 10,
        scope: MinimumScope::Offset,
        max_retries: Some(1),
        ..Default::default()
    };
    let report = driver(config, usize::MAX).run().unwrap();
    assert_eq!(
        report.repetitions[0].results,
        vec![OffsetResult::NoConfidence {
            offset: 5,
            attempts: 2
        }]
    );
    assert_eq!(report.repetitions[0].stats.bytes_recovered, 0);
}

#[test]
fn stored_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = ExperimentConfig {
        offsets: 4..6,
        alphabet: Alphabet::new(b'A', b'Z').unwrap(),
        trials: 8,
        repetitions: 1,
        settle_iterations: 0,
        store: true,
        output_dir: dir.path().to_path_buf(),
        ground_truth: Some(secret()),
        ..Default::default()
    };
    let report = driver(config.clone(), 0).run().unwrap();

    // Offset 4 holds '_', outside of the alphabet, only noise is measured.
    assert!(dir.path().join("4-0x5f_raw.csv").exists());
    assert!(dir.path().join("5-K_raw.csv").exists());
    let histogram = std::fs::read_to_string(dir.path().join("5-K.csv")).unwrap();
    let header = histogram.lines().next().unwrap();
    assert!(header.starts_with("Cycle,A,B,C"));
    let first_row: Vec<&str> = histogram.lines().nth(1).unwrap().split(',').collect();
    assert_eq!(first_row[0], HIT.to_string());
    // 'K' is the eleventh candidate.
    assert_eq!(first_row[11], "8");

    let result = std::fs::read_to_string(dir.path().join(RESULT_FILE)).unwrap();
    assert!(result.starts_with("Letter,Bit4,Bit5\n"));
    assert!(result.lines().any(|l| l.starts_with("K,") && l.ends_with(",8")));

    let stored = read_report(dir.path().join(REPORT_FILE)).unwrap();
    assert_eq!(stored, report);
    assert_eq!(stored.config, config);
}
