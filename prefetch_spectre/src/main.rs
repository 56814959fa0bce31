//! Command line front end: recover a secret from the kernel module, or scan
//! an address range.

use clap::{Args, Parser, Subcommand};
use log::error;
use prefetch_spectre::batch::Alphabet;
use prefetch_spectre::config::{
    ExperimentConfig, MinimumScope, DEFAULT_CPU, DEFAULT_MAX_RETRIES,
};
use prefetch_spectre::scan::ScanConfig;
use prefetch_spectre::ExperimentError;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "prefetch_spectre")]
#[command(about = "Recover a secret byte by byte through a prefetch timing side channel")]
struct Cli {
    /// Bind to cpu
    #[arg(short, long, default_value_t = DEFAULT_CPU, global = true)]
    cpu: usize,

    /// Store raw samples, histograms, the vote matrix and the report
    #[arg(short, long, global = true)]
    store: bool,

    /// Directory stored files go to
    #[arg(short, long, default_value = ".", global = true)]
    output: PathBuf,

    /// Verbose output (per offset and per candidate details)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Read timings from a power trace file instead of the time stamp counter
    #[arg(long, global = true)]
    power_trace: Option<PathBuf>,

    /// How power trace values are turned into timings
    #[arg(long, default_value = "direct", value_parser = ["direct", "diff"], global = true)]
    power_mode: String,

    /// Prefetch hint used as the probe [default: t2 to recover, t0 to scan]
    #[arg(long, value_parser = ["t0", "t2"], global = true)]
    hint: Option<String>,

    /// TLB eviction before each probe: full flush or only the probed sets
    #[arg(long, default_value = "full", value_parser = ["full", "targeted"], global = true)]
    eviction: String,

    #[command(flatten)]
    recover: RecoverArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct RecoverArgs {
    /// Kernel module device file
    #[arg(long, default_value = cache_side_channel::device::DEFAULT_DEVICE_PATH)]
    device: PathBuf,

    /// Passes over the offset range per repetition
    #[arg(short = 'n', long, default_value_t = 1)]
    reruns: usize,

    /// Number of repetitions
    #[arg(short, long, default_value_t = 10)]
    repetitions: usize,

    /// Samples per candidate in one batch
    #[arg(short, long, default_value_t = 5)]
    trials: usize,

    /// First secret offset
    #[arg(long, default_value_t = 3)]
    start: usize,

    /// Secret offset past the last one
    #[arg(long, default_value_t = 13)]
    end: usize,

    /// First candidate byte
    #[arg(long, default_value_t = 0)]
    first: u8,

    /// Last candidate byte
    #[arg(long, default_value_t = u8::MAX)]
    last: u8,

    /// Candidates probed after one preparation of the oracle
    #[arg(long, default_value_t = 64)]
    slice: usize,

    /// Mistraining accesses before each slice
    #[arg(long, default_value_t = 8)]
    mistrain: usize,

    /// Fewest votes needed to accept a guess
    #[arg(long, default_value_t = 1)]
    min_confidence: usize,

    /// Keep the minimum across attempts at one offset
    #[arg(long)]
    offset_minimum: bool,

    /// Give up on an offset after that many failed attempts
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// Expected secret, to report the success rate
    #[arg(long)]
    secret: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Time prefetches over an address range
    Scan {
        /// First address, hexadecimal
        #[arg(long, value_parser = parse_address)]
        start: Option<usize>,

        /// Distance between two addresses, hexadecimal
        #[arg(long, value_parser = parse_address)]
        step: Option<usize>,

        /// Number of addresses
        #[arg(long)]
        steps: Option<usize>,

        /// Timings per address
        #[arg(long, default_value_t = 1000)]
        tries: usize,

        /// Back to back probes averaged into one timing
        #[arg(long, default_value_t = 1)]
        average: usize,

        /// Do not evict the TLB before each timing
        #[arg(long)]
        no_evict: bool,

        /// Leave timings at or above this value out of the mean
        #[arg(long)]
        outlier_threshold: Option<f64>,

        /// Address to flag in the output, hexadecimal
        #[arg(long, value_parser = parse_address)]
        known: Option<usize>,
    },
}

impl Cli {
    fn hint(&self) -> &str {
        match (&self.hint, &self.command) {
            (Some(hint), _) => hint.as_str(),
            (None, Some(Commands::Scan { .. })) => "t0",
            (None, None) => "t2",
        }
    }
}

fn parse_address(s: &str) -> Result<usize, String> {
    let digits = s.trim_start_matches("0x");
    usize::from_str_radix(digits, 16).map_err(|e| format!("{}: {}", s, e))
}

impl RecoverArgs {
    fn config(&self, cli: &Cli) -> Result<ExperimentConfig, ExperimentError> {
        let alphabet = Alphabet::new(self.first, self.last).ok_or_else(|| {
            ExperimentError::InvalidConfig(format!(
                "first candidate {} is above last candidate {}",
                self.first, self.last
            ))
        })?;
        Ok(ExperimentConfig {
            offsets: self.start..self.end,
            alphabet,
            trials: self.trials,
            reruns: self.reruns,
            repetitions: self.repetitions,
            mistrain_rounds: self.mistrain,
            slice_length: self.slice,
            scope: if self.offset_minimum {
                MinimumScope::Offset
            } else {
                MinimumScope::Batch
            },
            min_confidence: self.min_confidence,
            max_retries: Some(self.max_retries),
            store: cli.store,
            output_dir: cli.output.clone(),
            ground_truth: self.secret.as_ref().map(|s| s.as_bytes().to_vec()),
            ..Default::default()
        })
    }
}

#[cfg(target_arch = "x86_64")]
mod run {
    use super::{Cli, Commands};
    use cache_side_channel::device::DeviceOracle;
    use cache_side_channel::hardware::{EvictionMode, PrefetchT0, PrefetchT2, TlbEviction, Tsc};
    use cache_side_channel::power_trace::{PowerTrace, PowerTraceMode};
    use cache_side_channel::{
        EvictionStrategy, ProbeOp, ProbeTimer, TimingOracle, TimingSource,
    };
    use cache_utils::affinity::{restore_affinity, set_affinity};
    use log::info;
    use prefetch_spectre::driver::{log_summary, ExperimentDriver};
    use prefetch_spectre::export::ResultStore;
    use prefetch_spectre::scan::{fastest, AddressScanner};
    use prefetch_spectre::ExperimentError;

    fn eviction_mode(cli: &Cli) -> EvictionMode {
        match cli.eviction.as_str() {
            "targeted" => EvictionMode::Targeted,
            _ => EvictionMode::Full,
        }
    }

    fn power_mode(cli: &Cli) -> PowerTraceMode {
        match cli.power_mode.as_str() {
            "diff" => PowerTraceMode::Diff,
            _ => PowerTraceMode::Direct,
        }
    }

    pub fn main(cli: Cli) -> Result<(), ExperimentError> {
        let old = set_affinity(cli.cpu)?;
        let result = pinned(&cli);
        restore_affinity(&old)?;
        result
    }

    fn pinned(cli: &Cli) -> Result<(), ExperimentError> {
        match &cli.power_trace {
            Some(path) => {
                let trace = PowerTrace::open(path, power_mode(cli))?;
                with_source(cli, trace)
            }
            None => with_source(cli, Tsc),
        }
    }

    fn with_source<S: TimingSource>(cli: &Cli, source: S) -> Result<(), ExperimentError> {
        match cli.hint() {
            "t0" => with_timer(cli, ProbeTimer::new(source, PrefetchT0)),
            _ => with_timer(cli, ProbeTimer::new(source, PrefetchT2)),
        }
    }

    fn with_timer<S: TimingSource, P: ProbeOp>(
        cli: &Cli,
        timer: ProbeTimer<S, P>,
    ) -> Result<(), ExperimentError> {
        let evictor = TlbEviction::new(eviction_mode(cli))?;
        match &cli.command {
            None => recover(cli, timer, evictor),
            Some(Commands::Scan { .. }) => scan(cli, timer, evictor),
        }
    }

    fn recover<T: TimingOracle, E: EvictionStrategy>(
        cli: &Cli,
        timer: T,
        evictor: E,
    ) -> Result<(), ExperimentError> {
        let config = cli.recover.config(cli)?;
        let oracle = DeviceOracle::open(&cli.recover.device)?;
        let mut driver = ExperimentDriver::new(config, oracle, timer, evictor)?;
        let report = driver.run()?;
        log_summary(&report.stats);
        Ok(())
    }

    fn scan<T: TimingOracle, E: EvictionStrategy>(
        cli: &Cli,
        timer: T,
        evictor: E,
    ) -> Result<(), ExperimentError> {
        let config = super::scan_config(cli).unwrap_or_default();
        let mut scanner = AddressScanner::new(config, timer, evictor)?;
        let points = scanner.run()?;
        if let Some(best) = fastest(&points) {
            info!(
                "Fastest: {:#018x} ({:.2})",
                best.address, best.summary.mean
            );
        }
        if cli.store {
            ResultStore::new(&cli.output, 1)?.write_scan(&points)?;
        }
        Ok(())
    }
}

fn scan_config(cli: &Cli) -> Option<ScanConfig> {
    let Some(Commands::Scan {
        start,
        step,
        steps,
        tries,
        average,
        no_evict,
        outlier_threshold,
        known,
    }) = &cli.command
    else {
        return None;
    };
    let defaults = ScanConfig::default();
    let step = step.unwrap_or(defaults.step);
    Some(ScanConfig {
        start: start.unwrap_or(defaults.start),
        step,
        steps: steps.unwrap_or(defaults.steps),
        tries: *tries,
        average: *average,
        evict: !no_evict,
        outlier_threshold: *outlier_threshold,
        known: *known,
    })
}

#[cfg(target_arch = "x86_64")]
fn dispatch(cli: Cli) -> Result<(), ExperimentError> {
    run::main(cli)
}

#[cfg(not(target_arch = "x86_64"))]
fn dispatch(_cli: Cli) -> Result<(), ExperimentError> {
    Err(ExperimentError::InvalidConfig(
        "timing probes are only implemented for x86_64".to_owned(),
    ))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();

    match dispatch(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hint_depends_on_the_command() {
        let cli = Cli::parse_from(["prefetch_spectre"]);
        assert_eq!(cli.hint(), "t2");
        let cli = Cli::parse_from(["prefetch_spectre", "scan"]);
        assert_eq!(cli.hint(), "t0");
        let cli = Cli::parse_from(["prefetch_spectre", "--hint", "t2", "scan"]);
        assert_eq!(cli.hint(), "t2");
    }

    #[test]
    fn scan_defaults_match_the_library() {
        let cli = Cli::parse_from(["prefetch_spectre", "scan", "--steps", "16"]);
        let config = scan_config(&cli).unwrap();
        let defaults = ScanConfig::default();
        assert_eq!(config.start, defaults.start);
        assert_eq!(config.step, defaults.step);
        assert_eq!(config.steps, 16);
        assert!(config.evict);
        assert!(scan_config(&Cli::parse_from(["prefetch_spectre"])).is_none());
    }
}
