#![deny(unsafe_op_in_unsafe_fn)]

//! Capabilities a timing side channel is built from.
//!
//! The measurement logic only sees four small interfaces: a counter
//! ([`TimingSource`]), a single probe instruction ([`ProbeOp`]), a way to bring
//! the probed structures back to a cold state ([`EvictionStrategy`]) and the
//! privileged component holding the secret ([`Oracle`]). Platform specific
//! implementations live in [`hardware`], [`device`] and [`power_trace`].

use std::fmt::Debug;
use std::path::PathBuf;
use thiserror::Error;

pub mod device;
#[cfg(target_arch = "x86_64")]
pub mod hardware;
pub mod power_trace;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("can't open device file {}: {source}", path.display())]
    DeviceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("ioctl on {} failed: {source}", path.display())]
    Ioctl {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[error("could not read power trace {}: {source}", path.display())]
    PowerTraceIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("power trace {} does not start with an integer: {line:?}", path.display())]
    PowerTraceParse { path: PathBuf, line: String },
}

/// Monotonic counter read with serialization on both sides.
pub trait TimingSource {
    fn timestamp(&mut self) -> u64;
}

/// Exactly one memory touch of one address.
pub trait ProbeOp {
    /// # Safety
    ///
    /// addr must be safe to probe with this operation.
    unsafe fn probe(&self, addr: *const u8);
}

/// Brings the cache / TLB state relevant to `targets` back to a known cold
/// state. Two consecutive calls with the same targets must issue the same
/// accesses.
pub trait EvictionStrategy {
    fn evict(&mut self, targets: &[*const u8]);
}

/// Times one probe of one address.
pub trait TimingOracle {
    /// # Safety
    ///
    /// addr must be mapped or otherwise safe to probe.
    unsafe fn measure(&mut self, addr: *const u8) -> u64;

    /// Total time of `repeats` back to back probes of `addr`.
    ///
    /// # Safety
    ///
    /// Same as [`TimingOracle::measure`].
    unsafe fn measure_repeated(&mut self, addr: *const u8, repeats: usize) -> u64 {
        (0..repeats).fold(0u64, |total, _| {
            total.wrapping_add(unsafe { self.measure(addr) })
        })
    }
}

/// The privileged component whose side effect depends on the secret.
pub trait Oracle: Debug {
    /// Base of the candidate pages the side effect lands in.
    fn base_address(&self) -> *const u8;
    /// One benign access, biasing predictors toward the in-bounds path.
    fn mistrain(&mut self);
    /// Trigger the secret dependent side effect for `offset`.
    fn configure(&mut self, offset: usize);
}

/// [`TimingOracle`] built from a counter and a probe instruction.
///
/// Nothing is allocated and nothing branches between the two counter reads.
#[derive(Debug, Clone)]
pub struct ProbeTimer<S, P> {
    source: S,
    probe: P,
}

impl<S: TimingSource, P: ProbeOp> ProbeTimer<S, P> {
    pub fn new(source: S, probe: P) -> Self {
        ProbeTimer { source, probe }
    }
}

impl<S: TimingSource, P: ProbeOp> TimingOracle for ProbeTimer<S, P> {
    #[inline(always)]
    unsafe fn measure(&mut self, addr: *const u8) -> u64 {
        let begin = self.source.timestamp();
        unsafe { self.probe.probe(addr) };
        let end = self.source.timestamp();
        end.wrapping_sub(begin)
    }

    /// All probes share one pair of counter reads, so coarse counters still
    /// see the accumulated difference.
    #[inline(always)]
    unsafe fn measure_repeated(&mut self, addr: *const u8, repeats: usize) -> u64 {
        let begin = self.source.timestamp();
        for _ in 0..repeats {
            unsafe { self.probe.probe(addr) };
        }
        let end = self.source.timestamp();
        end.wrapping_sub(begin)
    }
}
