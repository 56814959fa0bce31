//! x86_64 implementations of the capabilities.

use crate::{EvictionStrategy, ProbeOp, ProbeTimer, TimingSource};
use cache_utils::tlb::TlbEvictionSet;
use cache_utils::{prefetch_t0, prefetch_t2, rdtsc_fence, CacheUtilsError};
use serde::{Deserialize, Serialize};

/// Time stamp counter, mfence on both sides of the read.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tsc;

impl TimingSource for Tsc {
    #[inline(always)]
    fn timestamp(&mut self) -> u64 {
        unsafe { rdtsc_fence() }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PrefetchT0;

impl ProbeOp for PrefetchT0 {
    #[inline(always)]
    unsafe fn probe(&self, addr: *const u8) {
        unsafe { prefetch_t0(addr) }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PrefetchT2;

impl ProbeOp for PrefetchT2 {
    #[inline(always)]
    unsafe fn probe(&self, addr: *const u8) {
        unsafe { prefetch_t2(addr) }
    }
}

pub type PrefetchTimer<S = Tsc> = ProbeTimer<S, PrefetchT2>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EvictionMode {
    /// Every set of both TLB levels, whatever the targets.
    #[default]
    Full,
    /// Only the sets the targets map to.
    Targeted,
}

pub struct TlbEviction {
    set: TlbEvictionSet,
    mode: EvictionMode,
}

impl TlbEviction {
    pub fn new(mode: EvictionMode) -> Result<Self, CacheUtilsError> {
        Ok(TlbEviction {
            set: TlbEvictionSet::new()?,
            mode,
        })
    }
}

impl EvictionStrategy for TlbEviction {
    fn evict(&mut self, targets: &[*const u8]) {
        match self.mode {
            EvictionMode::Targeted if !targets.is_empty() => self.set.evict_pages(targets),
            _ => self.set.flush(),
        }
    }
}
