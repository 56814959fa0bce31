#![deny(unsafe_op_in_unsafe_fn)]

//! Low level primitives shared by the measurement crates: serialized cycle
//! counter reads, single cache line probes, anonymous mappings, TLB eviction
//! buffers and core pinning.

use static_assertions::const_assert_eq;
use thiserror::Error;

pub mod affinity;
pub mod mmap;
#[cfg(target_arch = "x86_64")]
pub mod tlb;

#[cfg(target_arch = "x86_64")]
use core::arch::x86_64 as arch_x86;
use core::ptr;

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_LEN: usize = 1 << PAGE_SHIFT;
// NB this may need to be changed / dynamically measured.
pub const CACHE_LINE_LEN: usize = 64;

const_assert_eq!(PAGE_LEN % CACHE_LINE_LEN, 0);

pub type VPN = usize;

#[derive(Debug, Error)]
pub enum CacheUtilsError {
    #[error("failed to map {size} bytes: {source}")]
    Mmap {
        size: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("CPU {cpu} is not available")]
    CpuUnavailable { cpu: usize },
    #[error(transparent)]
    Nix(#[from] nix::Error),
}

pub fn get_vpn<T>(p: *const T) -> VPN {
    (p as usize) >> PAGE_SHIFT
}

// rdtsc (has mfence before and after)
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub unsafe fn rdtsc_fence() -> u64 {
    unsafe {
        arch_x86::_mm_mfence();
        let tsc: u64 = arch_x86::_rdtsc();
        arch_x86::_mm_mfence();
        tsc
    }
}

/// Speculation barrier, issued after eviction and before the oracle call.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn lfence() {
    unsafe { arch_x86::_mm_lfence() }
}

/// # Safety
///
/// p must be a valid pointer to read.
#[inline(always)]
pub unsafe fn maccess<T>(p: *const T) {
    unsafe { ptr::read_volatile(p) };
}

/// Non blocking prefetch into all cache levels.
///
/// # Safety
///
/// Prefetch never faults, but the caller is responsible for the address being
/// meaningful to probe.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub unsafe fn prefetch_t0(p: *const u8) {
    unsafe { arch_x86::_mm_prefetch::<{ arch_x86::_MM_HINT_T0 }>(p as *const i8) };
}

/// Non blocking prefetch into the last level cache.
///
/// # Safety
///
/// See [`prefetch_t0`].
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub unsafe fn prefetch_t2(p: *const u8) {
    unsafe { arch_x86::_mm_prefetch::<{ arch_x86::_MM_HINT_T2 }>(p as *const i8) };
}

/// Time a single T2 prefetch of `p`.
///
/// # Safety
///
/// See [`prefetch_t0`].
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub unsafe fn only_prefetch(p: *const u8) -> u64 {
    unsafe {
        let t = rdtsc_fence();
        prefetch_t2(p);
        rdtsc_fence().wrapping_sub(t)
    }
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;

    #[test]
    fn counter_is_monotonic() {
        let a = unsafe { rdtsc_fence() };
        let b = unsafe { rdtsc_fence() };
        assert!(b >= a);
    }

    #[test]
    fn prefetch_of_local_line_is_timed() {
        let line = [0u8; CACHE_LINE_LEN];
        unsafe { maccess(&line[0]) };
        // A cached line takes some cycles, but never wraps around.
        let d = unsafe { only_prefetch(&line[0]) };
        assert!(d < 1 << 32);
    }

    #[test]
    fn vpn_drops_page_offset() {
        assert_eq!(get_vpn(0x1234_5678usize as *const u8), 0x12345);
    }
}
