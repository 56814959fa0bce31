//! TLB eviction through congruent page accesses.
//!
//! Two large buffers are touched page by page so that every set of the first
//! and second level data TLB is filled with our own translations. No flush
//! instruction is involved: the probed translations may be privileged and only
//! observable through set occupancy.

use crate::mmap::MMappedMemory;
use crate::{get_vpn, lfence, CacheUtilsError, PAGE_SHIFT};
use core::ptr;
use itertools::Itertools;

const TLB_BUFFER_LEN: usize = 16 << 20;
const TLB_BUFFER_ALIGN: usize = 0x40000;

pub const L1_TLB_SETS: usize = 16;
pub const L1_TLB_WAYS: usize = 4;
pub const L2_TLB_SETS: usize = 128;
pub const L2_TLB_WAYS: usize = 4;
/// Set indexes walked by a full first level sweep. Going past `L1_TLB_SETS`
/// touches 176 distinct pages, well above the first level capacity.
pub const L1_SWEEP_SETS: usize = 128;

const EVICTION_MARKER: u8 = 0x5a;

pub struct TlbEvictionSet {
    l1: MMappedMemory,
    l2: MMappedMemory,
    l1_base: usize,
    l2_base: usize,
}

fn aligned_offset(p: *const u8, align: usize) -> usize {
    let addr = p as usize;
    (align - (addr & (align - 1))) & (align - 1)
}

impl TlbEvictionSet {
    pub fn new() -> Result<TlbEvictionSet, CacheUtilsError> {
        let l1 = MMappedMemory::try_new(TLB_BUFFER_LEN + TLB_BUFFER_ALIGN, false, |_| 2)?;
        let l2 = MMappedMemory::try_new(TLB_BUFFER_LEN + TLB_BUFFER_ALIGN, false, |_| 2)?;
        let l1_base = aligned_offset(l1.as_ptr(), TLB_BUFFER_ALIGN);
        let l2_base = aligned_offset(l2.as_ptr(), TLB_BUFFER_ALIGN);
        Ok(TlbEvictionSet {
            l1,
            l2,
            l1_base,
            l2_base,
        })
    }

    #[inline(always)]
    fn touch(buffer: &mut MMappedMemory, offset: usize) {
        // offset < TLB_BUFFER_LEN + TLB_BUFFER_ALIGN by construction of the set indexes.
        let p = &mut buffer[offset] as *mut u8;
        unsafe { ptr::write_volatile(p, EVICTION_MARKER) };
    }

    pub fn evict_l1_set(&mut self, set: usize) {
        let set = set % L1_TLB_SETS;
        for way in 0..L1_TLB_WAYS {
            let index = (set + way * L1_TLB_SETS) << PAGE_SHIFT;
            Self::touch(&mut self.l1, self.l1_base + index);
        }
    }

    pub fn evict_l2_set(&mut self, set: usize) {
        let set = set % L2_TLB_SETS;
        for way in 0..L2_TLB_WAYS {
            let index = (set + way * L2_TLB_SETS) << PAGE_SHIFT;
            Self::touch(&mut self.l2, self.l2_base + index);
        }
    }

    /// Page indexes of a full first level sweep, in access order.
    fn l1_sweep() -> impl Iterator<Item = usize> {
        (0..L1_SWEEP_SETS)
            .flat_map(|set| (0..L1_TLB_WAYS).map(move |way| set + way * L1_TLB_SETS))
    }

    pub fn evict_l1_all(&mut self) {
        for page in Self::l1_sweep() {
            Self::touch(&mut self.l1, self.l1_base + (page << PAGE_SHIFT));
        }
    }

    /// Full eviction of both levels, refreshing the first level after each
    /// second level set so that the second level walk cannot refill it.
    pub fn flush(&mut self) {
        for set in 0..L2_TLB_SETS {
            self.evict_l1_all();
            self.evict_l2_set(set);
        }
        lfence();
    }

    /// Evict only the sets the given pages map to.
    ///
    /// The touched sets are visited in ascending order so that two calls with
    /// the same targets issue the exact same access sequence.
    pub fn evict_pages(&mut self, targets: &[*const u8]) {
        let l2_sets = targets
            .iter()
            .map(|p| get_vpn(*p) % L2_TLB_SETS)
            .sorted_unstable()
            .dedup();
        for set in l2_sets {
            self.evict_l2_set(set);
        }
        let l1_sets = targets
            .iter()
            .map(|p| get_vpn(*p) % L1_TLB_SETS)
            .sorted_unstable()
            .dedup();
        for set in l1_sets {
            self.evict_l1_set(set);
        }
        lfence();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_LEN;

    #[test]
    fn aligned_offset_rounds_up() {
        assert_eq!(aligned_offset(0x40000 as *const u8, 0x40000), 0);
        assert_eq!(aligned_offset(0x40001 as *const u8, 0x40000), 0x3ffff);
    }

    #[test]
    fn buffers_are_aligned_and_large_enough() {
        let set = TlbEvictionSet::new().unwrap();
        assert_eq!((set.l1.as_ptr() as usize + set.l1_base) % TLB_BUFFER_ALIGN, 0);
        assert_eq!((set.l2.as_ptr() as usize + set.l2_base) % TLB_BUFFER_ALIGN, 0);
        let highest = (L2_TLB_SETS - 1 + (L2_TLB_WAYS - 1) * L2_TLB_SETS) << PAGE_SHIFT;
        assert!(set.l2_base + highest < set.l2.len());
        let highest = TlbEvictionSet::l1_sweep().max().unwrap() << PAGE_SHIFT;
        assert!(set.l1_base + highest < set.l1.len());
    }

    #[test]
    fn full_sweep_overflows_the_first_level() {
        let mut set = TlbEvictionSet::new().unwrap();
        set.flush();
        let touched = (0..set.l1.len() >> PAGE_SHIFT)
            .filter(|page| set.l1[page << PAGE_SHIFT] == EVICTION_MARKER)
            .count();
        assert_eq!(touched, 176);
        assert!(touched > L1_TLB_SETS * L1_TLB_WAYS);
    }

    #[test]
    fn eviction_only_writes_markers() {
        let mut set = TlbEvictionSet::new().unwrap();
        let targets: Vec<*const u8> = (0..256).map(|i| (i * PAGE_LEN) as *const u8).collect();
        set.evict_pages(&targets);
        set.flush();
        let first = set.l1_base;
        assert_eq!(set.l1[first], EVICTION_MARKER);
        assert_eq!(set.l1[first + 1], 2);
        assert_eq!(set.l2[set.l2_base + (5 << PAGE_SHIFT)], EVICTION_MARKER);
    }
}
