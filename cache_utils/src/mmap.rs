use crate::CacheUtilsError;
use core::ops::{Deref, DerefMut};
use memmap2::{MmapMut, MmapOptions};

/// Anonymous private mapping, page aligned, used for eviction buffers and
/// probe pages.
pub struct MMappedMemory {
    map: MmapMut,
}

impl MMappedMemory {
    pub fn try_new(
        size: usize,
        huge: bool,
        initializer: impl Fn(usize) -> u8,
    ) -> Result<MMappedMemory, CacheUtilsError> {
        let mut options = MmapOptions::new();
        options.len(size);
        #[cfg(target_os = "linux")]
        if huge {
            options.huge(None);
        }
        #[cfg(not(target_os = "linux"))]
        let _ = huge;
        let mut map = options
            .map_anon()
            .map_err(|source| CacheUtilsError::Mmap { size, source })?;
        for (i, byte) in map.iter_mut().enumerate() {
            *byte = initializer(i);
        }
        Ok(MMappedMemory { map })
    }

    pub fn slice(&self) -> &[u8] {
        &self.map
    }

    pub fn slice_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.map.as_ptr()
    }
}

impl Deref for MMappedMemory {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.slice()
    }
}

impl DerefMut for MMappedMemory {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.slice_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_LEN;

    #[test]
    fn mapping_is_page_aligned_and_initialised() {
        let m = MMappedMemory::try_new(4 * PAGE_LEN, false, |i| (i / PAGE_LEN) as u8).unwrap();
        assert_eq!(m.as_ptr() as usize % PAGE_LEN, 0);
        assert_eq!(m.len(), 4 * PAGE_LEN);
        assert_eq!(m[0], 0);
        assert_eq!(m[3 * PAGE_LEN + 17], 3);
    }
}
