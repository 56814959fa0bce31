use crate::StatsError;
use core::ops::Index;
use serde::{Deserialize, Serialize};

/// Most buckets a single histogram may hold.
pub const MAX_BUCKETS: u64 = 1 << 20;

/// Histogram whose bucket width and origin are only known at runtime.
///
/// Values below the origin land in the first bucket, values past the last
/// bucket land in the last one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Histogram {
    origin: u64,
    width: u64,
    data: Vec<u32>,
}

impl Histogram {
    pub fn new(origin: u64, width: u64, len: usize) -> Result<Self, StatsError> {
        if width == 0 {
            return Err(StatsError::ZeroWidth);
        }
        let len = len.max(1);
        if len as u64 > MAX_BUCKETS {
            return Err(StatsError::HistogramTooLarge { buckets: len as u64 });
        }
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| StatsError::HistogramTooLarge { buckets: len as u64 })?;
        data.resize(len, 0);
        Ok(Histogram {
            origin,
            width,
            data,
        })
    }

    /// Smallest histogram of the given width holding `min..=max`.
    pub fn covering(min: u64, max: u64, width: u64) -> Result<Self, StatsError> {
        if width == 0 {
            return Err(StatsError::ZeroWidth);
        }
        let buckets = max.saturating_sub(min) / width + 1;
        let len = usize::try_from(buckets)
            .map_err(|_| StatsError::HistogramTooLarge { buckets })?;
        Self::new(min, width, len)
    }

    pub fn bucket(&self, value: u64) -> usize {
        let i = (value.saturating_sub(self.origin) / self.width) as usize;
        i.min(self.data.len() - 1)
    }

    pub fn add(&mut self, value: u64) {
        let i = self.bucket(value);
        self.data[i] += 1;
    }

    /// Lower bound of bucket `i`.
    pub fn bucket_start(&self, i: usize) -> u64 {
        self.origin + i as u64 * self.width
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// No value was added yet.
    pub fn is_empty(&self) -> bool {
        self.data.iter().all(|&c| c == 0)
    }

    pub fn counts(&self) -> &[u32] {
        &self.data
    }
}

impl Index<usize> for Histogram {
    type Output = u32;

    fn index(&self, index: usize) -> &Self::Output {
        &self.data[index]
    }
}

impl Extend<u64> for Histogram {
    fn extend<T: IntoIterator<Item = u64>>(&mut self, iter: T) {
        for v in iter {
            self.add(v);
        }
    }
}
