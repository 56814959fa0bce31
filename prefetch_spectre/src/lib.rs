#![deny(unsafe_op_in_unsafe_fn)]

//! Byte by byte recovery of a secret through a prefetch timing side channel.
//!
//! An [`ExperimentDriver`](driver::ExperimentDriver) collects one batch of
//! timings per offset, hands it to the
//! [`ClassificationEngine`](classification::ClassificationEngine) and retries
//! until the batch yields a confident guess. Everything hardware related is
//! behind the capability traits of [`cache_side_channel`].

use cache_side_channel::OracleError;
use cache_utils::CacheUtilsError;
use leakage_statistics::StatsError;
use std::path::PathBuf;
use thiserror::Error;

pub mod batch;
pub mod classification;
pub mod config;
pub mod driver;
pub mod export;
pub mod scan;

#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("candidate {candidate} is outside of the alphabet {first}..={last}")]
    CandidateOutOfRange { candidate: u8, first: u8, last: u8 },
    #[error("sample set of candidate {candidate} already holds {capacity} samples")]
    SampleSetFull { candidate: u8, capacity: usize },
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error(transparent)]
    CacheUtils(#[from] CacheUtilsError),
    #[error(transparent)]
    Stats(#[from] StatsError),
    #[error("could not write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not encode report: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("could not decode report: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}
