//! Files written with `--store`: raw samples, histograms, the vote matrix,
//! the address scan log and the compressed experiment report.

use crate::batch::{Alphabet, Batch};
use crate::driver::ExperimentReport;
use crate::scan::ScanPoint;
use crate::ExperimentError;
use itertools::Itertools;
use leakage_statistics::histogram::Histogram;
use log::debug;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

pub const RESULT_FILE: &str = "result.csv";
pub const SCAN_FILE: &str = "log.csv";
pub const REPORT_FILE: &str = "report.msgpack.zst";

const ZSTD_LEVEL: i32 = 9;

/// Votes of every candidate at every offset, summed over the passes of one
/// repetition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultMatrix {
    offsets: Range<usize>,
    alphabet: Alphabet,
    votes: Vec<Vec<usize>>,
}

impl ResultMatrix {
    pub fn new(offsets: Range<usize>, alphabet: Alphabet) -> Self {
        let votes = vec![vec![0; alphabet.len()]; offsets.len()];
        ResultMatrix {
            offsets,
            alphabet,
            votes,
        }
    }

    pub fn record(&mut self, offset: usize, votes: impl IntoIterator<Item = (u8, usize)>) {
        let Some(row) = offset
            .checked_sub(self.offsets.start)
            .and_then(|i| self.votes.get_mut(i))
        else {
            return;
        };
        for (candidate, count) in votes {
            if let Some(i) = self.alphabet.index(candidate) {
                row[i] += count;
            }
        }
    }

    pub fn votes(&self, offset: usize, candidate: u8) -> Option<usize> {
        let row = self.votes.get(offset.checked_sub(self.offsets.start)?)?;
        Some(row[self.alphabet.index(candidate)?])
    }

    /// One row per candidate, one column per offset.
    pub fn write_csv(&self, out: &mut impl Write) -> std::io::Result<()> {
        writeln!(
            out,
            "Letter,{}",
            self.offsets.clone().map(|o| format!("Bit{}", o)).join(",")
        )?;
        for (i, candidate) in self.alphabet.iter().enumerate() {
            writeln!(
                out,
                "{},{}",
                Alphabet::label(candidate),
                self.votes.iter().map(|row| row[i]).join(",")
            )?;
        }
        Ok(())
    }
}

/// Output directory of one experiment.
#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
    histogram_scale: u64,
}

impl ResultStore {
    pub fn new(dir: impl Into<PathBuf>, histogram_scale: u64) -> Result<Self, ExperimentError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| ExperimentError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(ResultStore {
            dir,
            histogram_scale,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_stem(offset: usize, truth: Option<u8>) -> String {
        format!("{}-{}", offset, truth.map_or("_".to_owned(), Alphabet::label))
    }

    pub fn raw_path(&self, offset: usize, truth: Option<u8>) -> PathBuf {
        self.dir
            .join(format!("{}_raw.csv", Self::file_stem(offset, truth)))
    }

    pub fn histogram_path(&self, offset: usize, truth: Option<u8>) -> PathBuf {
        self.dir
            .join(format!("{}.csv", Self::file_stem(offset, truth)))
    }

    fn write_file(
        &self,
        path: PathBuf,
        f: impl FnOnce(&mut BufWriter<File>) -> std::io::Result<()>,
    ) -> Result<PathBuf, ExperimentError> {
        let io_error = |source| ExperimentError::Io {
            path: path.clone(),
            source,
        };
        let mut out = BufWriter::new(File::create(&path).map_err(io_error)?);
        f(&mut out).map_err(io_error)?;
        out.flush().map_err(io_error)?;
        debug!("Wrote {}", path.display());
        Ok(path)
    }

    /// Every sample of the batch, one row per trial.
    pub fn write_raw(
        &self,
        offset: usize,
        truth: Option<u8>,
        batch: &Batch,
    ) -> Result<PathBuf, ExperimentError> {
        self.write_file(self.raw_path(offset, truth), |out| {
            writeln!(out, "{}", batch.alphabet().iter().map(Alphabet::label).join(","))?;
            for trial in 0..batch.trials() {
                let row = batch
                    .trial(trial)
                    .map(|s| s.map_or(String::new(), |s| s.to_string()))
                    .join(",");
                writeln!(out, "{}", row)?;
            }
            Ok(())
        })
    }

    /// Per candidate histograms starting at the smallest non zero sample.
    /// Only rows where some candidate has more than one sample are kept.
    /// Nothing is written for a batch without non zero samples.
    pub fn write_histogram(
        &self,
        offset: usize,
        truth: Option<u8>,
        batch: &Batch,
    ) -> Result<Option<PathBuf>, ExperimentError> {
        let non_zero = || {
            batch
                .sets()
                .flat_map(|(_, set)| set.samples().iter().copied())
                .filter(|&s| s != 0)
        };
        let (Some(min), Some(max)) = (non_zero().min(), non_zero().max()) else {
            return Ok(None);
        };
        let mut histograms = Vec::with_capacity(batch.alphabet().len());
        for (_, set) in batch.sets() {
            let mut h = Histogram::covering(min, max, self.histogram_scale)?;
            h.extend(set.samples().iter().copied().filter(|&s| s != 0));
            histograms.push(h);
        }
        let Some(first) = histograms.first() else {
            return Ok(None);
        };
        let buckets = first.len();
        let starts: Vec<u64> = (0..buckets).map(|i| first.bucket_start(i)).collect();

        self.write_file(self.histogram_path(offset, truth), |out| {
            writeln!(
                out,
                "Cycle,{}",
                batch.alphabet().iter().map(Alphabet::label).join(",")
            )?;
            for (i, start) in starts.iter().enumerate() {
                if histograms.iter().any(|h| h[i] > 1) {
                    writeln!(out, "{},{}", start, histograms.iter().map(|h| h[i]).join(","))?;
                }
            }
            Ok(())
        })
        .map(Some)
    }

    /// Raw samples and histogram of one offset.
    pub fn write_batch(
        &self,
        offset: usize,
        truth: Option<u8>,
        batch: &Batch,
    ) -> Result<(), ExperimentError> {
        self.write_raw(offset, truth, batch)?;
        self.write_histogram(offset, truth, batch)?;
        Ok(())
    }

    pub fn write_matrix(&self, matrix: &ResultMatrix) -> Result<PathBuf, ExperimentError> {
        self.write_file(self.dir.join(RESULT_FILE), |out| matrix.write_csv(out))
    }

    pub fn write_scan(&self, points: &[ScanPoint]) -> Result<PathBuf, ExperimentError> {
        self.write_file(self.dir.join(SCAN_FILE), |out| {
            writeln!(out, "Index,Address,Time,Min,Max")?;
            for p in points {
                writeln!(
                    out,
                    "{},{:#x},{},{},{}",
                    p.index, p.address, p.summary.mean, p.summary.min, p.summary.max
                )?;
            }
            Ok(())
        })
    }

    pub fn write_report(&self, report: &ExperimentReport) -> Result<PathBuf, ExperimentError> {
        let path = self.dir.join(REPORT_FILE);
        let io_error = |source| ExperimentError::Io {
            path: path.clone(),
            source,
        };
        let file = File::create(&path).map_err(io_error)?;
        let mut encoder = zstd::Encoder::new(file, ZSTD_LEVEL).map_err(io_error)?;
        rmp_serde::encode::write(&mut encoder, report)?;
        encoder.finish().map_err(io_error)?;
        debug!("Wrote {}", path.display());
        Ok(path)
    }
}

pub fn read_report(path: impl AsRef<Path>) -> Result<ExperimentReport, ExperimentError> {
    let path = path.as_ref();
    let io_error = |source| ExperimentError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(io_error)?;
    let decoder = zstd::Decoder::new(file).map_err(io_error)?;
    Ok(rmp_serde::decode::from_read(decoder)?)
}
