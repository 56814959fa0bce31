//! Energy counters exposed as a text file (one decimal integer on the first
//! line, e.g. a RAPL `energy_uj` node), used as a [`TimingSource`].

use crate::{OracleError, TimingSource};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

const LINE_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PowerTraceMode {
    /// Raw counter value.
    #[default]
    Direct,
    /// Difference with the previous read.
    Diff,
}

#[derive(Debug)]
pub struct PowerTrace {
    file: File,
    path: PathBuf,
    mode: PowerTraceMode,
    previous: u64,
}

impl PowerTrace {
    pub fn open(path: impl AsRef<Path>, mode: PowerTraceMode) -> Result<PowerTrace, OracleError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| OracleError::PowerTraceIo {
            path: path.clone(),
            source,
        })?;
        let mut trace = PowerTrace {
            file,
            path,
            mode,
            previous: 0,
        };
        trace.previous = trace.read_line()?;
        Ok(trace)
    }

    pub fn mode(&self) -> PowerTraceMode {
        self.mode
    }

    pub fn value(&mut self) -> Result<u64, OracleError> {
        let value = self.read_line()?;
        let previous = self.previous;
        self.previous = value;
        Ok(match self.mode {
            PowerTraceMode::Direct => value,
            PowerTraceMode::Diff => value.wrapping_sub(previous),
        })
    }

    // Reads the first line into a stack buffer, no allocation on the success path.
    fn read_line(&mut self) -> Result<u64, OracleError> {
        let io_error = |source| OracleError::PowerTraceIo {
            path: self.path.clone(),
            source,
        };
        self.file.seek(SeekFrom::Start(0)).map_err(io_error)?;
        let mut buffer = [0u8; LINE_LEN];
        let mut len = 0;
        while len < LINE_LEN {
            let n = self.file.read(&mut buffer[len..]).map_err(io_error)?;
            if n == 0 || buffer[len..len + n].contains(&b'\n') {
                len += n;
                break;
            }
            len += n;
        }
        let line = buffer[..len].split(|&b| b == b'\n').next().unwrap_or(&[]);
        std::str::from_utf8(line)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(|| OracleError::PowerTraceParse {
                path: self.path.clone(),
                line: String::from_utf8_lossy(line).into_owned(),
            })
    }
}

impl TimingSource for PowerTrace {
    fn timestamp(&mut self) -> u64 {
        match self.value() {
            Ok(v) => v,
            Err(e) => {
                warn!("{}", e);
                match self.mode {
                    PowerTraceMode::Direct => self.previous,
                    PowerTraceMode::Diff => 0,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn rewrite(file: &mut NamedTempFile, value: u64) {
        let f = file.as_file_mut();
        f.set_len(0).unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        writeln!(f, "{}", value).unwrap();
        f.flush().unwrap();
    }

    #[test]
    fn direct_mode_returns_raw_values() {
        let mut file = NamedTempFile::new().unwrap();
        rewrite(&mut file, 1000);
        let mut trace = PowerTrace::open(file.path(), PowerTraceMode::Direct).unwrap();
        assert_eq!(trace.value().unwrap(), 1000);
        rewrite(&mut file, 1234);
        assert_eq!(trace.value().unwrap(), 1234);
        assert_eq!(trace.value().unwrap(), 1234);
    }

    #[test]
    fn diff_mode_returns_deltas() {
        let mut file = NamedTempFile::new().unwrap();
        rewrite(&mut file, 500);
        let mut trace = PowerTrace::open(file.path(), PowerTraceMode::Diff).unwrap();
        rewrite(&mut file, 520);
        assert_eq!(trace.value().unwrap(), 20);
        rewrite(&mut file, 600);
        assert_eq!(trace.timestamp(), 80);
        assert_eq!(trace.value().unwrap(), 0);
    }

    #[test]
    fn only_the_first_line_is_read() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file.as_file_mut(), "42\n17\n").unwrap();
        let mut trace = PowerTrace::open(file.path(), PowerTraceMode::Direct).unwrap();
        assert_eq!(trace.value().unwrap(), 42);
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file.as_file_mut(), "not a number").unwrap();
        match PowerTrace::open(file.path(), PowerTraceMode::Direct) {
            Err(OracleError::PowerTraceParse { line, .. }) => assert_eq!(line, "not a number"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let r = PowerTrace::open(dir.path().join("energy_uj"), PowerTraceMode::Direct);
        assert!(matches!(r, Err(OracleError::PowerTraceIo { .. })));
    }
}
