//! Kernel module oracle reached through ioctls on a misc device.
//!
//! The module exposes a page aligned buffer of 256 pages and, given an offset,
//! touches the page indexed by the secret byte at that offset behind a bounds
//! check. Offset 0 is in bounds and is used for mistraining.

use crate::{Oracle, OracleError};
use log::{debug, trace};
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

pub const DEFAULT_DEVICE_PATH: &str = "/dev/kernel_spectre";

const MISTRAIN_OFFSET: usize = 0;

mod ioctl {
    const KERNEL_SPECTRE_IOCTL_MAGIC: u8 = 0x31;

    nix::ioctl_write_int!(access, KERNEL_SPECTRE_IOCTL_MAGIC, 1);
    nix::ioctl_read!(get_address, KERNEL_SPECTRE_IOCTL_MAGIC, 3, usize);
}

#[derive(Debug)]
pub struct DeviceOracle {
    file: File,
    path: PathBuf,
    base_address: usize,
}

impl DeviceOracle {
    /// Open the device and query the candidate buffer address once.
    pub fn open(path: impl AsRef<Path>) -> Result<DeviceOracle, OracleError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| OracleError::DeviceUnavailable {
            path: path.clone(),
            source,
        })?;
        let mut base_address: usize = 0;
        unsafe { ioctl::get_address(file.as_raw_fd(), &mut base_address) }.map_err(|source| {
            OracleError::Ioctl {
                path: path.clone(),
                source,
            }
        })?;
        debug!("Kernel Address: {:#x}", base_address);
        Ok(DeviceOracle {
            file,
            path,
            base_address,
        })
    }

    fn access(&self, offset: usize) {
        // The module has no failure path for in range requests, a failure here
        // only loses one trial.
        if let Err(e) = unsafe { ioctl::access(self.file.as_raw_fd(), offset as _) } {
            trace!("access({}) failed: {}", offset, e);
        }
    }
}

impl Oracle for DeviceOracle {
    fn base_address(&self) -> *const u8 {
        self.base_address as *const u8
    }

    fn mistrain(&mut self) {
        self.access(MISTRAIN_OFFSET);
    }

    fn configure(&mut self, offset: usize) {
        self.access(offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_device_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel_spectre");
        match DeviceOracle::open(&path) {
            Err(OracleError::DeviceUnavailable { path: p, .. }) => assert_eq!(p, path),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn regular_file_is_not_a_device() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            DeviceOracle::open(file.path()),
            Err(OracleError::Ioctl { .. })
        ));
    }
}
