use crate::CacheUtilsError;
use log::debug;
use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::unistd::Pid;

/// CPUs the current thread is currently allowed to run on.
pub fn available_cpus() -> Result<Vec<usize>, CacheUtilsError> {
    let current = sched_getaffinity(Pid::from_raw(0))?;
    let mut cpus = Vec::new();
    for i in 0..CpuSet::count() {
        if current.is_set(i)? {
            cpus.push(i);
        }
    }
    Ok(cpus)
}

/// Pin the calling thread to `cpu`, returning the previous affinity mask.
///
/// Fails with [`CacheUtilsError::CpuUnavailable`] when `cpu` is outside of the
/// current mask, so an invalid index is rejected before any measurement.
pub fn set_affinity(cpu: usize) -> Result<CpuSet, CacheUtilsError> {
    let old = sched_getaffinity(Pid::from_raw(0))?;
    if cpu >= CpuSet::count() || !old.is_set(cpu)? {
        return Err(CacheUtilsError::CpuUnavailable { cpu });
    }
    let mut core = CpuSet::new();
    core.set(cpu)?;
    sched_setaffinity(Pid::from_raw(0), &core)?;
    debug!("Pinned to CPU {}", cpu);
    Ok(old)
}

pub fn restore_affinity(old: &CpuSet) -> Result<(), CacheUtilsError> {
    sched_setaffinity(Pid::from_raw(0), old)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_and_restore() {
        let cpus = available_cpus().unwrap();
        assert!(!cpus.is_empty());
        let old = set_affinity(cpus[0]).unwrap();
        assert_eq!(available_cpus().unwrap(), vec![cpus[0]]);
        restore_affinity(&old).unwrap();
        assert_eq!(available_cpus().unwrap(), cpus);
    }

    #[test]
    fn out_of_range_cpu_is_rejected() {
        match set_affinity(CpuSet::count()) {
            Err(CacheUtilsError::CpuUnavailable { cpu }) => assert_eq!(cpu, CpuSet::count()),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }
}
