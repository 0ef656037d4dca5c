// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Resource-limit opt-in: when a CPU
//! percentage is configured, confine the child to a dedicated cgroup.
//! Linux-only; every other target degrades silently.

#[cfg(target_os = "linux")]
mod imp {
    use std::fs;
    use std::path::PathBuf;

    use tracing::{debug, warn};

    const CGROUP_ROOT: &str = "/sys/fs/cgroup/relay-agent";
    /// `cpu.max` period, matching the kernel default of 100ms.
    const PERIOD_US: u64 = 100_000;

    /// Owns one cgroup for the lifetime of a single agent's child process.
    /// Removed on drop so a crashed or released agent never leaves a stale
    /// cgroup directory behind.
    pub struct CgroupGuard {
        path: PathBuf,
    }

    impl CgroupGuard {
        /// Create a cgroup under `CGROUP_ROOT`, cap it at `cpu_percent` of
        /// one core, and move `pid` into it.
        pub fn create(agent_name: &str, pid: u32, cpu_percent: f64) -> anyhow::Result<Self> {
            let path = PathBuf::from(CGROUP_ROOT).join(agent_name);
            fs::create_dir_all(&path)?;
            let quota_us = ((cpu_percent / 100.0) * PERIOD_US as f64).round().max(1.0) as u64;
            fs::write(path.join("cpu.max"), format!("{quota_us} {PERIOD_US}"))?;
            fs::write(path.join("cgroup.procs"), pid.to_string())?;
            debug!(agent = agent_name, pid, cpu_percent, "confined child to cgroup");
            Ok(Self { path })
        }
    }

    impl Drop for CgroupGuard {
        fn drop(&mut self) {
            if let Err(e) = fs::remove_dir(&self.path) {
                warn!(path = %self.path.display(), err = %e, "failed to remove cgroup on exit");
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    /// No-op on non-Linux targets: CPU limiting is a Linux-only opt-in.
    pub struct CgroupGuard;

    impl CgroupGuard {
        pub fn create(_agent_name: &str, _pid: u32, _cpu_percent: f64) -> anyhow::Result<Self> {
            Ok(Self)
        }
    }
}

pub use imp::CgroupGuard;

#[cfg(test)]
#[path = "cgroup_tests.rs"]
mod tests;
