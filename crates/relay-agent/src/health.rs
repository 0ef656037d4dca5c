// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The "health reporter" half of the orchestrator: samples `/proc/<pid>/status` (VmRSS) and
//! `/proc/<pid>/stat` (utime+stime) on an interval. Fills the role of the
//! out-of-scope `MemoryMonitor` collaborator closely enough that
//! `relayd`'s supervising orchestrator can consume it
//! through the control socket's `status` response instead of needing the
//! real external service.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Samples of a child process's resource usage.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sample {
    pub rss_bytes: u64,
    pub cpu_percent: f64,
}

/// Background sampler for one child PID. Cheap to read from any task:
/// [`Self::sample`] returns the last value computed by the sampling loop
/// rather than touching `/proc` itself.
pub struct HealthReporter {
    pid: u32,
    rss_bytes: AtomicU64,
    cpu_percent_bits: AtomicU64,
}

impl HealthReporter {
    pub fn new(pid: u32) -> Arc<Self> {
        Arc::new(Self { pid, rss_bytes: AtomicU64::new(0), cpu_percent_bits: AtomicU64::new(0) })
    }

    pub fn sample(&self) -> Sample {
        Sample {
            rss_bytes: self.rss_bytes.load(Ordering::Relaxed),
            cpu_percent: f64::from_bits(self.cpu_percent_bits.load(Ordering::Relaxed)),
        }
    }

    fn store(&self, sample: Sample) {
        self.rss_bytes.store(sample.rss_bytes, Ordering::Relaxed);
        self.cpu_percent_bits.store(sample.cpu_percent.to_bits(), Ordering::Relaxed);
    }

    /// Spawn the sampling loop; stops when `shutdown` fires or the child no
    /// longer has a `/proc` entry.
    pub fn spawn(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        tokio::spawn(async move {
            let mut prev: Option<CpuTicks> = None;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                match read_proc(self.pid, prev) {
                    Ok((sample, ticks)) => {
                        self.store(sample);
                        prev = Some(ticks);
                    }
                    Err(e) => {
                        debug!(pid = self.pid, err = %e, "health sample failed, child likely exited");
                    }
                }
            }
        });
    }
}

#[derive(Debug, Clone, Copy)]
struct CpuTicks {
    total_ticks: u64,
    at: std::time::Instant,
}

fn read_proc(pid: u32, prev: Option<CpuTicks>) -> anyhow::Result<(Sample, CpuTicks)> {
    let rss_bytes = read_vm_rss(pid)?;
    let total_ticks = read_total_ticks(pid)?;
    let now = CpuTicks { total_ticks, at: std::time::Instant::now() };

    let cpu_percent = match prev {
        Some(prev) => {
            let elapsed = now.at.saturating_duration_since(prev.at).as_secs_f64();
            if elapsed <= 0.0 {
                0.0
            } else {
                let clk_tck = clock_ticks_per_sec();
                let delta_ticks = now.total_ticks.saturating_sub(prev.total_ticks) as f64;
                (delta_ticks / clk_tck / elapsed) * 100.0
            }
        }
        None => 0.0,
    };

    Ok((Sample { rss_bytes, cpu_percent }, now))
}

fn read_vm_rss(pid: u32) -> anyhow::Result<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status"))?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().unwrap_or(0);
            return Ok(kb * 1024);
        }
    }
    Ok(0)
}

/// Sum of `utime` + `stime` (fields 14, 15 of `/proc/<pid>/stat`), in clock
/// ticks. The process name field (field 2) is parenthesized and may
/// contain spaces, so fields are counted after the closing `)`.
fn read_total_ticks(pid: u32) -> anyhow::Result<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat"))?;
    let after_name = stat.rfind(')').map(|i| &stat[i + 1..]).unwrap_or(&stat);
    let fields: Vec<&str> = after_name.split_whitespace().collect();
    // Fields here are numbered from the one after `)`, i.e. field 3 onward;
    // utime is original field 14 (index 11 here), stime is field 15 (index 12).
    let utime: u64 = fields.get(11).and_then(|s| s.parse().ok()).unwrap_or(0);
    let stime: u64 = fields.get(12).and_then(|s| s.parse().ok()).unwrap_or(0);
    Ok(utime + stime)
}

fn clock_ticks_per_sec() -> f64 {
    // SAFETY: sysconf with a valid, well-known name is always safe to call.
    #[allow(unsafe_code)]
    let ticks = unsafe { nix::libc::sysconf(nix::libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as f64
    } else {
        100.0
    }
}

#[cfg(test)]
#[path = "health_tests.rs"]
mod tests;
