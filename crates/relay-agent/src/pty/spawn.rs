// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The child process + PTY half of the orchestrator: `forkpty` via `nix`, `AsyncFd`-driven non-blocking
//! I/O, SIGHUP-then-SIGKILL teardown. Copied near-verbatim from the
//! teacher's `pty::spawn::NativePty`.

use std::ffi::CString;
use std::io;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, execvp, ForkResult, Pid};
use tokio::io::unix::AsyncFd;

use super::nbio::{read_chunk, set_nonblocking, write_all, PtyFd};

/// Narrow interface the injection engine writes through, so it doesn't
/// need to know about `forkpty`/`AsyncFd` at all.
#[async_trait]
pub trait PtyWriter: Send + Sync {
    async fn write_bytes(&self, data: &[u8]) -> io::Result<()>;
}

/// Native PTY backend that spawns a child process via `forkpty`.
pub struct NativePty {
    master: AsyncFd<PtyFd>,
    child_pid: Pid,
}

impl NativePty {
    /// Spawn `command` (program + args) on a fresh PTY, optionally
    /// changing into `cwd` in the child before exec.
    // forkpty requires unsafe: post-fork child is partially initialized.
    #[allow(unsafe_code)]
    pub fn spawn(command: &[String], cwd: Option<&str>) -> anyhow::Result<Self> {
        anyhow::ensure!(!command.is_empty(), "command must have at least one element");
        let winsize = Winsize { ws_col: 120, ws_row: 40, ws_xpixel: 0, ws_ypixel: 0 };

        // SAFETY: forkpty is unsafe because the child is in a
        // partially-initialized state after fork; we chdir/exec immediately.
        let result = unsafe { forkpty(&winsize, None) }.context("forkpty failed")?;
        let ForkptyResult { master, fork_result } = result;

        match fork_result {
            ForkResult::Child => {
                if let Some(dir) = cwd {
                    let _ = chdir(dir);
                }
                std::env::set_var("TERM", "xterm-256color");

                let c_args: Vec<CString> = command
                    .iter()
                    .map(|s| CString::new(s.as_bytes()))
                    .collect::<Result<_, _>>()
                    .context("invalid command argument")?;
                execvp(&c_args[0], &c_args).context("execvp failed")?;
                unreachable!();
            }
            ForkResult::Parent { child } => {
                set_nonblocking(&master)?;
                let afd = AsyncFd::new(PtyFd(master)).context("AsyncFd::new failed")?;
                Ok(Self { master: afd, child_pid: child })
            }
        }
    }

    pub async fn read_chunk(&self, buf: &mut [u8]) -> io::Result<usize> {
        match read_chunk(&self.master, buf).await {
            Err(e) if e.raw_os_error() == Some(nix::libc::EIO) => Ok(0),
            other => other,
        }
    }

    pub fn child_pid(&self) -> u32 {
        self.child_pid.as_raw() as u32
    }

    /// Whether the child has already exited (non-blocking check), used by
    /// the startup sequence to surface an early-death diagnostic.
    pub fn has_exited(&self) -> bool {
        matches!(waitpid(self.child_pid, Some(WaitPidFlag::WNOHANG)), Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)))
    }
}

#[async_trait]
impl PtyWriter for NativePty {
    async fn write_bytes(&self, data: &[u8]) -> io::Result<()> {
        write_all(&self.master, data).await
    }
}

impl Drop for NativePty {
    fn drop(&mut self) {
        let _ = kill(self.child_pid, Signal::SIGHUP);
        std::thread::sleep(std::time::Duration::from_millis(50));
        let _ = kill(self.child_pid, Signal::SIGKILL);
        let _ = waitpid(self.child_pid, Some(WaitPidFlag::WNOHANG));
    }
}

/// Test double that records writes instead of touching a real PTY.
pub struct FakePty {
    pub written: Arc<parking_lot::Mutex<Vec<Vec<u8>>>>,
}

impl FakePty {
    pub fn new() -> Self {
        Self { written: Arc::new(parking_lot::Mutex::new(Vec::new())) }
    }
}

impl Default for FakePty {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PtyWriter for FakePty {
    async fn write_bytes(&self, data: &[u8]) -> io::Result<()> {
        self.written.lock().push(data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
#[path = "spawn_tests.rs"]
mod tests;
