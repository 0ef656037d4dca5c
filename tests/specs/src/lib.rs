// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Spawns the real `relayd` binary as a subprocess and exercises it as a
//! bare envelope peer would: one raw connection per simulated agent,
//! speaking the line-delimited JSON protocol directly over the daemon's
//! Unix socket. `relay-agent` itself is only spawned where a scenario
//! needs a real PID to kill (forced eviction).

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use relay_proto::{Envelope, FrameReader, FrameWriter, Payload};
use tokio::net::UnixStream;

/// Resolve the path to a compiled binary in the workspace's `target/debug`.
fn workspace_binary(name: &str) -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join(name)
}

pub fn relayd_binary() -> PathBuf {
    workspace_binary("relayd")
}

pub fn relay_agent_binary() -> PathBuf {
    workspace_binary("relay-agent")
}

/// A data directory a [`RelaydProcess`] runs against: either a fresh
/// tempdir the process owns, or a path a scenario owns itself (so the
/// directory survives a simulated crash-and-restart across two
/// [`RelaydProcess`] instances).
pub enum DataDir {
    Owned(tempfile::TempDir),
    Borrowed(PathBuf),
}

impl DataDir {
    pub fn path(&self) -> &Path {
        match self {
            Self::Owned(dir) => dir.path(),
            Self::Borrowed(path) => path,
        }
    }
}

/// A running `relayd` process, killed on drop. An owned data directory is
/// torn down alongside it; a borrowed one is left for the caller.
pub struct RelaydProcess {
    child: Child,
    data_dir: DataDir,
    socket_path: PathBuf,
}

/// Builder for configuring a [`RelaydProcess`] before spawning it.
pub struct RelaydBuilder {
    data_dir: Option<DataDir>,
    health_interval_secs: u64,
    sync_timeout_ms: u64,
}

impl Default for RelaydBuilder {
    fn default() -> Self {
        Self { data_dir: None, health_interval_secs: 10, sync_timeout_ms: 30_000 }
    }
}

impl RelaydBuilder {
    /// Run against a path the caller owns the lifetime of, e.g. to kill
    /// and restart a daemon against the same state.
    pub fn data_dir_path(mut self, path: PathBuf) -> Self {
        self.data_dir = Some(DataDir::Borrowed(path));
        self
    }

    /// Shorten the supervisor's health-tick interval, e.g. to make
    /// forced-eviction scenarios observable within a test's patience.
    pub fn health_interval_secs(mut self, secs: u64) -> Self {
        self.health_interval_secs = secs;
        self
    }

    pub fn sync_timeout_ms(mut self, ms: u64) -> Self {
        self.sync_timeout_ms = ms;
        self
    }

    pub fn spawn(self) -> anyhow::Result<RelaydProcess> {
        let binary = relayd_binary();
        anyhow::ensure!(binary.exists(), "relayd binary not found at {}", binary.display());

        let data_dir = match self.data_dir {
            Some(dir) => dir,
            None => DataDir::Owned(tempfile::tempdir()?),
        };
        let socket_path = data_dir.path().join("relay.sock");

        let child = Command::new(&binary)
            .arg("--data-dir")
            .arg(data_dir.path())
            .arg("--health-interval-secs")
            .arg(self.health_interval_secs.to_string())
            .arg("--default-sync-timeout-ms")
            .arg(self.sync_timeout_ms.to_string())
            .arg("--log-format")
            .arg("text")
            .arg("--log-level")
            .arg("warn")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        Ok(RelaydProcess { child, data_dir, socket_path })
    }
}

impl RelaydProcess {
    pub fn build() -> RelaydBuilder {
        RelaydBuilder::default()
    }

    pub fn start() -> anyhow::Result<Self> {
        Self::build().spawn()
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn data_dir(&self) -> &Path {
        self.data_dir.path()
    }

    pub fn inbox_dir(&self) -> PathBuf {
        self.data_dir.path().join("inbox")
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Kill the process immediately (simulates a crash, as opposed to the
    /// graceful SIGTERM shutdown the binary also understands).
    pub fn kill(&mut self) -> anyhow::Result<()> {
        self.child.kill()?;
        self.child.wait()?;
        Ok(())
    }

    /// Poll for the listening socket to appear.
    pub async fn wait_listening(&self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.socket_path.exists() && UnixStream::connect(&self.socket_path).await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("relayd socket did not appear within {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

impl Drop for RelaydProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// One simulated agent's raw connection to the daemon: a thin wrapper
/// over [`FrameReader`]/[`FrameWriter`] so scenario tests can speak the
/// envelope protocol directly without a real PTY child behind it.
pub struct AgentConn {
    reader: FrameReader<tokio::io::ReadHalf<UnixStream>>,
    writer: FrameWriter<tokio::io::WriteHalf<UnixStream>>,
}

impl AgentConn {
    /// Dial the daemon and perform the HELLO/WELCOME handshake. Returns
    /// the connection plus the WELCOME payload's session id and resume
    /// token, which the caller needs to reconnect and resume later.
    pub async fn connect(
        socket_path: &Path,
        agent_name: &str,
        resume_token: Option<&str>,
    ) -> anyhow::Result<(Self, Envelope)> {
        let stream = UnixStream::connect(socket_path).await?;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read_half, relay_proto::DEFAULT_FRAME_CAP);
        let mut writer = FrameWriter::new(write_half);

        let hello = Envelope::new(Payload::Hello {
            agent_name: agent_name.to_owned(),
            cli: "test-harness".to_owned(),
            entity_type: relay_proto::EntityType::Agent,
            resume_token: resume_token.map(str::to_owned),
            program: None,
            model: None,
            task: None,
            cwd: None,
            team: None,
        })
        .from(agent_name.to_owned());
        writer.write_envelope(&hello).await?;

        let welcome = reader
            .next_envelope()
            .await?
            .ok_or_else(|| anyhow::anyhow!("connection closed before WELCOME"))?;
        anyhow::ensure!(
            matches!(welcome.payload, Payload::Welcome { .. }),
            "expected WELCOME, got {}",
            welcome.type_name()
        );

        Ok((Self { reader, writer }, welcome))
    }

    pub async fn send(&mut self, env: Envelope) -> anyhow::Result<()> {
        self.writer.write_envelope(&env).await
    }

    /// Receive the next envelope, skipping PINGs (the test harness never
    /// needs to answer heartbeats within the short windows these
    /// scenarios run in).
    pub async fn recv(&mut self, timeout: Duration) -> anyhow::Result<Envelope> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            anyhow::ensure!(remaining > Duration::ZERO, "timed out waiting for an envelope");
            let env = tokio::time::timeout(remaining, self.reader.next_envelope())
                .await
                .map_err(|_| anyhow::anyhow!("timed out waiting for an envelope"))??
                .ok_or_else(|| anyhow::anyhow!("connection closed"))?;
            if matches!(env.payload, Payload::Ping {}) {
                continue;
            }
            return Ok(env);
        }
    }

    /// Receive envelopes until `pred` matches one or `timeout` elapses,
    /// returning the matching envelope. Lets a test ignore interleaved
    /// replay/backlog traffic it doesn't care about.
    pub async fn recv_until(
        &mut self,
        timeout: Duration,
        mut pred: impl FnMut(&Envelope) -> bool,
    ) -> anyhow::Result<Envelope> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            anyhow::ensure!(remaining > Duration::ZERO, "timed out waiting for a matching envelope");
            let env = self.recv(remaining).await?;
            if pred(&env) {
                return Ok(env);
            }
        }
    }
}

/// Write a message into an agent's outbox directory in the file-ledger's
/// header-block-then-body format.
pub fn write_outbox_message(
    inbox_dir: &Path,
    sender_agent: &str,
    file_name: &str,
    to: &str,
    body: &str,
) -> anyhow::Result<PathBuf> {
    let dir = inbox_dir.join(sender_agent);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(file_name);
    std::fs::write(&path, format!("TO: {to}\nKIND: msg\n\n{body}"))?;
    Ok(path)
}
