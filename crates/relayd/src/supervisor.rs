// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Supervising orchestrator: per-agent lifecycle, health
//! and resource alerts, crash detection, and stale-agent eviction.
//!
//! Spawn/release goes through a `Spawner` trait rather than calling out to
//! a dashboard/SDK directly — spawning is a process-wide service owned
//! by a root context object, so tests can inject a
//! fake spawner instead of exec-ing real child processes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::kill;
use nix::unistd::Pid;
use parking_lot::Mutex;
use relay_proto::control::{control_socket_path, ControlRequest, ControlResponse};
use relay_proto::{read_json_frame, write_json_frame};
use tokio::io::BufReader;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::router::Router;

/// A request to bring up a new agent, parsed from a `SPAWN` envelope or a
/// `spawn` file-ledger record.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub name: String,
    pub cli: String,
    pub program: Option<String>,
    pub model: Option<String>,
    pub task: Option<String>,
    pub cwd: Option<String>,
    pub team: Option<String>,
}

/// Spawns/despawns the child `relay-agent` process that owns one agent's
/// PTY. Production implementations shell out to the `relay-agent` binary;
/// tests substitute a fake that never touches a real process.
pub trait Spawner: Send + Sync {
    fn spawn(&self, req: &SpawnRequest) -> anyhow::Result<u32>;
    fn release(&self, name: &str, pid: u32) -> anyhow::Result<()>;
}

/// Shells out to the `relay-agent` binary, passing agent identity via the
/// environment variables the agent process reads at startup.
pub struct ProcessSpawner {
    pub binary_path: std::path::PathBuf,
    pub daemon_socket: std::path::PathBuf,
    pub workspace_id: Option<String>,
}

impl Spawner for ProcessSpawner {
    fn spawn(&self, req: &SpawnRequest) -> anyhow::Result<u32> {
        let mut cmd = std::process::Command::new(&self.binary_path);
        cmd.env("AGENT_RELAY_NAME", &req.name)
            .env("RELAY_AGENT_NAME", &req.name)
            .env("AGENT_RELAY_SOCKET", &self.daemon_socket);
        if let Some(ws) = &self.workspace_id {
            cmd.env("WORKSPACE_ID", ws);
        }
        if let Some(program) = &req.program {
            cmd.arg("--program").arg(program);
        } else {
            cmd.arg("--program").arg(&req.cli);
        }
        if let Some(cwd) = &req.cwd {
            cmd.current_dir(cwd);
        }
        let child = cmd.spawn().map_err(|e| anyhow::anyhow!("spawning relay-agent: {e}"))?;
        Ok(child.id())
    }

    fn release(&self, _name: &str, pid: u32) -> anyhow::Result<()> {
        let _ = kill(Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGTERM);
        Ok(())
    }
}

fn is_process_alive(pid: u32) -> bool {
    let Ok(pid_i32) = i32::try_from(pid) else { return false };
    kill(Pid::from_raw(pid_i32), None).is_ok()
}

/// Likely cause of a crash, inferred from RSS trend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashCause {
    Oom,
    CpuSpike,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct CrashContext {
    pub peak_rss_bytes: u64,
    pub avg_rss_bytes: u64,
    pub cause: CrashCause,
}

/// Per-(workspace, name) health state.
struct HealthRecord {
    pid: u32,
    last_heartbeat: Instant,
    last_rss_bytes: u64,
    peak_rss_bytes: u64,
    rss_samples: u64,
    rss_sum: u64,
    last_cpu_percent: f64,
    releasing: bool,
    last_cpu_alert_at: Option<Instant>,
}

/// Manages one or more agents under a workspace: spawn/release, heartbeat
/// polling, crash detection, and resource alerts.
pub struct SupervisingOrchestrator {
    router: Arc<Router>,
    spawner: Arc<dyn Spawner>,
    health: Mutex<HashMap<String, HealthRecord>>,
    heartbeat_interval: Duration,
    cpu_alert_threshold: f64,
    alert_cooldown: Duration,
    workspace_id: Option<String>,
}

impl SupervisingOrchestrator {
    pub fn new(
        router: Arc<Router>,
        spawner: Arc<dyn Spawner>,
        heartbeat_interval: Duration,
        cpu_alert_threshold: f64,
        alert_cooldown: Duration,
    ) -> Arc<Self> {
        Self::with_workspace(router, spawner, heartbeat_interval, cpu_alert_threshold, alert_cooldown, None)
    }

    pub fn with_workspace(
        router: Arc<Router>,
        spawner: Arc<dyn Spawner>,
        heartbeat_interval: Duration,
        cpu_alert_threshold: f64,
        alert_cooldown: Duration,
        workspace_id: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            router,
            spawner,
            health: Mutex::new(HashMap::new()),
            heartbeat_interval,
            cpu_alert_threshold,
            alert_cooldown,
            workspace_id,
        })
    }

    /// Spawn a new agent, replacing any prior PID registered under the
    /// same name.
    pub fn spawn(&self, req: &SpawnRequest) -> anyhow::Result<u32> {
        let pid = self.spawner.spawn(req)?;
        self.health.lock().insert(
            req.name.clone(),
            HealthRecord {
                pid,
                last_heartbeat: Instant::now(),
                last_rss_bytes: 0,
                peak_rss_bytes: 0,
                rss_samples: 0,
                rss_sum: 0,
                last_cpu_percent: 0.0,
                releasing: false,
                last_cpu_alert_at: None,
            },
        );
        info!(agent = %req.name, pid, "agent spawned");
        Ok(pid)
    }

    /// Explicit release: stop monitoring before asking the spawner to
    /// terminate, so a subsequent heartbeat tick never treats this exit
    /// as a crash.
    pub fn release(&self, name: &str) -> anyhow::Result<()> {
        let record = self.health.lock().remove(name);
        if let Some(record) = record {
            self.spawner.release(name, record.pid)?;
        }
        self.router.force_remove_agent(name);
        Ok(())
    }

    /// Record a heartbeat/resource sample for `name`, e.g. fed by the
    /// agent's own `HEALTH` report or a control-socket status poll.
    pub fn record_sample(&self, name: &str, rss_bytes: u64, cpu_percent: f64) {
        if let Some(record) = self.health.lock().get_mut(name) {
            record.last_heartbeat = Instant::now();
            record.last_rss_bytes = rss_bytes;
            record.peak_rss_bytes = record.peak_rss_bytes.max(rss_bytes);
            record.rss_samples += 1;
            record.rss_sum += rss_bytes;
            record.last_cpu_percent = cpu_percent;
        }
    }

    fn crash_context(record: &HealthRecord) -> CrashContext {
        let avg = if record.rss_samples > 0 { record.rss_sum / record.rss_samples } else { 0 };
        let cause = if record.last_cpu_percent > 0.0 && record.peak_rss_bytes == 0 {
            CrashCause::CpuSpike
        } else if record.peak_rss_bytes > 0 && record.last_rss_bytes >= record.peak_rss_bytes {
            CrashCause::Oom
        } else {
            CrashCause::Unknown
        };
        CrashContext { peak_rss_bytes: record.peak_rss_bytes, avg_rss_bytes: avg, cause }
    }

    /// One heartbeat tick: probe every tracked PID, detect crashes, and
    /// fire resource alerts over the cooldown window.
    pub async fn tick(&self) {
        let dead: Vec<(String, HealthRecord)> = {
            let mut health = self.health.lock();
            let dead_names: Vec<String> = health
                .iter()
                .filter(|(_, r)| !r.releasing && !is_process_alive(r.pid))
                .map(|(n, _)| n.clone())
                .collect();
            dead_names.into_iter().filter_map(|name| health.remove(&name).map(|r| (name, r))).collect()
        };

        for (name, record) in dead {
            let ctx = Self::crash_context(&record);
            warn!(agent = %name, pid = record.pid, cause = ?ctx.cause, "agent crashed");
            self.router
                .broadcast_system(format!(
                    "AGENT CRASHED: \"{name}\" (pid {}) — likely cause: {:?}",
                    record.pid, ctx.cause
                ))
                .await;
            self.router.force_remove_agent(&name);
        }

        let mut to_alert: Vec<(String, u64, f64)> = Vec::new();
        {
            let mut health = self.health.lock();
            let now = Instant::now();
            for (name, record) in health.iter_mut() {
                let cpu_alert_due = record.last_cpu_percent >= self.cpu_alert_threshold
                    && record
                        .last_cpu_alert_at
                        .map(|t| now.duration_since(t) >= self.alert_cooldown)
                        .unwrap_or(true);
                if cpu_alert_due {
                    record.last_cpu_alert_at = Some(now);
                    to_alert.push((name.clone(), record.last_rss_bytes, record.last_cpu_percent));
                }
            }
        }
        for (name, rss, cpu) in to_alert {
            self.router
                .notify_users(format!(
                    "RESOURCE ALERT: \"{name}\" is using {cpu:.0}% CPU (rss={rss} bytes)"
                ))
                .await;
        }
    }

    /// Mark an agent as intentionally shutting down so its next PID death
    /// is not reported as a crash.
    pub fn mark_releasing(&self, name: &str) {
        if let Some(record) = self.health.lock().get_mut(name) {
            record.releasing = true;
        }
    }

    pub fn is_tracked(&self, name: &str) -> bool {
        self.health.lock().contains_key(name)
    }

    fn tracked_names(&self) -> Vec<String> {
        self.health.lock().keys().cloned().collect()
    }

    /// Run the heartbeat loop until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.cancelled() => break,
            }
        }
    }

    /// Dial one agent's control socket, send a `status` request, and feed
    /// the `rss_bytes`/`cpu_percent` it reports into [`Self::record_sample`].
    /// Errors (agent not yet listening, socket gone) are swallowed —
    /// `tick`'s PID liveness check is the authority on whether the agent is
    /// still alive, this just enriches the sample when reachable.
    async fn poll_one(&self, name: &str) {
        let path = control_socket_path(self.workspace_id.as_deref(), name);
        let stream = match UnixStream::connect(&path).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(agent = %name, path = %path.display(), err = %e, "health poll: control socket unreachable");
                return;
            }
        };
        let (read_half, mut write_half) = stream.into_split();
        if let Err(e) = write_json_frame(&mut write_half, &ControlRequest::Status {}).await {
            debug!(agent = %name, err = %e, "health poll: failed to write status request");
            return;
        }
        let mut reader = BufReader::new(read_half);
        let mut buf = Vec::new();
        match read_json_frame::<_, ControlResponse>(&mut reader, &mut buf, relay_proto::DEFAULT_FRAME_CAP).await {
            Ok(Some(ControlResponse::Status { rss_bytes, cpu_percent, .. })) => {
                self.record_sample(name, rss_bytes, cpu_percent);
            }
            Ok(Some(other)) => debug!(agent = %name, response = ?other, "health poll: unexpected control response"),
            Ok(None) => debug!(agent = %name, "health poll: control socket closed before responding"),
            Err(e) => debug!(agent = %name, err = %e, "health poll: failed to read status response"),
        }
    }

    /// Run the control-socket health poll loop until `shutdown` fires,
    /// feeding every tracked agent's RSS/CPU sample into its `HealthRecord`
    /// so `crash_context` and the CPU resource-alert branch in `tick` have
    /// real data to work with.
    pub async fn run_health_poll(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for name in self.tracked_names() {
                        self.poll_one(&name).await;
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    }

    /// Drain `SPAWN`/`RELEASE` requests forwarded from connections.
    pub async fn run_spawn_queue(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<SpawnRequest>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                req = rx.recv() => {
                    match req {
                        Some(req) => {
                            if let Err(e) = self.spawn(&req) {
                                warn!(agent = %req.name, err = %e, "failed to spawn agent");
                                self.router.clear_spawning(&req.name);
                            }
                        }
                        None => break,
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    }
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
