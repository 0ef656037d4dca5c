// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Ties the orchestrator's five narrow pieces together: spawn the child on a
//! PTY, bind the control socket, attach to the relay daemon, tail the
//! child's output into the parser, and translate parsed commands into
//! outbound envelopes.
//!
//! Start-up ordering is strict: spawn, connect
//! control (here: bind it — this repo's control socket is a server the
//! orchestrator owns rather than a peer it dials), attach to the daemon,
//! wait for CLI-ready, then flip `readyForMessages`.

use std::sync::Arc;
use std::time::Duration;

use relay_proto::{Envelope, Payload};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cgroup::CgroupGuard;
use crate::config::Config;
use crate::control::{self, ControlState};
use crate::health::HealthReporter;
use crate::injection::InjectionEngine;
use crate::parser::{CommandParser, ParsedCommand};
use crate::pty::{NativePty, PtyWriter};
use crate::relay_client::{ClientIdentity, RelayClient};

/// How long to give a freshly-spawned child to prove it didn't die on
/// exec before committing to the rest of start-up.
const EARLY_DEATH_GRACE: Duration = Duration::from_millis(100);
/// Cadence for the CLI-ready silence check.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Health sampler cadence.
const HEALTH_SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

/// Run one agent's orchestrator to completion: until the child exits, the
/// daemon tells it to shut down, or `shutdown` fires.
pub async fn run(config: Config, shutdown: CancellationToken) -> anyhow::Result<()> {
    let agent_name = config.agent_name().to_owned();
    let pty = Arc::new(NativePty::spawn(&config.program, config.cwd.as_deref())?);

    tokio::time::sleep(EARLY_DEATH_GRACE).await;
    if pty.has_exited() {
        anyhow::bail!("child process for agent {agent_name:?} exited immediately after spawn");
    }

    let health = HealthReporter::new(pty.child_pid());
    health.clone().spawn(HEALTH_SAMPLE_INTERVAL, shutdown.clone());

    let _cgroup: Option<CgroupGuard> = match config.cpu_limit_percent {
        Some(percent) => match CgroupGuard::create(&agent_name, pty.child_pid(), percent) {
            Ok(guard) => Some(guard),
            Err(e) => {
                warn!(agent = %agent_name, err = %e, "failed to apply cgroup CPU limit, continuing unconfined");
                None
            }
        },
        None => None,
    };

    let injection = Arc::new(InjectionEngine::with_watermarks(
        pty.clone() as Arc<dyn PtyWriter>,
        shutdown.clone(),
        config.queue_high_water as u32,
        config.queue_low_water as u32,
    ));

    let control_path = config.control_socket_path();
    let control_listener = control::bind(&control_path)?;
    let control_state = Arc::new(ControlState { injection: injection.clone(), health: health.clone(), shutdown: shutdown.clone() });
    tokio::spawn(control::run(control_listener, control_state, config.frame_cap, shutdown.clone()));
    info!(agent = %agent_name, socket = %control_path.display(), "control socket listening");

    let identity = ClientIdentity {
        agent_name: agent_name.clone(),
        cli: config.cli_name(),
        program: Some(config.program.join(" ")),
        model: config.model.clone(),
        task: config.task.clone(),
        cwd: config.cwd.clone(),
        team: config.team.clone(),
    };
    let client = RelayClient::spawn(config.daemon_socket_path(), identity, injection.clone(), config.frame_cap, shutdown.clone());

    run_output_loop(&pty, &injection, &client, &agent_name, config.silence_ms, &shutdown).await;
    Ok(())
}

/// Tail the PTY, feed the parser, dispatch parsed commands, and flip the
/// daemon-visible ready flag once the child has gone quiet after its
/// first output.
async fn run_output_loop(
    pty: &Arc<NativePty>,
    injection: &Arc<InjectionEngine>,
    client: &Arc<RelayClient>,
    agent_name: &str,
    silence_ms: u64,
    shutdown: &CancellationToken,
) {
    let mut parser = CommandParser::new();
    let mut buf = [0u8; 8192];
    let mut first_output_at: Option<Instant> = None;
    let mut ready_flipped = false;
    let mut ready_ticker = tokio::time::interval(READY_POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,

            chunk = pty.read_chunk(&mut buf) => {
                match chunk {
                    Ok(0) => {
                        info!(agent = %agent_name, "child process closed its output, orchestrator exiting");
                        return;
                    }
                    Ok(n) => {
                        injection.note_output_activity();
                        first_output_at.get_or_insert_with(Instant::now);
                        for command in parser.feed(&buf[..n]) {
                            if let Some(env) = to_envelope(command, agent_name) {
                                client.send(env);
                            }
                        }
                    }
                    Err(e) => {
                        warn!(agent = %agent_name, err = %e, "error reading from PTY, orchestrator exiting");
                        return;
                    }
                }
            }

            _ = ready_ticker.tick(), if !ready_flipped && first_output_at.is_some() => {
                let idle_ms = relay_proto::now_ms() - injection.last_output_ms();
                if idle_ms >= silence_ms as i64 {
                    client.mark_ready();
                    ready_flipped = true;
                    info!(agent = %agent_name, "child is CLI-ready, accepting injected messages");
                }
            }
        }
    }
}

/// Translate one parsed outbound command into the envelope the daemon
/// expects.
fn to_envelope(command: ParsedCommand, agent_name: &str) -> Option<Envelope> {
    match command {
        ParsedCommand::Send { target, thread, body } => {
            Some(Envelope::new(Payload::Send { body, thread }).to(target).from(agent_name.to_owned()))
        }
        ParsedCommand::Spawn { name, cli, model, task, cwd, team } => Some(
            Envelope::new(Payload::Spawn { name, cli, program: None, model, task, cwd, team }).from(agent_name.to_owned()),
        ),
        ParsedCommand::Release { name } => Some(Envelope::new(Payload::Release { name }).from(agent_name.to_owned())),
    }
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
