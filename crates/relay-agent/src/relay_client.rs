// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The "relay client" half of the orchestrator: a
//! `Connection` to the daemon's Unix socket from the agent side, with a
//! register/heartbeat/reconnect loop (retries with backoff, periodic
//! re-registration) framed over `relay_proto::codec`.
//!
//! Envelopes arriving before the child is CLI-ready are buffered here
//! rather than handed to the injection engine immediately.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relay_proto::control::{ControlResponse, InjectStatus, Priority};
use relay_proto::{Envelope, EntityType, ErrorCode, FrameReader, FrameWriter, Payload};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::injection::{EnqueueOutcome, InjectionEngine};

/// Identity this process registers under.
pub struct ClientIdentity {
    pub agent_name: String,
    pub cli: String,
    pub program: Option<String>,
    pub model: Option<String>,
    pub task: Option<String>,
    pub cwd: Option<String>,
    pub team: Option<String>,
}

struct Shared {
    identity_agent_name: String,
    ready: AtomicBool,
    pending: Mutex<VecDeque<Envelope>>,
    injection: Arc<InjectionEngine>,
    outbound_tx: mpsc::UnboundedSender<Envelope>,
    session: Mutex<Option<String>>,
    resume_token: Mutex<Option<String>>,
}

/// Maintains one logical connection to the daemon across reconnects.
/// Outbound sends are queued onto an unbounded channel so callers never
/// block on the socket; a background task owns the actual stream and
/// reconnects with exponential backoff on failure.
pub struct RelayClient {
    shared: Arc<Shared>,
}

impl RelayClient {
    /// Start the connect-and-retry loop. Returns immediately; the socket
    /// task runs in the background until `shutdown` fires.
    pub fn spawn(
        socket_path: std::path::PathBuf,
        identity: ClientIdentity,
        injection: Arc<InjectionEngine>,
        frame_cap: usize,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            identity_agent_name: identity.agent_name.clone(),
            ready: AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
            injection,
            outbound_tx,
            session: Mutex::new(None),
            resume_token: Mutex::new(None),
        });

        tokio::spawn(run(shared.clone(), socket_path, identity, outbound_rx, frame_cap, shutdown));
        Arc::new(Self { shared })
    }

    /// Send an envelope (e.g. a SEND/SPAWN/RELEASE parsed from PTY
    /// output) to the daemon over whatever connection is currently live.
    /// Queued in-process if the socket is mid-reconnect.
    pub fn send(&self, env: Envelope) {
        let _ = self.shared.outbound_tx.send(env);
    }

    /// Mark the child "CLI-ready": from this point on,
    /// incoming envelopes are handed straight to the injection engine.
    /// Anything buffered while not-yet-ready is drained first, in order.
    pub fn mark_ready(&self) {
        self.shared.ready.store(true, Ordering::Release);
        let mut pending = self.shared.pending.lock();
        while let Some(env) = pending.pop_front() {
            enqueue_incoming(&self.shared, env);
        }
    }
}

/// Hand a SEND/CHANNEL_MESSAGE arriving from the daemon to the injection
/// engine, then report its terminal `delivered`/`failed` status back to
/// the daemon as an ACK/ERROR so a blocking sender's `payload_meta.sync`
/// correlation actually resolves from a genuine outcome, not just a
/// timeout.
fn enqueue_incoming(shared: &Arc<Shared>, env: Envelope) {
    let from = env.from.clone().unwrap_or_else(|| "_router".to_owned());
    let message_id = env.id.clone();
    let body = match env.payload {
        Payload::Send { body, .. } => body,
        Payload::ChannelMessage { body, .. } => body,
        _ => return,
    };
    match shared.injection.enqueue(message_id.clone(), from, body, Priority::Normal) {
        EnqueueOutcome::Accepted(rx) => {
            let shared = shared.clone();
            tokio::spawn(async move {
                let outbound = match rx.await {
                    Ok(ControlResponse::InjectResult { status: InjectStatus::Delivered, .. }) => {
                        Envelope::new(Payload::Ack { message_id }).from(shared.identity_agent_name.clone())
                    }
                    Ok(ControlResponse::InjectResult { status: InjectStatus::Failed, error, .. }) => Envelope::error(
                        shared.identity_agent_name.clone(),
                        ErrorCode::Internal,
                        error.unwrap_or_else(|| format!("injection of message {message_id} failed")),
                    ),
                    Ok(_) | Err(_) => Envelope::error(
                        shared.identity_agent_name.clone(),
                        ErrorCode::Internal,
                        format!("injection engine dropped the reply for message {message_id}"),
                    ),
                };
                let _ = shared.outbound_tx.send(outbound);
            });
        }
        EnqueueOutcome::Refused => {
            let _ = shared.outbound_tx.send(Envelope::error(
                shared.identity_agent_name.clone(),
                ErrorCode::Backpressure,
                format!("injection queue refused message {message_id}"),
            ));
        }
    }
}

async fn run(
    shared: Arc<Shared>,
    socket_path: std::path::PathBuf,
    identity: ClientIdentity,
    mut outbound_rx: mpsc::UnboundedReceiver<Envelope>,
    frame_cap: usize,
    shutdown: CancellationToken,
) {
    let mut attempt: u32 = 0;
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        match UnixStream::connect(&socket_path).await {
            Ok(stream) => {
                attempt = 0;
                info!(socket = %socket_path.display(), agent = %identity.agent_name, "connected to relay daemon");
                if let Err(e) = drive_one_session(&shared, stream, &identity, &mut outbound_rx, frame_cap, &shutdown).await {
                    warn!(err = %e, "relay connection ended, will reconnect");
                }
                if shutdown.is_cancelled() {
                    return;
                }
            }
            Err(e) => {
                debug!(err = %e, attempt, "failed to connect to relay daemon, retrying");
            }
        }
        let delay = backoff_delay(attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => return,
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let capped = attempt.min(6);
    Duration::from_millis(250u64.saturating_mul(1u64 << capped)).min(Duration::from_secs(15))
}

async fn drive_one_session(
    shared: &Arc<Shared>,
    stream: UnixStream,
    identity: &ClientIdentity,
    outbound_rx: &mut mpsc::UnboundedReceiver<Envelope>,
    frame_cap: usize,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half, frame_cap);
    let mut writer = FrameWriter::new(write_half);

    let resume_token = shared.resume_token.lock().clone();
    let hello = Envelope::new(Payload::Hello {
        agent_name: identity.agent_name.clone(),
        cli: identity.cli.clone(),
        entity_type: EntityType::Agent,
        resume_token,
        program: identity.program.clone(),
        model: identity.model.clone(),
        task: identity.task.clone(),
        cwd: identity.cwd.clone(),
        team: identity.team.clone(),
    })
    .from(identity.agent_name.clone());
    writer.write_envelope(&hello).await?;

    let welcome = reader.next_envelope().await?.ok_or_else(|| anyhow::anyhow!("daemon closed before WELCOME"))?;
    let Payload::Welcome { session_id, resume_token, .. } = welcome.payload else {
        anyhow::bail!("expected WELCOME, got {}", welcome.type_name());
    };
    *shared.session.lock() = Some(session_id);
    *shared.resume_token.lock() = Some(resume_token);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => return Ok(()),

            frame = reader.next_envelope() => {
                match frame? {
                    Some(env) => handle_inbound(shared, &mut writer, env).await?,
                    None => return Ok(()),
                }
            }

            out = outbound_rx.recv() => {
                match out {
                    Some(env) => writer.write_envelope(&env).await?,
                    None => return Ok(()),
                }
            }
        }
    }
}

async fn handle_inbound<W: tokio::io::AsyncWrite + Unpin>(
    shared: &Arc<Shared>,
    writer: &mut FrameWriter<W>,
    env: Envelope,
) -> anyhow::Result<()> {
    match &env.payload {
        Payload::Ping {} => {
            writer.write_envelope(&Envelope::new(Payload::Pong {}).from(shared.identity_agent_name.clone())).await?;
        }
        Payload::Pong {} => {}
        Payload::Error { code, message, .. } => {
            if matches!(code, ErrorCode::Protocol) {
                anyhow::bail!("protocol error from daemon: {message}");
            }
            warn!(code = %code, message = %message, "relay daemon reported an error");
        }
        Payload::Send { .. } | Payload::ChannelMessage { .. } => {
            if shared.ready.load(Ordering::Acquire) {
                enqueue_incoming(shared, env);
            } else {
                shared.pending.lock().push_back(env);
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
#[path = "relay_client_tests.rs"]
mod tests;
