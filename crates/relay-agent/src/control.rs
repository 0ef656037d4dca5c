// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The per-agent control socket: a Unix domain socket
//! server implementing `inject`/`status`/`shutdown`, plus unsolicited
//! `backpressure` events, framed with the same line-delimited JSON codec
//! as the daemon socket (`relay_proto::codec`).

use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::Path;
use std::sync::Arc;

use relay_proto::control::{ControlRequest, ControlResponse, InjectStatus};
use relay_proto::{read_json_frame, write_json_frame};
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::health::HealthReporter;
use crate::injection::{EnqueueOutcome, InjectionEngine};

/// How long the child must have been silent for `status.agent_idle` to
/// report true.
const IDLE_THRESHOLD_MS: i64 = 2_000;

/// Bind the per-agent control socket at `path`, refusing to unlink
/// anything that isn't already a socket.
pub fn bind(path: &Path) -> anyhow::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if let Ok(metadata) = std::fs::metadata(path) {
        if !metadata.file_type().is_socket() {
            anyhow::bail!("refusing to start: {} exists and is not a socket", path.display());
        }
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

/// Shared state every control connection dispatches requests against.
pub struct ControlState {
    pub injection: Arc<InjectionEngine>,
    pub health: Arc<HealthReporter>,
    pub shutdown: CancellationToken,
}

/// Accept loop for the control socket; one task per connection.
pub async fn run(listener: UnixListener, state: Arc<ControlState>, frame_cap: usize, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let state = state.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, state, frame_cap, shutdown).await {
                                debug!(err = %e, "control connection ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(err = %e, "failed to accept control connection"),
                }
            }
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    state: Arc<ControlState>,
    frame_cap: usize,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::new();
    let mut events = state.injection.subscribe_events();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            event = events.recv() => {
                match event {
                    Ok(event) => write_json_frame(&mut write_half, &event).await?,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
            frame = read_json_frame::<_, ControlRequest>(&mut reader, &mut buf, frame_cap) => {
                let Some(request) = frame? else { return Ok(()) };
                let response = dispatch(&state, request).await;
                let is_shutdown_ack = matches!(response, ControlResponse::ShutdownAck {});
                write_json_frame(&mut write_half, &response).await?;
                if is_shutdown_ack {
                    state.shutdown.cancel();
                    return Ok(());
                }
            }
        }
    }
}

async fn dispatch(state: &ControlState, request: ControlRequest) -> ControlResponse {
    match request {
        ControlRequest::Inject { id, from, body, priority } => {
            match state.injection.enqueue(id.clone(), from, body, priority) {
                EnqueueOutcome::Accepted(rx) => rx.await.unwrap_or(ControlResponse::InjectResult {
                    id,
                    status: InjectStatus::Failed,
                    timestamp: relay_proto::now_ms(),
                    error: Some("injection engine dropped the reply".to_owned()),
                }),
                EnqueueOutcome::Refused => ControlResponse::InjectResult {
                    id,
                    status: InjectStatus::Failed,
                    timestamp: relay_proto::now_ms(),
                    error: Some("queue above high-water mark".to_owned()),
                },
            }
        }
        ControlRequest::Status {} => {
            let sample = state.health.sample();
            let last_output_ms = state.injection.last_output_ms();
            ControlResponse::Status {
                agent_idle: relay_proto::now_ms() - last_output_ms >= IDLE_THRESHOLD_MS,
                queue_length: state.injection.queue_length(),
                cursor_position: None,
                last_output_ms,
                rss_bytes: sample.rss_bytes,
                cpu_percent: sample.cpu_percent,
            }
        }
        ControlRequest::Shutdown {} => ControlResponse::ShutdownAck {},
    }
}

#[cfg(test)]
#[path = "control_tests.rs"]
mod tests;
