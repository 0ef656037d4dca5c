// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The "injection engine" half of the orchestrator: owns exclusive write
//! access to the PTY and serialises delivery of queued messages into it.
//! A single-select-loop owns the PTY (only one task ever writes to the
//! child) and in-flight injections use a cancellable spawned-task-with-
//! guarded-recheck pattern.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relay_proto::control::{ControlResponse, InjectStatus, Priority};
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::pty::PtyWriter;

/// Per-injection overall timeout.
const INJECT_TIMEOUT: Duration = Duration::from_secs(30);
/// An injection held "in flight" longer than this is force-reset.
const STUCK_INJECT_TIMEOUT: Duration = Duration::from_secs(60);
/// Stuck-queue detector tick.
const STUCK_QUEUE_TICK: Duration = Duration::from_secs(5);
/// The child must have been silent this long for the stuck-queue detector
/// to consider it idle.
const IDLE_SILENCE_MS: i64 = 2_000;

/// Adaptive throttle band the inter-message delay is kept within,
/// adjusted within a configured band
/// without naming bounds; these are this repo's choice (DESIGN.md).
const THROTTLE_MIN: Duration = Duration::from_millis(250);
const THROTTLE_MAX: Duration = Duration::from_secs(5);

/// Default backpressure water marks, overridable via
/// [`InjectionEngine::with_watermarks`].
const DEFAULT_HIGH_WATER: u32 = 50;
const DEFAULT_LOW_WATER: u32 = 10;

struct QueuedItem {
    id: String,
    from: String,
    body: String,
    priority: Priority,
    reply: oneshot::Sender<ControlResponse>,
}

struct InFlightItem {
    id: String,
    since: Instant,
    reply: oneshot::Sender<ControlResponse>,
}

struct Shared {
    pty: Arc<dyn PtyWriter>,
    queue: Mutex<VecDeque<QueuedItem>>,
    in_flight: Mutex<Option<InFlightItem>>,
    throttle_delay: Mutex<Duration>,
    accepting: AtomicBool,
    high_water: u32,
    low_water: u32,
    last_output_ms: AtomicI64,
    queue_len: AtomicU32,
    wake: Notify,
    events: broadcast::Sender<ControlResponse>,
    shutdown: CancellationToken,
}

/// Result of attempting to enqueue one message.
pub enum EnqueueOutcome {
    /// Accepted; resolves to the terminal `inject_result` once delivered,
    /// failed, or force-reset.
    Accepted(oneshot::Receiver<ControlResponse>),
    /// Refused: the queue is above its high-water mark.
    Refused,
}

/// Serialises message delivery into a single PTY. One in-flight injection
/// at a time.
pub struct InjectionEngine {
    shared: Arc<Shared>,
}

impl InjectionEngine {
    pub fn new(pty: Arc<dyn PtyWriter>, shutdown: CancellationToken) -> Self {
        Self::with_watermarks(pty, shutdown, DEFAULT_HIGH_WATER, DEFAULT_LOW_WATER)
    }

    pub fn with_watermarks(pty: Arc<dyn PtyWriter>, shutdown: CancellationToken, high_water: u32, low_water: u32) -> Self {
        let (events, _rx) = broadcast::channel(32);
        let shared = Arc::new(Shared {
            pty,
            queue: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(None),
            throttle_delay: Mutex::new(THROTTLE_MIN),
            accepting: AtomicBool::new(true),
            high_water,
            low_water,
            last_output_ms: AtomicI64::new(relay_proto::now_ms()),
            queue_len: AtomicU32::new(0),
            wake: Notify::new(),
            events,
            shutdown,
        });
        tokio::spawn(drive_loop(Arc::clone(&shared)));
        tokio::spawn(stuck_monitor(Arc::clone(&shared)));
        Self { shared }
    }

    /// Record that the PTY produced output; feeds the stuck-queue
    /// detector's "child is idle" check.
    pub fn note_output_activity(&self) {
        self.shared.last_output_ms.store(relay_proto::now_ms(), Ordering::Relaxed);
    }

    /// Subscribe to unsolicited events (currently just `backpressure`) the
    /// control socket forwards to its clients.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ControlResponse> {
        self.shared.events.subscribe()
    }

    pub fn queue_length(&self) -> u32 {
        self.shared.queue_len.load(Ordering::Relaxed)
    }

    pub fn last_output_ms(&self) -> i64 {
        self.shared.last_output_ms.load(Ordering::Relaxed)
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::Acquire)
    }

    /// Whether an injection is currently in flight.
    pub fn has_in_flight(&self) -> bool {
        self.shared.in_flight.lock().is_some()
    }

    /// Enqueue one message for injection. Higher-priority messages jump
    /// ahead of lower-priority ones already queued; FIFO within a tier.
    /// Refused above the high-water mark until the queue has drained back
    /// below the low-water mark.
    pub fn enqueue(&self, id: String, from: String, body: String, priority: Priority) -> EnqueueOutcome {
        if !self.shared.accepting.load(Ordering::Acquire) {
            return EnqueueOutcome::Refused;
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let item = QueuedItem { id, from, body, priority, reply: reply_tx };
        let len = {
            let mut q = self.shared.queue.lock();
            let pos = q.iter().position(|existing| existing.priority < item.priority).unwrap_or(q.len());
            q.insert(pos, item);
            q.len() as u32
        };
        self.shared.queue_len.store(len, Ordering::Relaxed);
        self.shared.wake.notify_one();

        if len >= self.shared.high_water && self.shared.accepting.swap(false, Ordering::AcqRel) {
            debug!(queue_length = len, "injection queue crossed high-water mark");
            let _ = self.shared.events.send(ControlResponse::Backpressure { queue_length: len, accept: false });
        }
        EnqueueOutcome::Accepted(reply_rx)
    }
}

async fn drive_loop(shared: Arc<Shared>) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                drain_on_shutdown(&shared);
                return;
            }
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep(STUCK_QUEUE_TICK) => {}
        }
        if process_queue(&shared).await {
            return;
        }
    }
}

/// Drain the queue one item at a time, honoring the adaptive throttle
/// delay between injections. Returns `true` if shutdown was observed.
async fn process_queue(shared: &Arc<Shared>) -> bool {
    loop {
        if shared.shutdown.is_cancelled() {
            drain_on_shutdown(shared);
            return true;
        }

        let item = {
            let mut q = shared.queue.lock();
            q.pop_front()
        };
        let Some(item) = item else { return false };

        let len = shared.queue.lock().len() as u32;
        shared.queue_len.store(len, Ordering::Relaxed);
        if len <= shared.low_water && !shared.accepting.swap(true, Ordering::AcqRel) {
            debug!(queue_length = len, "injection queue drained below low-water mark");
            let _ = shared.events.send(ControlResponse::Backpressure { queue_length: len, accept: true });
        }

        let id = item.id.clone();
        shared.in_flight.lock().replace(InFlightItem { id: id.clone(), since: Instant::now(), reply: item.reply });

        let body = format!("{}\n", item.body);
        let result = tokio::time::timeout(INJECT_TIMEOUT, shared.pty.write_bytes(body.as_bytes())).await;

        // If the stuck monitor already force-reset this slot (60s
        // deadline), its own Failed reply has already gone out; don't
        // send a second one.
        let Some(slot) = shared.in_flight.lock().take() else {
            continue;
        };

        let (status, error) = match result {
            Ok(Ok(())) => {
                adjust_throttle(shared, true);
                (InjectStatus::Delivered, None)
            }
            Ok(Err(e)) => {
                adjust_throttle(shared, false);
                (InjectStatus::Failed, Some(e.to_string()))
            }
            Err(_) => {
                adjust_throttle(shared, false);
                (InjectStatus::Failed, Some("injection timed out after 30s".to_owned()))
            }
        };
        if status == InjectStatus::Failed {
            warn!(id = %id, from = %item.from, error = error.as_deref().unwrap_or(""), "injection-failed");
        }
        let _ = slot.reply.send(ControlResponse::InjectResult {
            id: slot.id,
            status,
            timestamp: relay_proto::now_ms(),
            error,
        });

        let delay = *shared.throttle_delay.lock();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shared.shutdown.cancelled() => {
                drain_on_shutdown(shared);
                return true;
            }
        }
    }
}

fn adjust_throttle(shared: &Shared, success: bool) {
    let mut d = shared.throttle_delay.lock();
    *d = if success { (*d * 4 / 5).max(THROTTLE_MIN) } else { (*d * 2).min(THROTTLE_MAX) };
}

async fn stuck_monitor(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(STUCK_QUEUE_TICK);
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        force_reset_if_stuck(&shared);
        redrive_if_queue_is_stuck(&shared);
    }
}

/// If an injection has been in flight for more than [`STUCK_INJECT_TIMEOUT`],
/// clear the slot and fail it out so the next message can proceed.
fn force_reset_if_stuck(shared: &Shared) {
    let stuck = shared.in_flight.lock().as_ref().is_some_and(|f| f.since.elapsed() >= STUCK_INJECT_TIMEOUT);
    if !stuck {
        return;
    }
    if let Some(slot) = shared.in_flight.lock().take() {
        warn!(id = %slot.id, "injection stuck in flight for 60s, force-resetting");
        let _ = slot.reply.send(ControlResponse::InjectResult {
            id: slot.id,
            status: InjectStatus::Failed,
            timestamp: relay_proto::now_ms(),
            error: Some("force-reset after 60s in flight".to_owned()),
        });
    }
    shared.wake.notify_one();
}

/// If messages are queued, the child has been idle for at least
/// [`IDLE_SILENCE_MS`], nothing is in flight, and backpressure isn't
/// active, force a re-drive.
fn redrive_if_queue_is_stuck(shared: &Shared) {
    let queued = !shared.queue.lock().is_empty();
    let idle = relay_proto::now_ms() - shared.last_output_ms.load(Ordering::Relaxed) >= IDLE_SILENCE_MS;
    let no_in_flight = shared.in_flight.lock().is_none();
    let accepting = shared.accepting.load(Ordering::Acquire);
    if queued && idle && no_in_flight && accepting {
        debug!("stuck-queue detector forcing re-drive");
        shared.wake.notify_one();
    }
}

fn drain_on_shutdown(shared: &Shared) {
    if let Some(slot) = shared.in_flight.lock().take() {
        let _ = slot.reply.send(ControlResponse::InjectResult {
            id: slot.id,
            status: InjectStatus::Failed,
            timestamp: relay_proto::now_ms(),
            error: Some("orchestrator shutting down".to_owned()),
        });
    }
    let mut q = shared.queue.lock();
    shared.queue_len.store(0, Ordering::Relaxed);
    for item in q.drain(..) {
        let _ = item.reply.send(ControlResponse::InjectResult {
            id: item.id,
            status: InjectStatus::Failed,
            timestamp: relay_proto::now_ms(),
            error: Some("orchestrator shutting down".to_owned()),
        });
    }
}

#[cfg(test)]
#[path = "injection_tests.rs"]
mod tests;
