// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use relay_proto::control::{ControlResponse, InjectStatus, Priority};
use tokio_util::sync::CancellationToken;

use super::*;
use crate::pty::FakePty;

fn new_engine() -> (InjectionEngine, Arc<FakePty>) {
    let fake = Arc::new(FakePty::new());
    let engine = InjectionEngine::new(fake.clone(), CancellationToken::new());
    (engine, fake)
}

#[tokio::test]
async fn delivers_a_queued_message() {
    let (engine, fake) = new_engine();
    let rx = match engine.enqueue("m1".into(), "alice".into(), "hello".into(), Priority::Normal) {
        EnqueueOutcome::Accepted(rx) => rx,
        EnqueueOutcome::Refused => panic!("expected accepted"),
    };
    let result = tokio::time::timeout(Duration::from_secs(2), rx).await.expect("no timeout").expect("not dropped");
    match result {
        ControlResponse::InjectResult { id, status, .. } => {
            assert_eq!(id, "m1");
            assert_eq!(status, InjectStatus::Delivered);
        }
        other => panic!("unexpected response: {other:?}"),
    }
    assert_eq!(fake.written.lock()[0], b"hello\n");
}

#[tokio::test]
async fn high_priority_jumps_the_queue() {
    let (engine, fake) = new_engine();
    // Enqueue three normal-priority messages first so they sit ahead of the
    // high-priority one we care about; since the drive loop may start
    // draining immediately, assert only on relative ordering within the
    // writes that were recorded, not absolute position.
    let EnqueueOutcome::Accepted(rx_low) = engine.enqueue("low".into(), "a".into(), "low-prio".into(), Priority::Low) else {
        panic!("expected accepted")
    };
    let EnqueueOutcome::Accepted(rx_high) = engine.enqueue("high".into(), "a".into(), "high-prio".into(), Priority::High) else {
        panic!("expected accepted")
    };

    let low = tokio::time::timeout(Duration::from_secs(2), rx_low).await.expect("no timeout").expect("not dropped");
    let high = tokio::time::timeout(Duration::from_secs(2), rx_high).await.expect("no timeout").expect("not dropped");
    assert!(matches!(low, ControlResponse::InjectResult { status: InjectStatus::Delivered, .. }));
    assert!(matches!(high, ControlResponse::InjectResult { status: InjectStatus::Delivered, .. }));

    let writes = fake.written.lock();
    let high_pos = writes.iter().position(|w| w == b"high-prio\n").expect("high-prio written");
    let low_pos = writes.iter().position(|w| w == b"low-prio\n").expect("low-prio written");
    assert!(high_pos <= low_pos, "high priority item should not be written after the low priority one enqueued before it reached the queue, unless it already started draining");
}

#[tokio::test]
async fn refuses_above_high_water_mark_and_re_admits_below_low_water() {
    let fake = Arc::new(FakePty::new());
    let engine = InjectionEngine::with_watermarks(fake, CancellationToken::new(), 2, 0);
    let mut events = engine.subscribe_events();

    let _r1 = engine.enqueue("a".into(), "x".into(), "one".into(), Priority::Normal);
    let EnqueueOutcome::Accepted(_r2) = engine.enqueue("b".into(), "x".into(), "two".into(), Priority::Normal) else {
        panic!("expected accepted")
    };
    // Queue length is now at the high-water mark; the next enqueue may or
    // may not be refused depending on whether the drive loop already
    // started draining, so force the race by enqueueing enough items.
    let mut refused = false;
    for i in 0..10 {
        if matches!(
            engine.enqueue(format!("extra{i}"), "x".into(), "extra".into(), Priority::Normal),
            EnqueueOutcome::Refused
        ) {
            refused = true;
            break;
        }
    }
    assert!(refused, "expected at least one enqueue to be refused once above the high-water mark");

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv()).await.expect("no timeout").expect("event received");
    assert!(matches!(event, ControlResponse::Backpressure { accept: false, .. }));
}

#[tokio::test]
async fn shutdown_fails_queued_messages_without_retry() {
    let fake = Arc::new(FakePty::new());
    let shutdown = CancellationToken::new();
    let engine = InjectionEngine::new(fake, shutdown.clone());
    let EnqueueOutcome::Accepted(rx) = engine.enqueue("m1".into(), "a".into(), "hi".into(), Priority::Normal) else {
        panic!("expected accepted")
    };
    shutdown.cancel();
    let result = tokio::time::timeout(Duration::from_secs(2), rx).await.expect("no timeout");
    // Either the message was delivered before shutdown raced it, or it was
    // failed by the shutdown drain — both are acceptable outcomes here,
    // but a dropped sender (neither) is not.
    assert!(result.is_ok(), "reply sender must not be dropped without a terminal response");
}

#[test]
fn force_reset_clears_a_long_stuck_slot() {
    let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().expect("runtime");
    rt.block_on(async {
        let fake: Arc<dyn PtyWriter> = Arc::new(FakePty::new());
        let (events, _rx) = broadcast::channel(4);
        let (reply_tx, reply_rx) = oneshot::channel();
        let shared = Shared {
            pty: fake,
            queue: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(Some(InFlightItem {
                id: "stuck".into(),
                since: Instant::now() - Duration::from_secs(61),
                reply: reply_tx,
            })),
            throttle_delay: Mutex::new(THROTTLE_MIN),
            accepting: AtomicBool::new(true),
            high_water: DEFAULT_HIGH_WATER,
            low_water: DEFAULT_LOW_WATER,
            last_output_ms: AtomicI64::new(relay_proto::now_ms()),
            queue_len: AtomicU32::new(0),
            wake: Notify::new(),
            events,
            shutdown: CancellationToken::new(),
        };

        force_reset_if_stuck(&shared);
        assert!(shared.in_flight.lock().is_none());
        let response = reply_rx.await.expect("reply sent");
        assert!(matches!(response, ControlResponse::InjectResult { status: InjectStatus::Failed, .. }));
    });
}

#[test]
fn redrive_only_fires_when_queue_is_truly_stuck() {
    let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().expect("runtime");
    rt.block_on(async {
        let fake: Arc<dyn PtyWriter> = Arc::new(FakePty::new());
        let (events, _rx) = broadcast::channel(4);
        let mut queue = VecDeque::new();
        queue.push_back(QueuedItem {
            id: "m1".into(),
            from: "a".into(),
            body: "hi".into(),
            priority: Priority::Normal,
            reply: oneshot::channel().0,
        });
        let shared = Shared {
            pty: fake,
            queue: Mutex::new(queue),
            in_flight: Mutex::new(None),
            throttle_delay: Mutex::new(THROTTLE_MIN),
            accepting: AtomicBool::new(true),
            high_water: DEFAULT_HIGH_WATER,
            low_water: DEFAULT_LOW_WATER,
            last_output_ms: AtomicI64::new(relay_proto::now_ms() - IDLE_SILENCE_MS - 1),
            queue_len: AtomicU32::new(1),
            wake: Notify::new(),
            events,
            shutdown: CancellationToken::new(),
        };

        redrive_if_queue_is_stuck(&shared);
        // `Notify` has no public "was notified" check short of awaiting it;
        // a timed wait confirms the permit was actually stored.
        tokio::time::timeout(Duration::from_millis(50), shared.wake.notified()).await.expect("redrive should have notified");
    });
}
