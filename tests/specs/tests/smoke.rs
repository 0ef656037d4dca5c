// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end smoke tests that spawn the real `relayd` binary and drive it
//! over raw Unix-socket envelope connections, exercising the concrete
//! scenarios the daemon is built against.

use std::time::Duration;

use relay_proto::{Envelope, ErrorCode, Payload, SyncMeta};
use relay_specs::{write_outbox_message, AgentConn, RelaydProcess};

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn round_trip_dm_delivers_persists_and_acks() -> anyhow::Result<()> {
    let relayd = RelaydProcess::start()?;
    relayd.wait_listening(TIMEOUT).await?;

    let (mut alice, _) = AgentConn::connect(relayd.socket_path(), "alice", None).await?;
    let (mut bob, _) = AgentConn::connect(relayd.socket_path(), "bob", None).await?;

    let send = Envelope::new(Payload::Send { body: "hello".to_owned(), thread: None })
        .to("bob")
        .with_sync(SyncMeta { blocking: true, correlation_id: "hello-1".to_owned(), timeout_ms: Some(2_000) });
    alice.send(send).await?;

    let delivered = bob.recv_until(TIMEOUT, |e| matches!(e.payload, Payload::Send { .. })).await?;
    let Payload::Send { body, .. } = delivered.payload else { unreachable!() };
    assert_eq!(body, "hello");
    assert_eq!(delivered.from.as_deref(), Some("alice"));

    // bob acks the blocking send, echoing the correlation id as message_id.
    let ack = Envelope::new(Payload::Ack { message_id: "hello-1".to_owned() });
    bob.send(ack).await?;

    let reply = alice.recv_until(TIMEOUT, |e| matches!(e.payload, Payload::Ack { .. })).await?;
    assert!(matches!(reply.payload, Payload::Ack { .. }));

    let query = Envelope::new(Payload::MessagesQuery {
        from: Some("alice".to_owned()),
        to: Some("bob".to_owned()),
        thread: None,
        since_ts: None,
        limit: None,
        order: None,
        unread_only: false,
    });
    alice.send(query).await?;
    let response = alice.recv_until(TIMEOUT, |e| matches!(e.payload, Payload::MessagesResponse { .. })).await?;
    let Payload::MessagesResponse { messages } = response.payload else { unreachable!() };
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].body, "hello");
    assert!(!messages[0].is_broadcast);

    Ok(())
}

#[tokio::test]
async fn broadcast_is_deduplicated_and_skips_the_sender() -> anyhow::Result<()> {
    let relayd = RelaydProcess::start()?;
    relayd.wait_listening(TIMEOUT).await?;

    let (mut a, _) = AgentConn::connect(relayd.socket_path(), "a", None).await?;
    let (mut b, _) = AgentConn::connect(relayd.socket_path(), "b", None).await?;
    let (mut c, _) = AgentConn::connect(relayd.socket_path(), "c", None).await?;

    a.send(Envelope::new(Payload::Send { body: "ping".to_owned(), thread: None }).to("*")).await?;

    let to_b = b.recv_until(TIMEOUT, |e| matches!(e.payload, Payload::Send { .. })).await?;
    let to_c = c.recv_until(TIMEOUT, |e| matches!(e.payload, Payload::Send { .. })).await?;
    assert_eq!(to_b.to.as_deref(), Some("b"));
    assert_eq!(to_c.to.as_deref(), Some("c"));

    // a must never see its own broadcast; give the daemon a moment to not
    // deliver one before declaring the absence real.
    let none = a.recv(Duration::from_millis(300)).await;
    assert!(none.is_err(), "sender must not receive its own broadcast");

    let query = Envelope::new(Payload::MessagesQuery {
        from: None,
        to: Some("*".to_owned()),
        thread: None,
        since_ts: None,
        limit: None,
        order: None,
        unread_only: false,
    });
    a.send(query).await?;
    let response = a.recv_until(TIMEOUT, |e| matches!(e.payload, Payload::MessagesResponse { .. })).await?;
    let Payload::MessagesResponse { messages } = response.payload else { unreachable!() };
    assert_eq!(messages.len(), 1, "exactly one broadcast record, not one per recipient");
    assert!(messages[0].is_broadcast);

    Ok(())
}

#[tokio::test]
async fn resume_replays_unacked_messages_with_their_original_sequence() -> anyhow::Result<()> {
    let relayd = RelaydProcess::start()?;
    relayd.wait_listening(TIMEOUT).await?;

    let (mut sender, _) = AgentConn::connect(relayd.socket_path(), "sender", None).await?;
    let (w, welcome) = AgentConn::connect(relayd.socket_path(), "w", None).await?;
    let Payload::Welcome { resume_token, .. } = welcome.payload else { unreachable!() };
    let mut w = w;

    for i in 0..3 {
        sender.send(Envelope::new(Payload::Send { body: format!("msg-{i}"), thread: None }).to("w")).await?;
    }
    let mut first_pass = Vec::new();
    for _ in 0..3 {
        let env = w.recv_until(TIMEOUT, |e| matches!(e.payload, Payload::Send { .. })).await?;
        first_pass.push(env.seq.map(|s| s.n).expect("delivered message carries a seq"));
    }
    assert_eq!(first_pass, vec![1, 2, 3]);

    // None of these were acked; w drops its connection entirely (simulating
    // a transport failure) without a graceful close.
    drop(w);

    let (mut w2, _) = AgentConn::connect(relayd.socket_path(), "w", Some(&resume_token)).await?;
    let mut replayed = Vec::new();
    for _ in 0..3 {
        let env = w2.recv_until(TIMEOUT, |e| matches!(e.payload, Payload::Send { .. })).await?;
        replayed.push(env.seq.map(|s| s.n).expect("replayed message carries a seq"));
    }
    assert_eq!(replayed, vec![1, 2, 3], "resume must replay the original seq numbers, not mint fresh ones");

    sender.send(Envelope::new(Payload::Send { body: "after-resume".to_owned(), thread: None }).to("w")).await?;
    let fresh = w2.recv_until(TIMEOUT, |e| matches!(e.payload, Payload::Send { .. })).await?;
    assert_eq!(fresh.seq.map(|s| s.n), Some(4), "new sends continue past the replayed high-water mark");

    Ok(())
}

#[tokio::test]
async fn crash_safe_file_delivery_survives_a_daemon_restart() -> anyhow::Result<()> {
    let data_dir = tempfile::tempdir()?;
    let mut relayd = RelaydProcess::build().data_dir_path(data_dir.path().to_path_buf()).spawn()?;
    relayd.wait_listening(TIMEOUT).await?;

    let (mut recipient, _) = AgentConn::connect(relayd.socket_path(), "recipient", None).await?;

    write_outbox_message(&relayd.inbox_dir(), "courier", "msg01.txt", "recipient", "delivered via outbox")?;

    let delivered = recipient.recv_until(TIMEOUT, |e| matches!(e.payload, Payload::Send { .. })).await?;
    let Payload::Send { body, .. } = delivered.payload else { unreachable!() };
    assert_eq!(body, "delivered via outbox");

    // Simulate a crash: kill -9 the daemon, then bring a fresh process up
    // against the same on-disk state.
    relayd.kill()?;
    drop(recipient);

    let relayd = RelaydProcess::build().data_dir_path(data_dir.path().to_path_buf()).spawn()?;
    relayd.wait_listening(TIMEOUT).await?;

    let (mut recipient, _) = AgentConn::connect(relayd.socket_path(), "recipient", None).await?;
    let query = Envelope::new(Payload::MessagesQuery {
        from: Some("courier".to_owned()),
        to: Some("recipient".to_owned()),
        thread: None,
        since_ts: None,
        limit: None,
        order: None,
        unread_only: false,
    });
    recipient.send(query).await?;
    let response = recipient.recv_until(TIMEOUT, |e| matches!(e.payload, Payload::MessagesResponse { .. })).await?;
    let Payload::MessagesResponse { messages } = response.payload else { unreachable!() };
    assert_eq!(messages.len(), 1, "the outbox file must be delivered exactly once across the restart");

    Ok(())
}

#[tokio::test]
async fn force_remove_agent_purges_subscriptions_and_channel_membership() -> anyhow::Result<()> {
    let relayd = RelaydProcess::start()?;
    relayd.wait_listening(TIMEOUT).await?;

    let (mut alice, _) = AgentConn::connect(relayd.socket_path(), "alice", None).await?;
    alice.send(Envelope::new(Payload::ChannelJoin { channel: "eng".to_owned() })).await?;

    let (mut operator, _) = AgentConn::connect(relayd.socket_path(), "operator", None).await?;
    operator.send(Envelope::new(Payload::RemoveAgent { name: "alice".to_owned() })).await?;
    let response =
        operator.recv_until(TIMEOUT, |e| matches!(e.payload, Payload::RemoveAgentResponse { .. })).await?;
    let Payload::RemoveAgentResponse { removed } = response.payload else { unreachable!() };
    assert!(removed);

    operator.send(Envelope::new(Payload::ListConnectedAgents {})).await?;
    let response =
        operator.recv_until(TIMEOUT, |e| matches!(e.payload, Payload::ListConnectedAgentsResponse { .. })).await?;
    let Payload::ListConnectedAgentsResponse { agents, .. } = response.payload else { unreachable!() };
    assert!(!agents.contains(&"alice".to_owned()));

    Ok(())
}

#[tokio::test]
async fn only_one_active_connection_is_bound_to_an_agent_name() -> anyhow::Result<()> {
    let relayd = RelaydProcess::start()?;
    relayd.wait_listening(TIMEOUT).await?;

    let (mut first, _) = AgentConn::connect(relayd.socket_path(), "alice", None).await?;
    let (_second, _) = AgentConn::connect(relayd.socket_path(), "alice", None).await?;

    // The first connection is force-closed on the duplicate HELLO: its
    // stream should observe a closed connection rather than continuing to
    // behave as the registered "alice".
    let outcome = tokio::time::timeout(TIMEOUT, async {
        loop {
            if first.recv(Duration::from_millis(500)).await.is_err() {
                return;
            }
        }
    })
    .await;
    assert!(outcome.is_ok(), "the superseded connection should be closed, not left dangling");

    Ok(())
}

#[tokio::test]
async fn malformed_envelope_version_is_rejected_with_a_protocol_error() -> anyhow::Result<()> {
    let relayd = RelaydProcess::start()?;
    relayd.wait_listening(TIMEOUT).await?;

    let (mut conn, _) = AgentConn::connect(relayd.socket_path(), "alice", None).await?;
    let mut bad = Envelope::new(Payload::Send { body: "x".to_owned(), thread: None }).to("alice");
    bad.version = 99;
    conn.send(bad).await?;

    let reply = conn.recv_until(TIMEOUT, |e| matches!(e.payload, Payload::Error { .. })).await;
    match reply {
        Ok(env) => match env.payload {
            Payload::Error { code, fatal, .. } => {
                assert_eq!(code, ErrorCode::Protocol);
                assert!(fatal);
            }
            other => panic!("expected ERROR, got {other:?}"),
        },
        // An implementation that closes the transport outright on a
        // version mismatch rather than replying first is equally valid.
        Err(_) => {}
    }

    Ok(())
}
