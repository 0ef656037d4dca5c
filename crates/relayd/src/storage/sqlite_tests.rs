// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn record(id: &str, from: &str, to: &str) -> MessageRecord {
    MessageRecord {
        id: id.to_owned(),
        from: from.to_owned(),
        to: to.to_owned(),
        body: "hello".to_owned(),
        thread: None,
        ts: 1000,
        status: MessageStatus::Pending,
        is_broadcast: false,
        reply_count: 0,
        channel: None,
        seq: None,
    }
}

#[tokio::test]
async fn append_and_query_round_trips() {
    let store = SqliteStorageAdapter::open_in_memory().unwrap();
    store.append_message(&record("m1", "alice", "bob")).await.unwrap();

    let results = store
        .query_messages(&MessageFilter { to: Some("bob".into()), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, "m1");
    assert_eq!(results[0].status, MessageStatus::Pending);
}

#[tokio::test]
async fn duplicate_message_id_is_ignored() {
    let store = SqliteStorageAdapter::open_in_memory().unwrap();
    store.append_message(&record("dup", "alice", "bob")).await.unwrap();
    store.append_message(&record("dup", "alice", "bob")).await.unwrap();

    let results = store
        .query_messages(&MessageFilter { to: Some("bob".into()), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
}

#[tokio::test]
async fn mark_status_updates_row() {
    let store = SqliteStorageAdapter::open_in_memory().unwrap();
    store.append_message(&record("m1", "alice", "bob")).await.unwrap();
    store.mark_status("m1", MessageStatus::Acked).await.unwrap();

    let results = store
        .query_messages(&MessageFilter { to: Some("bob".into()), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(results[0].status, MessageStatus::Acked);
}

#[tokio::test]
async fn session_lookup_by_resume_token() {
    let store = SqliteStorageAdapter::open_in_memory().unwrap();
    store.start_session("alice", "sess-1", "tok-1").await.unwrap();

    let found = store.lookup_session_by_resume_token("alice", "tok-1").await.unwrap();
    assert!(found.is_some());
    assert_eq!(found.unwrap().session_id, "sess-1");

    let missing = store.lookup_session_by_resume_token("alice", "tok-does-not-exist").await.unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn record_seq_tracks_high_water_mark_per_stream() {
    let store = SqliteStorageAdapter::open_in_memory().unwrap();
    store.record_seq("alice", "", "bob", 1).await.unwrap();
    store.record_seq("alice", "", "bob", 2).await.unwrap();
    store.record_seq("alice", "", "bob", 5).await.unwrap();
    // A stale write below the current high-water mark never moves it back.
    store.record_seq("alice", "", "bob", 3).await.unwrap();

    assert_eq!(store.max_seq("alice", "", "bob").await.unwrap(), 5);
    assert_eq!(store.max_seq("alice", "", "carol").await.unwrap(), 0);
}

#[tokio::test]
async fn resume_seeds_sequences_recorded_under_the_reconnecting_agent() {
    let store = SqliteStorageAdapter::open_in_memory().unwrap();
    store.start_session("alice", "sess-1", "tok-1").await.unwrap();
    store.record_seq("alice", "", "bob", 7).await.unwrap();
    store.record_seq("alice", "#team", "carol", 2).await.unwrap();
    // A stream owned by a different agent must never leak into alice's seeds.
    store.record_seq("bob", "", "alice", 9).await.unwrap();

    let resumed = store.lookup_session_by_resume_token("alice", "tok-1").await.unwrap().unwrap();
    let mut seeds = resumed.seed_sequences;
    seeds.sort();
    assert_eq!(
        seeds,
        vec![("".to_owned(), "bob".to_owned(), 7), ("#team".to_owned(), "carol".to_owned(), 2)]
    );
}

#[tokio::test]
async fn remove_agent_purges_sessions_and_channel_membership() {
    let store = SqliteStorageAdapter::open_in_memory().unwrap();
    store.start_session("alice", "sess-1", "tok-1").await.unwrap();
    store.set_channel_members("#team", &["alice".to_owned(), "bob".to_owned()]).await.unwrap();

    store.remove_agent("alice").await.unwrap();

    assert!(store.lookup_session_by_resume_token("alice", "tok-1").await.unwrap().is_none());
    let members = store.get_channel_members("#team").await.unwrap();
    assert_eq!(members, vec!["bob".to_owned()]);
}

#[tokio::test]
async fn remove_messages_for_agent_clears_both_directions() {
    let store = SqliteStorageAdapter::open_in_memory().unwrap();
    store.append_message(&record("m1", "alice", "bob")).await.unwrap();
    store.append_message(&record("m2", "bob", "alice")).await.unwrap();
    store.append_message(&record("m3", "carol", "dave")).await.unwrap();

    store.remove_messages_for_agent("alice").await.unwrap();

    let remaining = store.query_messages(&MessageFilter::default()).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, "m3");
}

#[tokio::test]
async fn health_reports_ok_for_a_live_connection() {
    let store = SqliteStorageAdapter::open_in_memory().unwrap();
    let health = store.health().await;
    assert!(health.ok);
    assert_eq!(health.driver, "sqlite");
}

#[tokio::test]
async fn reopening_the_same_file_does_not_fail_migrations() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.sqlite3");

    {
        let store = SqliteStorageAdapter::open(&path).unwrap();
        store.append_message(&record("m1", "alice", "bob")).await.unwrap();
    }

    let store = SqliteStorageAdapter::open(&path).unwrap();
    let results = store.query_messages(&MessageFilter::default()).await.unwrap();
    assert_eq!(results.len(), 1);
}
