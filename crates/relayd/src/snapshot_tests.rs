// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use super::*;
use crate::storage::SqliteStorageAdapter;

#[test]
fn write_once_produces_both_snapshot_files() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(SqliteStorageAdapter::open_in_memory().unwrap());
    let router = Router::new(storage, 30_000);
    let writer = SnapshotWriter::new(dir.path().to_path_buf(), router, Duration::from_millis(10));

    writer.write_once();

    assert!(dir.path().join("connected-agents.json").exists());
    assert!(dir.path().join("processing-state.json").exists());
}

#[test]
fn shutting_down_suppresses_writes() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(SqliteStorageAdapter::open_in_memory().unwrap());
    let router = Router::new(storage, 30_000);
    let writer = SnapshotWriter::new(dir.path().to_path_buf(), router, Duration::from_millis(10));
    writer.shutting_down.store(true, Ordering::Relaxed);

    writer.write_once();

    assert!(!dir.path().join("connected-agents.json").exists());
}
