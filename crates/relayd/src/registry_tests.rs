// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn entry(name: &str) -> AgentRegistryEntry {
    AgentRegistryEntry {
        name: name.to_owned(),
        cli: Some("claude".to_owned()),
        program: None,
        model: None,
        task: None,
        cwd: None,
        team: None,
        last_seen_ms: 1,
        resume_token: "tok".to_owned(),
    }
}

#[test]
fn upsert_and_reload_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agents.json");

    let reg = AgentRegistry::load(path.clone());
    reg.upsert(entry("alice"));
    reg.upsert(entry("bob"));

    let reloaded = AgentRegistry::load(path);
    let names: Vec<_> = reloaded.list().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["alice".to_owned(), "bob".to_owned()]);
}

#[test]
fn remove_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agents.json");
    let reg = AgentRegistry::load(path.clone());
    reg.upsert(entry("alice"));
    assert!(reg.remove("alice"));
    assert!(!reg.remove("alice"));

    let reloaded = AgentRegistry::load(path);
    assert!(reloaded.list().is_empty());
}

#[test]
fn touch_updates_last_seen() {
    let dir = tempfile::tempdir().unwrap();
    let reg = AgentRegistry::load(dir.path().join("agents.json"));
    reg.upsert(entry("alice"));
    reg.touch("alice", 999);
    assert_eq!(reg.get("alice").unwrap().last_seen_ms, 999);
}
