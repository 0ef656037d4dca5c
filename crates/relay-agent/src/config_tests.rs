// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn base_config() -> Config {
    Config {
        program: vec!["claude".into()],
        agent_name: Some("bob".into()),
        cli: None,
        daemon_socket: None,
        workspace_id: None,
        control_socket: None,
        model: None,
        task: None,
        cwd: None,
        team: None,
        cpu_limit_percent: None,
        silence_ms: 1_500,
        heartbeat_ms: 10_000,
        frame_cap: relay_proto::DEFAULT_FRAME_CAP,
        queue_high_water: 50,
        queue_low_water: 10,
        log_format: "json".into(),
        log_level: "info".into(),
    }
}

#[test]
fn validates_empty_program() {
    let mut cfg = base_config();
    cfg.program.clear();
    assert!(cfg.validate().is_err());
}

#[test]
fn validates_missing_agent_name() {
    let mut cfg = base_config();
    cfg.agent_name = None;
    assert!(cfg.validate().is_err());
}

#[test]
fn rejects_reserved_agent_name() {
    let mut cfg = base_config();
    cfg.agent_name = Some("System".into());
    assert!(cfg.validate().is_err());
}

#[test]
fn rejects_inverted_watermarks() {
    let mut cfg = base_config();
    cfg.queue_low_water = 50;
    cfg.queue_high_water = 10;
    assert!(cfg.validate().is_err());
}

#[test]
fn cli_name_defaults_to_program_head() {
    let cfg = base_config();
    assert_eq!(cfg.cli_name(), "claude");
}

#[test]
fn daemon_socket_is_workspace_namespaced() {
    let mut cfg = base_config();
    cfg.workspace_id = Some("ws1".into());
    assert_eq!(cfg.daemon_socket_path(), std::path::PathBuf::from("/tmp/relay/ws1/relay.sock"));
}

#[test]
fn daemon_socket_defaults_project_local() {
    let cfg = base_config();
    assert_eq!(cfg.daemon_socket_path(), std::path::PathBuf::from(".relay/relay.sock"));
}

#[test]
fn control_socket_matches_shared_derivation() {
    let cfg = base_config();
    assert_eq!(cfg.control_socket_path(), relay_proto::control_socket_path(None, "bob"));
}

#[test]
fn explicit_control_socket_overrides_derivation() {
    let mut cfg = base_config();
    cfg.control_socket = Some("/tmp/custom.sock".into());
    assert_eq!(cfg.control_socket_path(), std::path::PathBuf::from("/tmp/custom.sock"));
}
