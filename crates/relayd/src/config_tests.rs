// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use clap::Parser;

fn parse(args: &[&str]) -> Config {
    let mut full = vec!["relayd"];
    full.extend_from_slice(args);
    Config::parse_from(full)
}

#[test]
fn default_validates() {
    let cfg = parse(&[]);
    assert!(cfg.validate().is_ok());
}

#[test]
fn zero_frame_cap_rejected() {
    let cfg = parse(&["--frame-cap", "0"]);
    assert!(cfg.validate().is_err());
}

#[test]
fn workspace_id_namespaces_paths() {
    let cfg = parse(&["--workspace-id", "ws1"]);
    assert_eq!(cfg.root_dir(), PathBuf::from("/tmp/relay/ws1"));
    assert_eq!(cfg.socket_path(), PathBuf::from("/tmp/relay/ws1/relay.sock"));
    assert_eq!(cfg.ledger_db_path(), PathBuf::from("/tmp/relay/ws1/ledger.sqlite3"));
}

#[test]
fn explicit_data_dir_wins_over_workspace_id() {
    let cfg = parse(&["--workspace-id", "ws1", "--data-dir", "/var/relay"]);
    assert_eq!(cfg.root_dir(), PathBuf::from("/var/relay"));
}

#[test]
fn explicit_socket_overrides_derived_path() {
    let cfg = parse(&["--socket", "/tmp/custom.sock"]);
    assert_eq!(cfg.socket_path(), PathBuf::from("/tmp/custom.sock"));
}

#[test]
fn archive_dir_sits_alongside_inbox_under_root() {
    let cfg = parse(&["--workspace-id", "ws1"]);
    assert_eq!(cfg.archive_dir(), PathBuf::from("/tmp/relay/ws1/archive"));
    assert_eq!(cfg.inbox_dir(), PathBuf::from("/tmp/relay/ws1/inbox"));
}
