// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn short_path_is_not_hashed() {
    let path = control_socket_path(None, "bob");
    assert_eq!(path, PathBuf::from(".relay/agents/bob.sock"));
}

#[test]
fn long_path_is_hashed_and_fits_sun_path_max() {
    let name = "x".repeat(200);
    let path = control_socket_path(Some("some-long-workspace-identifier"), &name);
    assert!(path.to_string_lossy().len() <= SUN_PATH_MAX);
    assert!(path.to_string_lossy().contains("relay-agent-"));
}

#[test]
fn hashing_is_deterministic() {
    let name = "y".repeat(200);
    let a = control_socket_path(Some("ws"), &name);
    let b = control_socket_path(Some("ws"), &name);
    assert_eq!(a, b);
}

#[test]
fn inject_request_round_trips() {
    let req = ControlRequest::Inject {
        id: "abc".into(),
        from: "alice".into(),
        body: "hello".into(),
        priority: Priority::High,
    };
    let json = serde_json::to_string(&req).unwrap();
    assert!(json.contains("\"type\":\"inject\""));
    assert!(json.contains("\"priority\":\"high\""));
    let back: ControlRequest = serde_json::from_str(&json).unwrap();
    match back {
        ControlRequest::Inject { id, from, body, priority } => {
            assert_eq!(id, "abc");
            assert_eq!(from, "alice");
            assert_eq!(body, "hello");
            assert_eq!(priority, Priority::High);
        }
        _ => panic!("wrong variant"),
    }
}

#[test]
fn default_priority_is_normal() {
    let json = r#"{"type":"inject","id":"x","from":"a","body":"b"}"#;
    let req: ControlRequest = serde_json::from_str(json).unwrap();
    match req {
        ControlRequest::Inject { priority, .. } => assert_eq!(priority, Priority::Normal),
        _ => panic!("wrong variant"),
    }
}

#[test]
fn status_response_serializes_with_enrichment_fields() {
    let resp = ControlResponse::Status {
        agent_idle: true,
        queue_length: 0,
        cursor_position: None,
        last_output_ms: 42,
        rss_bytes: 1024,
        cpu_percent: 3.5,
    };
    let json = serde_json::to_string(&resp).unwrap();
    assert!(json.contains("\"rss_bytes\":1024"));
    assert!(!json.contains("cursor_position"));
}
