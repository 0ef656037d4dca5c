// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn connect_always_fails_with_a_diagnostic() {
    let err = RemoteStorageAdapter::connect("postgres://example/relay").unwrap_err();
    assert!(err.to_string().contains("not implemented"));
}

#[tokio::test]
async fn health_reports_not_ok() {
    // Can't construct via connect() since it always errors; build directly
    // to exercise the trait method's honesty about its own unavailability.
    let adapter = RemoteStorageAdapter { url: "postgres://example/relay".to_owned() };
    let health = adapter.health().await;
    assert!(!health.ok);
    assert_eq!(health.driver, "remote");
}
