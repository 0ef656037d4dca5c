// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn message_status_str_round_trips() {
    for status in [
        MessageStatus::Pending,
        MessageStatus::Delivered,
        MessageStatus::Acked,
        MessageStatus::Read,
        MessageStatus::Failed,
    ] {
        assert_eq!(MessageStatus::from_str(status.as_str()), Some(status));
    }
    assert_eq!(MessageStatus::from_str("bogus"), None);
}
