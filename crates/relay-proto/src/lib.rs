// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire types shared by every binary in the relay: the framed envelope,
//! its payload variants, and the error taxonomy that travels inside it.

pub mod codec;
pub mod control;
pub mod envelope;
pub mod error;

pub use codec::{read_json_frame, write_json_frame, FrameReader, FrameWriter};
pub use control::{control_socket_path, ControlRequest, ControlResponse, InjectStatus, Priority};
pub use envelope::{
    AgentRegistryEntryWire, Direction, Envelope, EntityType, MessageRecordWire, MessageStatusWire,
    Payload, SeedSequence, StreamSeq, SyncMeta,
};
pub use error::ErrorCode;

/// Current wire protocol version. A mismatch is always fatal.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default per-frame size cap in bytes (1 MiB), overridable per listener.
pub const DEFAULT_FRAME_CAP: usize = 1024 * 1024;

/// Reserved routing targets that never resolve to a real agent connection.
pub const RESERVED_TARGETS: &[&str] = &["_router", "_consensus"];

/// Agent names rejected at file-ledger registration time.
pub const RESERVED_AGENT_NAMES: &[&str] = &["Lead", "System", "Broadcast", "*"];

/// Generate a new random envelope id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current time as a monotonic-enough millisecond timestamp for envelope `ts`.
/// Callers on the hot path should prefer a value derived from a single clock
/// read per envelope so that `ts` is non-decreasing per sender.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
