// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The universal frame and its typed payload
//! variants. One JSON object per line on the wire; see `relayd::codec`
//! for the framing itself.

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

/// One envelope, as it appears on the wire: shared routing fields plus a
/// payload whose shape is uniquely determined by `type` (flattened so the
/// wire form has a single top-level `type` discriminant rather than a
/// nested `payload` object).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub id: String,
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_meta: Option<SyncMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<StreamSeq>,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Envelope {
    /// Construct a new envelope with a fresh id and the current timestamp.
    pub fn new(payload: Payload) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION,
            id: crate::new_id(),
            ts: crate::now_ms(),
            from: None,
            to: None,
            topic: None,
            payload_meta: None,
            seq: None,
            payload,
        }
    }

    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_seq(mut self, seq: StreamSeq) -> Self {
        self.seq = Some(seq);
        self
    }

    pub fn with_sync(mut self, sync: SyncMeta) -> Self {
        self.payload_meta = Some(sync);
        self
    }

    /// `type` name as it appears on the wire, for logging.
    pub fn type_name(&self) -> &'static str {
        self.payload.type_name()
    }

    /// Build an ERROR envelope addressed back to `to`.
    pub fn error(to: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        let fatal = code.fatal();
        Envelope::new(Payload::Error { code, message: message.into(), fatal }).to(to)
    }
}

/// Per-stream sequence attached by the router: identifies the `(topic, peer)` stream and its position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct StreamSeq {
    pub n: u64,
}

/// `payload_meta.sync`, present on a blocking SEND.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMeta {
    #[serde(default)]
    pub blocking: bool,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Connection entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Agent,
    User,
}

/// Direction a channel/shadow subscriber receives traffic in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Wire rendering of a persisted message record, used by INBOX_RESPONSE / MESSAGES_RESPONSE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecordWire {
    pub id: String,
    pub from: String,
    pub to: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    pub ts: i64,
    pub status: MessageStatusWire,
    pub is_broadcast: bool,
    pub reply_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatusWire {
    Pending,
    Delivered,
    Acked,
    Read,
    Failed,
}

/// A seeded per-stream high-water mark handed back in WELCOME on resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedSequence {
    pub topic: String,
    pub peer: String,
    pub max_seq: u64,
}

/// Agent registry entry, wire form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistryEntryWire {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    pub last_seen_ms: i64,
}

/// The full type+payload union. `#[serde(tag = "type")]` makes `type` the
/// single wire discriminant; an unrecognized `type` lands in `Unknown` rather
/// than failing to deserialize, so dispatch can reject it as a protocol
/// error instead of the frame reader silently dropping it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Payload {
    Hello {
        agent_name: String,
        cli: String,
        entity_type: EntityType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        program: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        team: Option<String>,
    },
    Welcome {
        session_id: String,
        resume_token: String,
        #[serde(default)]
        seed_sequences: Vec<SeedSequence>,
    },
    Ping {},
    Pong {},
    Send {
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread: Option<String>,
    },
    Ack {
        message_id: String,
    },
    Error {
        code: ErrorCode,
        message: String,
        fatal: bool,
    },
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    ChannelJoin {
        channel: String,
    },
    ChannelLeave {
        channel: String,
    },
    ChannelMessage {
        channel: String,
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread: Option<String>,
    },
    ShadowBind {
        primary: String,
        #[serde(default)]
        speak_on: Vec<String>,
        #[serde(default)]
        receive_incoming: bool,
        #[serde(default)]
        receive_outgoing: bool,
    },
    ShadowUnbind {},
    Log {
        level: String,
        message: String,
    },
    Spawn {
        name: String,
        cli: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        program: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        team: Option<String>,
    },
    Release {
        name: String,
    },
    Status {},
    StatusResponse {
        agents: u32,
        connections: u32,
        pending_acks: u32,
        uptime_secs: u64,
    },
    Inbox {
        #[serde(default)]
        unread_only: bool,
    },
    InboxResponse {
        messages: Vec<MessageRecordWire>,
    },
    MessagesQuery {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since_ts: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        order: Option<String>,
        #[serde(default)]
        unread_only: bool,
    },
    MessagesResponse {
        messages: Vec<MessageRecordWire>,
    },
    ListAgents {},
    ListAgentsResponse {
        agents: Vec<AgentRegistryEntryWire>,
    },
    ListConnectedAgents {},
    ListConnectedAgentsResponse {
        agents: Vec<String>,
        users: Vec<String>,
    },
    RemoveAgent {
        name: String,
    },
    RemoveAgentResponse {
        removed: bool,
    },
    Health {},
    HealthResponse {
        storage_ok: bool,
        driver: String,
        uptime_secs: u64,
    },
    Metrics {},
    MetricsResponse {
        connections: u32,
        agents: u32,
        pending_acks: u32,
        channels: u32,
        topics: u32,
    },
    AgentReady {},
    /// Catch-all for any `type` this build does not recognize. Always a
    /// PROTOCOL error at dispatch time, never silently
    /// accepted or forwarded.
    #[serde(other)]
    Unknown,
}

impl Payload {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "HELLO",
            Self::Welcome { .. } => "WELCOME",
            Self::Ping {} => "PING",
            Self::Pong {} => "PONG",
            Self::Send { .. } => "SEND",
            Self::Ack { .. } => "ACK",
            Self::Error { .. } => "ERROR",
            Self::Subscribe { .. } => "SUBSCRIBE",
            Self::Unsubscribe { .. } => "UNSUBSCRIBE",
            Self::ChannelJoin { .. } => "CHANNEL_JOIN",
            Self::ChannelLeave { .. } => "CHANNEL_LEAVE",
            Self::ChannelMessage { .. } => "CHANNEL_MESSAGE",
            Self::ShadowBind { .. } => "SHADOW_BIND",
            Self::ShadowUnbind {} => "SHADOW_UNBIND",
            Self::Log { .. } => "LOG",
            Self::Spawn { .. } => "SPAWN",
            Self::Release { .. } => "RELEASE",
            Self::Status {} => "STATUS",
            Self::StatusResponse { .. } => "STATUS_RESPONSE",
            Self::Inbox { .. } => "INBOX",
            Self::InboxResponse { .. } => "INBOX_RESPONSE",
            Self::MessagesQuery { .. } => "MESSAGES_QUERY",
            Self::MessagesResponse { .. } => "MESSAGES_RESPONSE",
            Self::ListAgents {} => "LIST_AGENTS",
            Self::ListAgentsResponse { .. } => "LIST_AGENTS_RESPONSE",
            Self::ListConnectedAgents {} => "LIST_CONNECTED_AGENTS",
            Self::ListConnectedAgentsResponse { .. } => "LIST_CONNECTED_AGENTS_RESPONSE",
            Self::RemoveAgent { .. } => "REMOVE_AGENT",
            Self::RemoveAgentResponse { .. } => "REMOVE_AGENT_RESPONSE",
            Self::Health {} => "HEALTH",
            Self::HealthResponse { .. } => "HEALTH_RESPONSE",
            Self::Metrics {} => "METRICS",
            Self::MetricsResponse { .. } => "METRICS_RESPONSE",
            Self::AgentReady {} => "AGENT_READY",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }
}

#[cfg(test)]
#[path = "envelope_tests.rs"]
mod tests;
