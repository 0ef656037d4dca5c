// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory agent→connection map, topic/channel subscriptions, shadow
//! fan-out, and blocking-ACK bookkeeping.
//!
//! Internal maps are guarded by short-held `parking_lot` mutexes —
//! a good fit for this kind of hot, non-blocking critical section.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use relay_proto::{Envelope, EntityType, ErrorCode, Payload, StreamSeq};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::ConnectionState;
use crate::storage::{MessageRecord, MessageStatus, StorageAdapter};

pub type ConnId = Uuid;

/// Live state for one connection, owned by the Router's maps and cloned
/// (as an `Arc`) into the connection task that reads/writes its socket.
pub struct ConnHandle {
    pub id: ConnId,
    pub agent_name: String,
    pub entity_type: EntityType,
    pub session_id: String,
    pub resume_token: String,
    pub outbound: mpsc::Sender<Envelope>,
    pub processing: AtomicBool,
    pub state: Mutex<ConnectionState>,
}

impl ConnHandle {
    pub fn new(
        agent_name: String,
        entity_type: EntityType,
        session_id: String,
        resume_token: String,
        outbound: mpsc::Sender<Envelope>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            agent_name,
            entity_type,
            session_id,
            resume_token,
            outbound,
            processing: AtomicBool::new(false),
            state: Mutex::new(ConnectionState::Connecting),
        })
    }

    /// Best-effort enqueue; a full or closed outbound channel is dropped
    /// rather than blocking the router's critical section.
    pub fn deliver(&self, env: Envelope) {
        if self.outbound.try_send(env).is_err() {
            warn!(conn = %self.id, agent = %self.agent_name, "outbound queue full or closed, dropping delivery");
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShadowBinding {
    pub primary: String,
    pub speak_on: HashSet<String>,
    pub receive_incoming: bool,
    pub receive_outgoing: bool,
}

struct PendingAck {
    requester: Arc<ConnHandle>,
    created_at: Instant,
}

/// In-memory router. One instance per daemon.
pub struct Router {
    storage: Arc<dyn StorageAdapter>,
    by_name: Mutex<HashMap<String, Arc<ConnHandle>>>,
    by_id: Mutex<HashMap<ConnId, Arc<ConnHandle>>>,
    topic_subs: Mutex<HashMap<String, HashSet<String>>>,
    agent_topics: Mutex<HashMap<String, HashSet<String>>>,
    channel_members: Mutex<HashMap<String, HashSet<String>>>,
    agent_channels: Mutex<HashMap<String, HashSet<String>>>,
    shadow_by_shadow: Mutex<HashMap<String, ShadowBinding>>,
    shadows_of_primary: Mutex<HashMap<String, HashSet<String>>>,
    pending_acks: Arc<Mutex<HashMap<String, PendingAck>>>,
    seq_counters: Mutex<HashMap<(String, String, String), u64>>,
    spawning: Mutex<HashSet<String>>,
    default_sync_timeout_ms: u64,
}

/// Outcome of routing a `SEND`/`CHANNEL_MESSAGE` envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    StorageFailed,
}

impl Router {
    pub fn new(storage: Arc<dyn StorageAdapter>, default_sync_timeout_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            storage,
            by_name: Mutex::new(HashMap::new()),
            by_id: Mutex::new(HashMap::new()),
            topic_subs: Mutex::new(HashMap::new()),
            agent_topics: Mutex::new(HashMap::new()),
            channel_members: Mutex::new(HashMap::new()),
            agent_channels: Mutex::new(HashMap::new()),
            shadow_by_shadow: Mutex::new(HashMap::new()),
            shadows_of_primary: Mutex::new(HashMap::new()),
            pending_acks: Arc::new(Mutex::new(HashMap::new())),
            seq_counters: Mutex::new(HashMap::new()),
            spawning: Mutex::new(HashSet::new()),
            default_sync_timeout_ms,
        })
    }

    /// `register(conn)` — binds `conn.agentName` to `conn`; if another
    /// connection owns the name, force-close it first and cancel its
    /// pending ACKs.
    pub fn register(&self, conn: Arc<ConnHandle>) {
        let previous = {
            let mut by_name = self.by_name.lock();
            let previous = by_name.insert(conn.agent_name.clone(), conn.clone());
            previous
        };
        self.by_id.lock().insert(conn.id, conn.clone());

        if let Some(prev) = previous {
            if prev.id != conn.id {
                debug!(agent = %conn.agent_name, old = %prev.id, new = %conn.id, "duplicate HELLO, replacing connection");
                *prev.state.lock() = ConnectionState::Closed;
                self.cancel_pending_acks_for(&prev.id);
                self.by_id.lock().remove(&prev.id);
            }
        }
    }

    /// `unregister(conn)` — removes the binding only if `conn` is still
    /// the active owner of its name; subscriptions are left intact so a
    /// reconnect resumes cleanly.
    pub fn unregister(&self, conn: &Arc<ConnHandle>) {
        let mut by_name = self.by_name.lock();
        if let Some(current) = by_name.get(&conn.agent_name) {
            if Arc::ptr_eq(current, conn) {
                by_name.remove(&conn.agent_name);
            }
        }
        drop(by_name);
        self.by_id.lock().remove(&conn.id);
        self.cancel_pending_acks_for(&conn.id);
    }

    /// `forceRemoveAgent(name)` — purges binding, subscriptions, channel
    /// memberships, and shadow links. Returns whether anything existed.
    pub fn force_remove_agent(&self, name: &str) -> bool {
        let mut existed = false;

        if let Some(conn) = self.by_name.lock().remove(name) {
            existed = true;
            *conn.state.lock() = ConnectionState::Closed;
            self.by_id.lock().remove(&conn.id);
            self.cancel_pending_acks_for(&conn.id);
        }

        if let Some(topics) = self.agent_topics.lock().remove(name) {
            existed = true;
            let mut subs = self.topic_subs.lock();
            for topic in topics {
                if let Some(members) = subs.get_mut(&topic) {
                    members.remove(name);
                    if members.is_empty() {
                        subs.remove(&topic);
                    }
                }
            }
        }

        if let Some(channels) = self.agent_channels.lock().remove(name) {
            existed = true;
            let mut members_map = self.channel_members.lock();
            for channel in channels {
                if let Some(members) = members_map.get_mut(&channel) {
                    members.remove(name);
                    if members.is_empty() {
                        members_map.remove(&channel);
                    }
                }
            }
        }

        if self.shadow_by_shadow.lock().remove(name).is_some() {
            existed = true;
        }
        for shadows in self.shadows_of_primary.lock().values_mut() {
            shadows.remove(name);
        }
        if let Some(shadows) = self.shadows_of_primary.lock().remove(name) {
            existed = existed || !shadows.is_empty();
            for shadow in shadows {
                self.shadow_by_shadow.lock().remove(&shadow);
            }
        }

        self.spawning.lock().remove(name);
        existed
    }

    /// Debug-only invariant check used by property tests:
    /// after `forceRemoveAgent`, `name` must have no residue anywhere.
    #[cfg(any(test, debug_assertions))]
    pub fn assert_no_residue(&self, name: &str) {
        assert!(!self.by_name.lock().contains_key(name));
        assert!(!self.agent_topics.lock().contains_key(name));
        assert!(!self.agent_channels.lock().contains_key(name));
        assert!(!self.shadow_by_shadow.lock().contains_key(name));
        for members in self.topic_subs.lock().values() {
            assert!(!members.contains(name));
        }
        for members in self.channel_members.lock().values() {
            assert!(!members.contains(name));
        }
        for shadows in self.shadows_of_primary.lock().values() {
            assert!(!shadows.contains(name));
        }
        for ack in self.pending_acks.lock().values() {
            assert_ne!(ack.requester.agent_name, name);
        }
    }

    pub fn connection_by_name(&self, name: &str) -> Option<Arc<ConnHandle>> {
        self.by_name.lock().get(name).cloned()
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.by_name.lock().contains_key(name)
    }

    pub fn connected_agents(&self) -> (Vec<String>, Vec<String>) {
        let by_name = self.by_name.lock();
        let mut agents = Vec::new();
        let mut users = Vec::new();
        for (name, conn) in by_name.iter() {
            match conn.entity_type {
                EntityType::Agent => agents.push(name.clone()),
                EntityType::User => users.push(name.clone()),
            }
        }
        agents.sort();
        users.sort();
        (agents, users)
    }

    pub fn connection_count(&self) -> usize {
        self.by_id.lock().len()
    }

    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.lock().len()
    }

    pub fn topic_count(&self) -> usize {
        self.topic_subs.lock().len()
    }

    pub fn channel_count(&self) -> usize {
        self.channel_members.lock().len()
    }

    // -- subscriptions -------------------------------------------------

    pub fn subscribe(&self, agent: &str, topic: &str) {
        self.topic_subs.lock().entry(topic.to_owned()).or_default().insert(agent.to_owned());
        self.agent_topics.lock().entry(agent.to_owned()).or_default().insert(topic.to_owned());
    }

    pub fn unsubscribe(&self, agent: &str, topic: &str) {
        if let Some(members) = self.topic_subs.lock().get_mut(topic) {
            members.remove(agent);
        }
        if let Some(topics) = self.agent_topics.lock().get_mut(agent) {
            topics.remove(topic);
        }
    }

    pub fn topic_subscribers(&self, topic: &str) -> Vec<String> {
        self.topic_subs.lock().get(topic).map(|s| s.iter().cloned().collect()).unwrap_or_default()
    }

    // -- channels --------------------------------------------------------

    pub fn channel_join(&self, agent: &str, channel: &str) {
        self.channel_members.lock().entry(channel.to_owned()).or_default().insert(agent.to_owned());
        self.agent_channels.lock().entry(agent.to_owned()).or_default().insert(channel.to_owned());
    }

    pub fn channel_leave(&self, agent: &str, channel: &str) {
        if let Some(members) = self.channel_members.lock().get_mut(channel) {
            members.remove(agent);
        }
        if let Some(channels) = self.agent_channels.lock().get_mut(agent) {
            channels.remove(channel);
        }
    }

    pub fn channel_members(&self, channel: &str) -> Vec<String> {
        self.channel_members.lock().get(channel).map(|s| s.iter().cloned().collect()).unwrap_or_default()
    }

    // -- shadows -----------------------------------------------------------

    pub fn bind_shadow(
        &self,
        shadow: &str,
        primary: &str,
        speak_on: HashSet<String>,
        receive_incoming: bool,
        receive_outgoing: bool,
    ) {
        self.unbind_shadow(shadow);
        self.shadow_by_shadow.lock().insert(
            shadow.to_owned(),
            ShadowBinding { primary: primary.to_owned(), speak_on, receive_incoming, receive_outgoing },
        );
        self.shadows_of_primary.lock().entry(primary.to_owned()).or_default().insert(shadow.to_owned());
    }

    pub fn unbind_shadow(&self, shadow: &str) {
        if let Some(binding) = self.shadow_by_shadow.lock().remove(shadow) {
            if let Some(shadows) = self.shadows_of_primary.lock().get_mut(&binding.primary) {
                shadows.remove(shadow);
            }
        }
    }

    fn shadows_for(&self, primary: &str, incoming: bool) -> Vec<String> {
        let shadow_names = self.shadows_of_primary.lock().get(primary).cloned().unwrap_or_default();
        let by_shadow = self.shadow_by_shadow.lock();
        shadow_names
            .into_iter()
            .filter(|s| {
                by_shadow
                    .get(s)
                    .map(|b| if incoming { b.receive_incoming } else { b.receive_outgoing })
                    .unwrap_or(false)
            })
            .collect()
    }

    // -- spawning guard ------------------------------------------------

    pub fn mark_spawning(&self, name: &str) {
        self.spawning.lock().insert(name.to_owned());
    }

    pub fn clear_spawning(&self, name: &str) {
        self.spawning.lock().remove(name);
    }

    pub fn is_spawning(&self, name: &str) -> bool {
        self.spawning.lock().contains(name)
    }

    /// Push a `LOG` envelope from `_router` to every connected agent and
    /// user, used by the supervising orchestrator to announce crashes.
    pub async fn broadcast_system(&self, message: String) {
        let targets: Vec<Arc<ConnHandle>> = self.by_name.lock().values().cloned().collect();
        for conn in targets {
            conn.deliver(
                Envelope::new(Payload::Log { level: "warn".to_owned(), message: message.clone() })
                    .from("_router")
                    .to(conn.agent_name.clone()),
            );
        }
    }

    /// Like [`Router::broadcast_system`] but restricted to human
    /// connections, used for resource alerts that agents don't need to
    /// act on.
    pub async fn notify_users(&self, message: String) {
        let targets: Vec<Arc<ConnHandle>> = self
            .by_name
            .lock()
            .values()
            .filter(|c| c.entity_type == EntityType::User)
            .cloned()
            .collect();
        for conn in targets {
            conn.deliver(
                Envelope::new(Payload::Log { level: "info".to_owned(), message: message.clone() })
                    .from("_router")
                    .to(conn.agent_name.clone()),
            );
        }
    }

    pub fn processing_agents(&self) -> Vec<String> {
        self.by_name
            .lock()
            .values()
            .filter(|c| c.processing.load(Ordering::Relaxed))
            .map(|c| c.agent_name.clone())
            .collect()
    }

    // -- sequencing ------------------------------------------------------

    fn next_seq(&self, from: &str, to: &str, topic: &str) -> u64 {
        let mut counters = self.seq_counters.lock();
        let key = (from.to_owned(), to.to_owned(), topic.to_owned());
        let entry = counters.entry(key).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Seed a stream's sequence counter to at least `max_seq`, used when a
    /// resumed session's storage-backed high-water mark is higher than
    /// anything this router instance has assigned (e.g. after a restart).
    pub fn seed_seq(&self, from: &str, to: &str, topic: &str, max_seq: u64) {
        let mut counters = self.seq_counters.lock();
        let entry = counters.entry((from.to_owned(), to.to_owned(), topic.to_owned())).or_insert(0);
        if *entry < max_seq {
            *entry = max_seq;
        }
    }

    // -- routing -----------------------------------------------------------

    /// Resolve `to` to zero or more recipient agent names, following
    /// the documented resolution order. Channels and `*` broadcast return
    /// every currently-connected member; an unresolvable single name
    /// yields an empty list (caller decides whether that's a NOT_FOUND).
    pub fn resolve_recipients(&self, from: &str, to: &str) -> Vec<String> {
        if relay_proto::RESERVED_TARGETS.contains(&to) {
            return vec![];
        }
        if to == "*" {
            return self
                .by_name
                .lock()
                .values()
                .filter(|c| c.entity_type == EntityType::Agent && c.agent_name != from)
                .map(|c| c.agent_name.clone())
                .collect();
        }
        if let Some(channel) = to.strip_prefix('#') {
            return self.channel_members(channel);
        }
        if self.is_connected(to) {
            return vec![to.to_owned()];
        }
        let topic_members = self.topic_subscribers(to);
        if !topic_members.is_empty() {
            return topic_members;
        }
        vec![]
    }

    /// `route(from, envelope)` — persists then delivers a `SEND`:
    /// every SEND is persisted before delivery; storage
    /// failure does not block delivery, it only downgrades the reply to
    /// a non-fatal STORAGE error.
    pub async fn route(&self, from: &Arc<ConnHandle>, env: Envelope) -> RouteOutcome {
        let Payload::Send { ref body, ref thread } = env.payload else {
            return RouteOutcome::Delivered;
        };
        let to = env.to.clone().unwrap_or_default();
        let is_broadcast = to == "*";
        let recipients = self.resolve_recipients(&from.agent_name, &to);
        let topic = env.topic.as_deref().unwrap_or("");

        // A single-recipient direct message's seq is stable across a
        // replay; fan-out (broadcast/topic) assigns one per recipient
        // below and is never itself replayed (its `to` never matches an
        // individual agent name), so there is no single value to persist.
        let single_seq = match recipients.as_slice() {
            [only] => {
                let seq = self.next_seq(&from.agent_name, only, topic);
                let _ = self.storage.record_seq(&from.agent_name, topic, only, seq).await;
                Some(seq)
            }
            _ => None,
        };

        let record = MessageRecord {
            id: env.id.clone(),
            from: from.agent_name.clone(),
            to: to.clone(),
            body: body.clone(),
            thread: thread.clone(),
            ts: env.ts,
            status: MessageStatus::Pending,
            is_broadcast,
            reply_count: 0,
            channel: None,
            seq: single_seq,
        };

        let storage_ok = self.storage.append_message(&record).await.is_ok();

        let mut shadowed: std::collections::HashSet<String> = std::collections::HashSet::new();
        for recipient in &recipients {
            let seq = match single_seq {
                Some(seq) => seq,
                None => {
                    let seq = self.next_seq(&from.agent_name, recipient, topic);
                    let _ = self.storage.record_seq(&from.agent_name, topic, recipient, seq).await;
                    seq
                }
            };
            if let Some(conn) = self.connection_by_name(recipient) {
                let delivery = env.clone().with_seq(StreamSeq { n: seq }).to(recipient.clone());
                conn.deliver(delivery);
            }
            // Shadows bound to this recipient with receiveIncoming see the
            // message too, passively observing what the primary receives.
            for shadow in self.shadows_for(recipient, true) {
                if shadowed.insert(shadow.clone()) {
                    if let Some(conn) = self.connection_by_name(&shadow) {
                        conn.deliver(env.clone().to(shadow));
                    }
                }
            }
        }
        // Shadows bound to the sender with receiveOutgoing see everything
        // the primary sends, regardless of who it went to.
        for shadow in self.shadows_for(&from.agent_name, false) {
            if shadowed.insert(shadow.clone()) {
                if let Some(conn) = self.connection_by_name(&shadow) {
                    conn.deliver(env.clone().to(shadow));
                }
            }
        }

        if let Some(sync) = &env.payload_meta {
            if sync.blocking {
                self.register_pending_ack(from.clone(), sync.correlation_id.clone(), sync.timeout_ms);
            }
        }

        if storage_ok {
            RouteOutcome::Delivered
        } else {
            RouteOutcome::StorageFailed
        }
    }

    /// `routeChannelMessage` — delivers to every connected member of the
    /// channel and persists with `channel` populated.
    pub async fn route_channel_message(&self, from: &Arc<ConnHandle>, env: Envelope) -> RouteOutcome {
        let Payload::ChannelMessage { ref channel, ref body, ref thread } = env.payload else {
            return RouteOutcome::Delivered;
        };

        let record = MessageRecord {
            id: env.id.clone(),
            from: from.agent_name.clone(),
            to: format!("#{channel}"),
            body: body.clone(),
            thread: thread.clone(),
            ts: env.ts,
            status: MessageStatus::Pending,
            is_broadcast: false,
            reply_count: 0,
            channel: Some(channel.clone()),
            seq: None,
        };
        let storage_ok = self.storage.append_message(&record).await.is_ok();

        let peer = format!("#{channel}");
        for member in self.channel_members(channel) {
            if member == from.agent_name {
                continue;
            }
            let seq = self.next_seq(&from.agent_name, &peer, "");
            let _ = self.storage.record_seq(&from.agent_name, "", &peer, seq).await;
            if let Some(conn) = self.connection_by_name(&member) {
                conn.deliver(env.clone().with_seq(StreamSeq { n: seq }).to(member));
            }
        }

        if storage_ok {
            RouteOutcome::Delivered
        } else {
            RouteOutcome::StorageFailed
        }
    }

    fn register_pending_ack(&self, requester: Arc<ConnHandle>, correlation_id: String, timeout_ms: Option<u64>) {
        let mut pending = self.pending_acks.lock();
        if pending.contains_key(&correlation_id) {
            warn!(correlation_id, "duplicate correlation id, rejecting new blocking send");
            requester.deliver(Envelope::error(
                requester.agent_name.clone(),
                ErrorCode::Internal,
                format!("duplicate correlationId {correlation_id}"),
            ));
            return;
        }
        pending.insert(correlation_id.clone(), PendingAck { requester: requester.clone(), created_at: Instant::now() });
        drop(pending);

        let timeout = Duration::from_millis(timeout_ms.unwrap_or(self.default_sync_timeout_ms));
        let pending_acks = self.pending_acks.clone();
        let correlation_for_timeout = correlation_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut map = pending_acks.lock();
            if let Some(entry) = map.remove(&correlation_for_timeout) {
                entry.requester.deliver(Envelope::error(
                    entry.requester.agent_name.clone(),
                    ErrorCode::Timeout,
                    format!("blocking send timed out after {}ms", timeout.as_millis()),
                ));
            }
        });
    }

    /// `handleAck(conn, envelope)` — resolves the corresponding pending
    /// correlation, if the ACK's `message_id` matches one we're holding,
    /// and marks the message acked in storage so a future resume's
    /// `replayPending` never redelivers it.
    pub async fn handle_ack(&self, env: &Envelope) {
        let Payload::Ack { ref message_id } = env.payload else { return };
        let _ = self.storage.mark_status(message_id, MessageStatus::Acked).await;
        if let Some(entry) = self.pending_acks.lock().remove(message_id) {
            entry.requester.deliver(env.clone());
        }
    }

    fn cancel_pending_acks_for(&self, conn_id: &ConnId) {
        let mut pending = self.pending_acks.lock();
        let stale: Vec<String> = pending
            .iter()
            .filter(|(_, ack)| ack.requester.id == *conn_id)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            if let Some(entry) = pending.remove(&key) {
                entry.requester.deliver(Envelope::error(
                    entry.requester.agent_name.clone(),
                    ErrorCode::Cancelled,
                    "connection closed",
                ));
            }
        }
    }

    // -- resume / offline delivery ------------------------------------

    /// `replayPending(conn)` — for a resumed session, re-emit unacked
    /// messages stored while the previous connection was alive, with
    /// their original sequence numbers.
    pub async fn replay_pending(&self, conn: &Arc<ConnHandle>) {
        let pending = self
            .storage
            .query_messages(&crate::storage::MessageFilter {
                to: Some(conn.agent_name.clone()),
                status: Some(MessageStatus::Pending),
                ..Default::default()
            })
            .await
            .unwrap_or_default();
        for record in pending {
            // Reuse the seq assigned on first delivery so a resumed
            // session sees the same number it would have seen had the
            // connection never dropped; only a message that was never
            // delivered in the first place (recipient offline at send
            // time) needs a fresh one minted now.
            let seq = match record.seq {
                Some(seq) => seq,
                None => {
                    let seq = self.next_seq(&record.from, &conn.agent_name, "");
                    let _ = self.storage.record_seq(&record.from, "", &conn.agent_name, seq).await;
                    seq
                }
            };
            let env = Envelope::new(Payload::Send { body: record.body, thread: record.thread })
                .from(record.from)
                .to(conn.agent_name.clone())
                .with_seq(StreamSeq { n: seq });
            conn.deliver(env);
        }
    }

    /// `deliverPendingMessages(conn)` — delivers messages stored while the
    /// agent was offline.
    pub async fn deliver_pending_messages(&self, conn: &Arc<ConnHandle>) {
        self.replay_pending(conn).await;
    }
}
