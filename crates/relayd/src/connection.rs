// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One live transport session: handshake, heartbeat,
//! resume, and envelope dispatch. The Connection task owns its socket
//! exclusively — external senders enqueue onto `ConnHandle::outbound` and
//! never touch the stream directly.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use relay_proto::{ErrorCode, Envelope, FrameReader, FrameWriter, Payload, SeedSequence};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{AgentRegistry, AgentRegistryEntry};
use crate::router::{ConnHandle, Router};
use crate::storage::{MessageFilter, MessageStatus, QueryOrder, StorageAdapter};
use crate::supervisor::SpawnRequest;

/// Connection state machine, driven purely by
/// matching on incoming envelopes and transport events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    HelloSent,
    Active,
    Draining,
    Closed,
}

/// Everything a Connection task needs to dispatch envelopes, shared
/// across every connection on the daemon.
pub struct ConnectionContext {
    pub router: Arc<Router>,
    pub storage: Arc<dyn StorageAdapter>,
    pub registry: Arc<AgentRegistry>,
    pub heartbeat_interval: Duration,
    pub heartbeat_misses: u32,
    pub spawn_tx: Option<mpsc::UnboundedSender<SpawnRequest>>,
    pub started_at: Instant,
}

/// Drive one accepted stream end to end: handshake, then the
/// read/write/heartbeat select loop, until the peer disconnects or a
/// fatal error closes the connection.
pub async fn handle_connection<S>(
    stream: S,
    ctx: Arc<ConnectionContext>,
    frame_cap: usize,
    shutdown: CancellationToken,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half, frame_cap);
    let mut writer = FrameWriter::new(write_half);

    let hello = match reader.next_envelope().await {
        Ok(Some(env)) => env,
        Ok(None) => return Ok(()),
        Err(e) => {
            let _ = writer
                .write_envelope(&Envelope::error("_unknown", ErrorCode::Protocol, e.to_string()))
                .await;
            return Err(e);
        }
    };

    let Payload::Hello {
        agent_name,
        cli,
        entity_type,
        resume_token,
        program,
        model,
        task,
        cwd,
        team,
    } = hello.payload
    else {
        let _ = writer
            .write_envelope(&Envelope::error("_unknown", ErrorCode::Protocol, "expected HELLO"))
            .await;
        anyhow::bail!("first frame was not HELLO");
    };

    let resumed = match &resume_token {
        Some(token) => ctx.storage.lookup_session_by_resume_token(&agent_name, token).await.ok().flatten(),
        None => None,
    };

    let (session_id, resume_token, seed_sequences) = match resumed {
        Some(state) => (state.session_id, state.resume_token, state.seed_sequences),
        None => (relay_proto::new_id(), relay_proto::new_id(), Vec::new()),
    };

    for (topic, peer, max_seq) in &seed_sequences {
        ctx.router.seed_seq(&agent_name, peer, topic, *max_seq);
    }

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(256);
    let conn = ConnHandle::new(
        agent_name.clone(),
        entity_type,
        session_id.clone(),
        resume_token.clone(),
        outbound_tx,
    );
    *conn.state.lock() = ConnectionState::Active;

    ctx.router.register(conn.clone());
    let _ = ctx.storage.start_session(&agent_name, &session_id, &resume_token).await;
    ctx.registry.upsert(AgentRegistryEntry {
        name: agent_name.clone(),
        cli: Some(cli),
        program,
        model,
        task,
        cwd,
        team,
        last_seen_ms: relay_proto::now_ms(),
        resume_token: resume_token.clone(),
    });

    let welcome = Envelope::new(Payload::Welcome {
        session_id: session_id.clone(),
        resume_token: resume_token.clone(),
        seed_sequences: seed_sequences
            .iter()
            .map(|(topic, peer, n)| SeedSequence { topic: topic.clone(), peer: peer.clone(), max_seq: *n })
            .collect(),
    })
    .to(agent_name.clone());
    writer.write_envelope(&welcome).await?;

    info!(agent = %agent_name, conn = %conn.id, resumed = seed_sequences.len() > 0, "connection active");
    ctx.router.replay_pending(&conn).await;

    let mut missed_heartbeats: u32 = 0;
    let mut ping_ticker = tokio::time::interval(ctx.heartbeat_interval);
    ping_ticker.tick().await; // first tick fires immediately; consume it

    let result = loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break Ok(()),

            frame = reader.next_envelope() => {
                match frame {
                    Ok(Some(env)) => {
                        if env.payload.is_unknown() {
                            let _ = writer.write_envelope(&Envelope::error(
                                agent_name.clone(), ErrorCode::Protocol, "unknown envelope type"
                            )).await;
                            break Ok(());
                        }
                        if matches!(env.payload, Payload::Pong {}) {
                            missed_heartbeats = 0;
                        }
                        if let Err(e) = dispatch(&ctx, &conn, env, &mut writer).await {
                            warn!(agent = %agent_name, err = %e, "error dispatching envelope");
                        }
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => {
                        let _ = writer.write_envelope(&Envelope::error(
                            agent_name.clone(), ErrorCode::Protocol, e.to_string()
                        )).await;
                        break Err(e);
                    }
                }
            }

            out = outbound_rx.recv() => {
                match out {
                    Some(env) => {
                        if let Err(e) = writer.write_envelope(&env).await {
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                }
            }

            _ = ping_ticker.tick() => {
                if conn.processing.load(Ordering::Relaxed) {
                    missed_heartbeats = 0;
                } else {
                    missed_heartbeats += 1;
                }
                if missed_heartbeats > ctx.heartbeat_misses {
                    debug!(agent = %agent_name, "heartbeat missed threshold exceeded, closing");
                    break Ok(());
                }
                if writer.write_envelope(&Envelope::new(Payload::Ping {})).await.is_err() {
                    break Ok(());
                }
            }
        }
    };

    ctx.router.unregister(&conn);
    let _ = ctx.storage.end_session(&session_id).await;
    info!(agent = %agent_name, conn = %conn.id, "connection closed");
    result
}

/// Dispatch one inbound envelope to the Router/registry/supervisor,
/// replying inline for request/response query types.
async fn dispatch<W: AsyncWrite + Unpin>(
    ctx: &Arc<ConnectionContext>,
    conn: &Arc<ConnHandle>,
    env: Envelope,
    writer: &mut FrameWriter<W>,
) -> anyhow::Result<()> {
    match &env.payload {
        Payload::Ping {} => {
            writer.write_envelope(&Envelope::new(Payload::Pong {}).to(conn.agent_name.clone())).await?;
        }
        Payload::Pong {} => {}
        Payload::Send { .. } => {
            let env = env.from(conn.agent_name.clone());
            ctx.router.route(conn, env).await;
        }
        Payload::Ack { .. } => {
            ctx.router.handle_ack(&env).await;
        }
        Payload::Subscribe { topic } => ctx.router.subscribe(&conn.agent_name, topic),
        Payload::Unsubscribe { topic } => ctx.router.unsubscribe(&conn.agent_name, topic),
        Payload::ChannelJoin { channel } => {
            ctx.router.channel_join(&conn.agent_name, channel);
            let _ = ctx
                .storage
                .set_channel_members(channel, &ctx.router.channel_members(channel))
                .await;
        }
        Payload::ChannelLeave { channel } => {
            ctx.router.channel_leave(&conn.agent_name, channel);
            let _ = ctx
                .storage
                .set_channel_members(channel, &ctx.router.channel_members(channel))
                .await;
        }
        Payload::ChannelMessage { .. } => {
            let env = env.from(conn.agent_name.clone());
            ctx.router.route_channel_message(conn, env).await;
        }
        Payload::ShadowBind { primary, speak_on, receive_incoming, receive_outgoing } => {
            let tags: HashSet<String> = speak_on.iter().cloned().collect();
            ctx.router.bind_shadow(&conn.agent_name, primary, tags, *receive_incoming, *receive_outgoing);
        }
        Payload::ShadowUnbind {} => ctx.router.unbind_shadow(&conn.agent_name),
        Payload::Log { .. } => {}
        Payload::Spawn { name, cli, program, model, task, cwd, team } => {
            if let Some(tx) = &ctx.spawn_tx {
                ctx.router.mark_spawning(name);
                let _ = tx.send(SpawnRequest {
                    name: name.clone(),
                    cli: cli.clone(),
                    program: program.clone(),
                    model: model.clone(),
                    task: task.clone(),
                    cwd: cwd.clone(),
                    team: team.clone(),
                });
            }
        }
        Payload::Release { name } => {
            ctx.router.force_remove_agent(name);
            ctx.registry.touch(name, relay_proto::now_ms());
        }
        Payload::Status {} => {
            let (agents, _users) = ctx.router.connected_agents();
            writer
                .write_envelope(
                    &Envelope::new(Payload::StatusResponse {
                        agents: agents.len() as u32,
                        connections: ctx.router.connection_count() as u32,
                        pending_acks: ctx.router.pending_ack_count() as u32,
                        uptime_secs: ctx.started_at.elapsed().as_secs(),
                    })
                    .to(conn.agent_name.clone()),
                )
                .await?;
        }
        Payload::Inbox { unread_only } => {
            let messages = ctx
                .storage
                .query_messages(&MessageFilter {
                    to: Some(conn.agent_name.clone()),
                    unread_only: *unread_only,
                    order: QueryOrder::Descending,
                    ..Default::default()
                })
                .await
                .unwrap_or_default();
            writer
                .write_envelope(
                    &Envelope::new(Payload::InboxResponse { messages: messages.into_iter().map(into_wire).collect() })
                        .to(conn.agent_name.clone()),
                )
                .await?;
        }
        Payload::MessagesQuery { from, to, thread, since_ts, limit, order, unread_only } => {
            let messages = ctx
                .storage
                .query_messages(&MessageFilter {
                    from: from.clone(),
                    to: to.clone(),
                    thread: thread.clone(),
                    since_ts: *since_ts,
                    limit: *limit,
                    order: if order.as_deref() == Some("desc") { QueryOrder::Descending } else { QueryOrder::Ascending },
                    unread_only: *unread_only,
                    status: None,
                })
                .await
                .unwrap_or_default();
            writer
                .write_envelope(
                    &Envelope::new(Payload::MessagesResponse { messages: messages.into_iter().map(into_wire).collect() })
                        .to(conn.agent_name.clone()),
                )
                .await?;
        }
        Payload::ListAgents {} => {
            let agents = ctx.registry.list().into_iter().map(|e| relay_proto::AgentRegistryEntryWire {
                name: e.name,
                cli: e.cli,
                program: e.program,
                model: e.model,
                task: e.task,
                cwd: e.cwd,
                team: e.team,
                last_seen_ms: e.last_seen_ms,
            }).collect();
            writer
                .write_envelope(&Envelope::new(Payload::ListAgentsResponse { agents }).to(conn.agent_name.clone()))
                .await?;
        }
        Payload::ListConnectedAgents {} => {
            let (agents, users) = ctx.router.connected_agents();
            writer
                .write_envelope(
                    &Envelope::new(Payload::ListConnectedAgentsResponse { agents, users }).to(conn.agent_name.clone()),
                )
                .await?;
        }
        Payload::RemoveAgent { name } => {
            let removed_router = ctx.router.force_remove_agent(name);
            let removed_registry = ctx.registry.remove(name);
            let _ = ctx.storage.remove_agent(name).await;
            let _ = ctx.storage.remove_messages_for_agent(name).await;
            writer
                .write_envelope(
                    &Envelope::new(Payload::RemoveAgentResponse { removed: removed_router || removed_registry })
                        .to(conn.agent_name.clone()),
                )
                .await?;
        }
        Payload::Health {} => {
            let health = ctx.storage.health().await;
            writer
                .write_envelope(
                    &Envelope::new(Payload::HealthResponse {
                        storage_ok: health.ok,
                        driver: health.driver.to_owned(),
                        uptime_secs: ctx.started_at.elapsed().as_secs(),
                    })
                    .to(conn.agent_name.clone()),
                )
                .await?;
        }
        Payload::Metrics {} => {
            let (agents, _users) = ctx.router.connected_agents();
            writer
                .write_envelope(
                    &Envelope::new(Payload::MetricsResponse {
                        connections: ctx.router.connection_count() as u32,
                        agents: agents.len() as u32,
                        pending_acks: ctx.router.pending_ack_count() as u32,
                        channels: ctx.router.channel_count() as u32,
                        topics: ctx.router.topic_count() as u32,
                    })
                    .to(conn.agent_name.clone()),
                )
                .await?;
        }
        Payload::AgentReady {} => {
            ctx.router.clear_spawning(&conn.agent_name);
        }
        Payload::Welcome { .. } | Payload::Error { .. } | Payload::StatusResponse { .. }
        | Payload::InboxResponse { .. } | Payload::MessagesResponse { .. }
        | Payload::ListAgentsResponse { .. } | Payload::ListConnectedAgentsResponse { .. }
        | Payload::RemoveAgentResponse { .. } | Payload::HealthResponse { .. }
        | Payload::MetricsResponse { .. } | Payload::Hello { .. } | Payload::Unknown => {
            // Server-to-client or handshake-only types received out of
            // turn: not an error, just nothing to do.
        }
    }
    Ok(())
}

fn into_wire(r: crate::storage::MessageRecord) -> relay_proto::MessageRecordWire {
    relay_proto::MessageRecordWire {
        id: r.id,
        from: r.from,
        to: r.to,
        body: r.body,
        thread: r.thread,
        ts: r.ts,
        status: match r.status {
            MessageStatus::Pending => relay_proto::MessageStatusWire::Pending,
            MessageStatus::Delivered => relay_proto::MessageStatusWire::Delivered,
            MessageStatus::Acked => relay_proto::MessageStatusWire::Acked,
            MessageStatus::Read => relay_proto::MessageStatusWire::Read,
            MessageStatus::Failed => relay_proto::MessageStatusWire::Failed,
        },
        is_broadcast: r.is_broadcast,
        reply_count: r.reply_count,
        channel: r.channel,
    }
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
