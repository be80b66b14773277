use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use beacon_core::errors::{close_code, DeliveryError};
use beacon_core::frame::StatusFrame;
use beacon_core::ids::{SubscriberId, TaskId, UserId};
use beacon_relay::channel::StatusChannel;
use beacon_relay::snapshot::SnapshotBuilder;
use beacon_store::tasks::{TaskRepo, TaskRow};
use beacon_store::StoreError;

use crate::registry::SessionRegistry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authorizing,
    Streaming,
    Closing,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Authorizing => write!(f, "authorizing"),
            Self::Streaming => write!(f, "streaming"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Per-connection state machine: authorizes the caller, reconciles with a
/// snapshot, then relays sequenced updates until a terminal frame, remote
/// close, or host cancellation. One task per connection; sessions for the
/// same task are fully independent.
pub struct Session {
    id: SubscriberId,
    task_id: TaskId,
    user_id: UserId,
    state: SessionState,
    last_sequence: u64,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(task_id: TaskId, user_id: UserId, cancel: CancellationToken) -> Self {
        Self {
            id: SubscriberId::new(),
            task_id,
            user_id,
            state: SessionState::Connecting,
            last_sequence: 0,
            cancel,
        }
    }

    pub fn id(&self) -> &SubscriberId {
        &self.id
    }

    fn set_state(&mut self, next: SessionState) {
        tracing::debug!(
            subscriber_id = %self.id,
            from = %self.state,
            to = %next,
            "session transition"
        );
        self.state = next;
    }

    /// Drive the session to completion. Every exit path releases the
    /// subscription and heartbeat timer (dropped with the relay loop) and
    /// removes the registry entry.
    pub async fn run(
        mut self,
        socket: WebSocket,
        tasks: TaskRepo,
        snapshots: Arc<SnapshotBuilder>,
        channel: Arc<StatusChannel>,
        registry: Arc<SessionRegistry>,
        heartbeat_period: Duration,
    ) {
        let (mut ws_tx, mut ws_rx) = socket.split();

        let close = self
            .serve(&mut ws_tx, &mut ws_rx, &tasks, &snapshots, &channel, heartbeat_period)
            .await;

        self.set_state(SessionState::Closing);
        if let Some((code, reason)) = close {
            let _ = ws_tx
                .send(WsMessage::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })))
                .await;
        }
        registry.unregister(&self.id);
        self.set_state(SessionState::Closed);
        tracing::info!(
            subscriber_id = %self.id,
            task_id = %self.task_id,
            last_sequence = self.last_sequence,
            "session closed"
        );
    }

    /// Returns the close frame to send, or None when the transport is
    /// already gone and a close frame would be pointless.
    async fn serve(
        &mut self,
        ws_tx: &mut SplitSink<WebSocket, WsMessage>,
        ws_rx: &mut SplitStream<WebSocket>,
        tasks: &TaskRepo,
        snapshots: &SnapshotBuilder,
        channel: &Arc<StatusChannel>,
        heartbeat_period: Duration,
    ) -> Option<(u16, &'static str)> {
        self.set_state(SessionState::Authorizing);
        if let Err(e) = authorize(tasks, &self.task_id, &self.user_id) {
            tracing::info!(
                subscriber_id = %self.id,
                task_id = %self.task_id,
                reason = e.kind(),
                "session rejected"
            );
            return Some((e.close_code(), "session rejected"));
        }

        self.set_state(SessionState::Streaming);
        let snapshot = match snapshots.snapshot(&self.task_id) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(subscriber_id = %self.id, error = %e, "snapshot failed");
                return Some((e.close_code(), "snapshot unavailable"));
            }
        };
        self.last_sequence = snapshot.sequence;
        let snapshot_terminal = snapshot.terminal;
        if send_frame(ws_tx, &StatusFrame::Snapshot(snapshot)).await.is_err() {
            return None;
        }
        if snapshot_terminal {
            // Already finished: nothing further will be broadcast.
            return Some((close_code::NORMAL, "task already terminal"));
        }

        let mut subscription = channel.subscribe(&self.task_id);
        let mut heartbeat = tokio::time::interval(heartbeat_period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                received = subscription.recv() => match received {
                    Ok(body) => {
                        if body.sequence <= self.last_sequence {
                            // Duplicate or stale relative to what this
                            // subscriber has already seen.
                            continue;
                        }
                        self.last_sequence = body.sequence;
                        let terminal = body.terminal;
                        if send_frame(ws_tx, &StatusFrame::Update(body)).await.is_err() {
                            return None;
                        }
                        heartbeat.reset();
                        if terminal {
                            return Some((close_code::NORMAL, "task reached terminal status"));
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            subscriber_id = %self.id,
                            skipped = skipped,
                            "subscriber lagged, dropped updates"
                        );
                    }
                    Err(RecvError::Closed) => {
                        return Some((close_code::INTERNAL_ERROR, "status channel closed"));
                    }
                },
                _ = heartbeat.tick() => {
                    if send_frame(ws_tx, &StatusFrame::heartbeat(self.task_id.clone())).await.is_err() {
                        return None;
                    }
                }
                inbound = ws_rx.next() => match inbound {
                    Some(Ok(WsMessage::Close(_))) | None => {
                        tracing::debug!(subscriber_id = %self.id, "remote closed");
                        return None;
                    }
                    Some(Ok(_)) => {} // subscribers don't speak; ignore
                    Some(Err(e)) => {
                        tracing::debug!(subscriber_id = %self.id, error = %e, "transport error");
                        return None;
                    }
                },
                _ = self.cancel.cancelled() => {
                    return Some((close_code::GOING_AWAY, "server closing session"));
                }
            }
        }
    }
}

/// Owner-only access check. Runs before any snapshot or subscription, so a
/// rejected caller produces no side effects beyond the close itself.
pub(crate) fn authorize(
    tasks: &TaskRepo,
    task_id: &TaskId,
    user_id: &UserId,
) -> Result<TaskRow, DeliveryError> {
    let task = match tasks.get(task_id) {
        Ok(task) => task,
        Err(StoreError::NotFound(_)) => return Err(DeliveryError::NotFound(task_id.clone())),
        Err(e) => return Err(DeliveryError::StoreUnavailable(e.to_string())),
    };
    if task.owner_id != *user_id {
        return Err(DeliveryError::Forbidden(task_id.clone()));
    }
    Ok(task)
}

async fn send_frame(
    ws_tx: &mut SplitSink<WebSocket, WsMessage>,
    frame: &StatusFrame,
) -> Result<(), axum::Error> {
    match serde_json::to_string(frame) {
        Ok(json) => ws_tx.send(WsMessage::Text(json.into())).await,
        Err(e) => {
            tracing::error!(kind = frame.kind(), error = %e, "frame serialization failed");
            Ok(())
        }
    }
}
