//! WebSocket gateway for worker agents. Connections progress through
//! Connecting -> AwaitingRegister -> Registered -> Closed; nothing is routed
//! before a validated `register`, and a new registration for a name evicts
//! the previous connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{AgentFrame, HubFrame, ResultStatus, WireAttachment};
use crate::registry::Registry;
use crate::status::AgentStatusCache;
use crate::store::TaskStore;
use crate::types::{Attachment, Task, TaskStatus};

/// Ping cadence; a connection silent for two intervals is considered dead.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const HEARTBEAT_DEAD_AFTER_SECS: i64 = 60;
/// Suppression window for repeated "agent online" notices during flapping.
const ONLINE_NOTICE_DEBOUNCE: Duration = Duration::from_secs(5);

/// Events surfaced to the chat adapter.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    AgentOnline { name: String },
    AgentOffline { name: String },
    TaskDispatched { task: Task },
    TaskCompleted { task: Task, success: bool },
    TaskCancelled { task: Task },
    TaskProgress {
        task_id: Uuid,
        status: String,
        detail: Option<String>,
        elapsed_ms: u64,
    },
}

pub struct Gateway {
    registry: Arc<Registry>,
    store: Arc<TaskStore>,
    status: Arc<AgentStatusCache>,
    events: mpsc::Sender<GatewayEvent>,
    online_debounce: Mutex<HashMap<String, Instant>>,
}

impl Gateway {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<TaskStore>,
        status: Arc<AgentStatusCache>,
        events: mpsc::Sender<GatewayEvent>,
    ) -> Self {
        Self {
            registry,
            store,
            status,
            events,
            online_debounce: Mutex::new(HashMap::new()),
        }
    }

    /// Try to deliver an approved task to its target agent. Returns false
    /// when the agent is offline or the write fails — the task stays in the
    /// backlog for redelivery on reconnect.
    pub async fn dispatch_task(&self, task: &Task) -> bool {
        if !self.registry.is_online(&task.to).await {
            return false;
        }
        let attachments = self.store.take_attachments(task.task_id).await;
        let frame = task_frame(task, &attachments);

        if let Err(e) = self.registry.send_to(&task.to, frame).await {
            debug!(task_id = %task.task_id, "Dispatch write failed: {}", e);
            self.store.put_attachments(task.task_id, attachments).await;
            return false;
        }

        self.store.remove_pending(&task.to, task.task_id).await;
        match self
            .store
            .update_status(task.task_id, TaskStatus::Running, None)
            .await
        {
            Ok(running) => {
                self.status.mark_dispatched(&task.to, task.task_id).await;
                info!(task_id = %task.task_id, agent = %task.to, "Task dispatched");
                let _ = self
                    .events
                    .send(GatewayEvent::TaskDispatched { task: running })
                    .await;
                true
            }
            Err(e) => {
                warn!(task_id = %task.task_id, "Dispatched task refused running transition: {}", e);
                true
            }
        }
    }

    /// Deliver the backlog to a freshly registered agent, in insertion order.
    /// Terminal leftovers are dropped; unapproved tasks wait for approval.
    pub async fn flush_backlog(&self, agent: &str) {
        for task in self.store.pending_for(agent).await {
            if task.status.is_terminal() {
                self.store.remove_pending(agent, task.task_id).await;
                continue;
            }
            if task.status != TaskStatus::Approved {
                continue;
            }
            if !self.dispatch_task(&task).await {
                // Connection died mid-flush; redelivery happens next time.
                break;
            }
        }
    }

    /// Ask a connected agent to cancel a running task. Returns false when the
    /// agent is offline (the caller then cancels directly).
    pub async fn send_cancel(&self, agent: &str, task_id: Uuid) -> bool {
        self.registry
            .send_to(agent, HubFrame::CancelTask { task_id })
            .await
            .is_ok()
    }

    async fn notify_online(&self, name: &str) {
        {
            let mut debounce = self.online_debounce.lock().await;
            let now = Instant::now();
            if let Some(last) = debounce.get(name) {
                if now.duration_since(*last) < ONLINE_NOTICE_DEBOUNCE {
                    return;
                }
            }
            debounce.insert(name.to_string(), now);
        }
        let _ = self
            .events
            .send(GatewayEvent::AgentOnline {
                name: name.to_string(),
            })
            .await;
    }

    /// Route one registered-phase frame. The sum is matched exhaustively so
    /// a new frame type cannot be silently unhandled.
    pub(crate) async fn handle_frame(
        &self,
        agent: &str,
        frame: AgentFrame,
        outbound: &mpsc::Sender<HubFrame>,
    ) {
        match frame {
            AgentFrame::Register { .. } => {
                // Only valid as the first frame; repeated registers are noise.
                debug!(agent, "Ignoring register frame on registered connection");
            }
            AgentFrame::Pong => {}
            AgentFrame::TaskResult {
                task_id,
                result,
                status,
            } => {
                let Some(task) = self.store.get(task_id).await else {
                    warn!(agent, task_id = %task_id, "Result for unknown task");
                    return;
                };
                if task.status.is_terminal() {
                    // At-least-once delivery: duplicate results are dropped.
                    debug!(task_id = %task_id, "Duplicate result for terminal task");
                    return;
                }
                let success = status == ResultStatus::Success;
                let new_status = if success {
                    TaskStatus::Completed
                } else {
                    TaskStatus::Failed
                };
                match self
                    .store
                    .update_status(task_id, new_status, Some(result))
                    .await
                {
                    Ok(task) => {
                        self.status.incr_completed(agent).await;
                        let _ = self
                            .events
                            .send(GatewayEvent::TaskCompleted { task, success })
                            .await;
                    }
                    Err(e) => warn!(task_id = %task_id, "Result transition refused: {}", e),
                }
            }
            AgentFrame::TaskCancelled { task_id } => {
                match self
                    .store
                    .update_status(task_id, TaskStatus::Cancelled, None)
                    .await
                {
                    Ok(task) => {
                        let _ = self.events.send(GatewayEvent::TaskCancelled { task }).await;
                    }
                    Err(e) => warn!(task_id = %task_id, "Cancel-ack transition refused: {}", e),
                }
            }
            AgentFrame::TaskProgress {
                task_id,
                status,
                detail,
                elapsed_ms,
            } => {
                let _ = self
                    .events
                    .send(GatewayEvent::TaskProgress {
                        task_id,
                        status,
                        detail,
                        elapsed_ms,
                    })
                    .await;
            }
            AgentFrame::StatusReport {
                running_tasks,
                current_task_id,
                idle_since,
            } => {
                self.status
                    .apply_report(agent, running_tasks, current_task_id, idle_since)
                    .await;
            }
            AgentFrame::ListAgents { request_id } => {
                let agents = self
                    .registry
                    .list_online()
                    .await
                    .into_iter()
                    .map(Into::into)
                    .collect();
                let _ = outbound
                    .send(HubFrame::ListAgentsResponse { request_id, agents })
                    .await;
            }
            AgentFrame::TaskStatus {
                request_id,
                task_id,
            } => {
                let task = self.store.get(task_id).await;
                let _ = outbound
                    .send(HubFrame::TaskStatusResponse { request_id, task })
                    .await;
            }
            AgentFrame::SendMessage { target_agent, .. } => {
                // Reserved in the wire protocol; accepted and ignored.
                debug!(agent, target = %target_agent, "Ignoring send_message frame");
            }
        }
    }
}

/// Axum handler for the agent WebSocket endpoint.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(gateway): State<Arc<Gateway>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, gateway))
}

async fn handle_socket(socket: WebSocket, gateway: Arc<Gateway>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<HubFrame>(64);
    let closer = CancellationToken::new();

    // Writer task: serializes hub frames onto the socket and emits a close
    // frame when the connection is being torn down.
    let writer_closer = closer.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = outbound_rx.recv() => {
                    let Some(frame) = maybe else { break };
                    let text = match serde_json::to_string(&frame) {
                        Ok(t) => t,
                        Err(e) => {
                            warn!("Failed to serialize hub frame: {}", e);
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                _ = writer_closer.cancelled() => {
                    // Flush anything already queued (e.g. a failure ack)
                    // before the close frame.
                    while let Ok(frame) = outbound_rx.try_recv() {
                        if let Ok(text) = serde_json::to_string(&frame) {
                            if ws_tx.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                    }
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Awaiting-register: the only acceptable first message is `register`.
    let registered = await_register(&mut ws_rx, &gateway, &outbound_tx).await;
    let (agent_name, conn_id) = match registered {
        Some(pair) => pair,
        None => {
            closer.cancel();
            let _ = writer.await;
            return;
        }
    };

    info!(agent = %agent_name, "Agent registered");
    gateway.notify_online(&agent_name).await;
    gateway.flush_backlog(&agent_name).await;

    // Registered phase: demultiplex until the socket closes or the registry
    // evicts this connection.
    loop {
        tokio::select! {
            maybe = ws_rx.next() => {
                let msg = match maybe {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        debug!(agent = %agent_name, "WebSocket read error: {}", e);
                        break;
                    }
                    None => break,
                };
                gateway.registry.touch(&agent_name).await;
                match msg {
                    Message::Text(text) => {
                        // Malformed and unknown frames are dropped silently.
                        if let Some(frame) = AgentFrame::parse(&text) {
                            gateway.handle_frame(&agent_name, frame, &outbound_tx).await;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            _ = closer.cancelled() => break,
        }
    }

    closer.cancel();
    let _ = writer.await;

    if gateway.registry.unregister(&agent_name, conn_id).await {
        info!(agent = %agent_name, "Agent disconnected");
        gateway.status.remove(&agent_name).await;
        let _ = gateway
            .events
            .send(GatewayEvent::AgentOffline { name: agent_name })
            .await;
    }
}

/// Drive the Awaiting-Register phase: returns the validated agent name and
/// connection id, or None if the peer failed the handshake.
async fn await_register(
    ws_rx: &mut futures::stream::SplitStream<WebSocket>,
    gateway: &Arc<Gateway>,
    outbound_tx: &mpsc::Sender<HubFrame>,
) -> Option<(String, u64)> {
    loop {
        let msg = match ws_rx.next().await {
            Some(Ok(m)) => m,
            _ => return None,
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => return None,
            // Control frames may precede registration.
            _ => continue,
        };

        let Some(frame) = AgentFrame::parse(&text) else {
            continue;
        };
        let AgentFrame::Register { agent_name, token } = frame else {
            // Anything else before registration drops the connection.
            debug!("Dropping connection: first frame was not register");
            return None;
        };

        if !gateway.registry.validate(&agent_name, &token).await {
            warn!(agent = %agent_name, "Registration rejected: invalid token");
            let _ = outbound_tx
                .send(HubFrame::RegisterAck {
                    success: false,
                    error: Some("无效的 token".to_string()),
                })
                .await;
            return None;
        }

        let closer = CancellationToken::new();
        let conn_id = gateway
            .registry
            .register(&agent_name, outbound_tx.clone(), closer)
            .await;
        let _ = outbound_tx
            .send(HubFrame::RegisterAck {
                success: true,
                error: None,
            })
            .await;
        return Some((agent_name, conn_id));
    }
}

fn task_frame(task: &Task, attachments: &[Attachment]) -> HubFrame {
    let wire_attachments = if attachments.is_empty() {
        None
    } else {
        Some(
            attachments
                .iter()
                .map(|a| WireAttachment {
                    filename: a.filename.clone(),
                    mime_type: a.mime_type.clone(),
                    data_base64: base64::engine::general_purpose::STANDARD.encode(&a.data),
                    size: a.size,
                })
                .collect(),
        )
    };
    HubFrame::Task {
        task_id: task.task_id,
        from: task.from.clone(),
        content: task.content.clone(),
        chat_id: task.chat_id,
        message_id: task.message_id,
        conversation_id: Some(task.conversation_id),
        parent_task_id: task.parent_task_id,
        attachments: wire_attachments,
    }
}

/// Periodic heartbeat: ping every registered connection and close the ones
/// that have been silent for two intervals.
pub fn spawn_heartbeat(
    registry: Arc<Registry>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => break,
            }
            let now = chrono::Utc::now();
            for (name, last_seen, outbound, closer) in registry.heartbeat_snapshot().await {
                if (now - last_seen).num_seconds() > HEARTBEAT_DEAD_AFTER_SECS {
                    warn!(agent = %name, "Closing dead connection (missed heartbeats)");
                    closer.cancel();
                } else if outbound.try_send(HubFrame::Ping).is_err() {
                    debug!(agent = %name, "Ping dropped: outbound queue full or closing");
                }
            }
        }
    })
}
