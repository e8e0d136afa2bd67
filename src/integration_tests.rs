//! Integration tests that exercise the real approval/dispatch/result path
//! across registry, store, and gateway — the same code path the chat adapter
//! and HTTP API drive — using in-process connections instead of live sockets.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::{CredentialRepo, SqlCredentialRepo, SqlTaskRepo, TaskRepo};
use crate::gateway::{Gateway, GatewayEvent};
use crate::protocol::{AgentFrame, HubFrame, ResultStatus};
use crate::registry::Registry;
use crate::status::AgentStatusCache;
use crate::store::{NewTask, TaskStore};
use crate::types::{Credential, TaskStatus};

struct NullRepo;

#[async_trait]
impl CredentialRepo for NullRepo {
    async fn upsert(&self, _cred: &Credential) -> anyhow::Result<()> {
        Ok(())
    }
    async fn find_by_name(&self, _name: &str) -> anyhow::Result<Option<Credential>> {
        Ok(None)
    }
    async fn delete(&self, _name: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn load_all(&self) -> anyhow::Result<Vec<Credential>> {
        Ok(Vec::new())
    }
}

struct Hub {
    registry: Arc<Registry>,
    store: Arc<TaskStore>,
    status: Arc<AgentStatusCache>,
    gateway: Arc<Gateway>,
    events: mpsc::Receiver<GatewayEvent>,
}

fn build_hub(registry: Arc<Registry>, store: Arc<TaskStore>) -> Hub {
    let status = Arc::new(AgentStatusCache::new());
    let (event_tx, events) = mpsc::channel(128);
    let gateway = Arc::new(Gateway::new(
        registry.clone(),
        store.clone(),
        status.clone(),
        event_tx,
    ));
    Hub {
        registry,
        store,
        status,
        gateway,
        events,
    }
}

fn hub() -> Hub {
    build_hub(
        Arc::new(Registry::new(Arc::new(NullRepo))),
        Arc::new(TaskStore::new(None)),
    )
}

/// An in-process agent connection: what the socket task does after a
/// successful register, minus the socket.
struct FakeAgent {
    name: String,
    inbound: mpsc::Receiver<HubFrame>,
    closer: CancellationToken,
    conn_id: u64,
}

impl FakeAgent {
    /// Go through the real registration gate and backlog flush.
    async fn connect(hub: &Hub, name: &str, token: &str) -> Option<FakeAgent> {
        if !hub.registry.validate(name, token).await {
            return None;
        }
        let (tx, inbound) = mpsc::channel(64);
        let closer = CancellationToken::new();
        let conn_id = hub.registry.register(name, tx, closer.clone()).await;
        hub.gateway.flush_backlog(name).await;
        Some(FakeAgent {
            name: name.to_string(),
            inbound,
            closer,
            conn_id,
        })
    }

    async fn expect_task(&mut self) -> (Uuid, i64, i32) {
        match self.inbound.recv().await.expect("agent channel open") {
            HubFrame::Task {
                task_id,
                chat_id,
                message_id,
                ..
            } => (task_id, chat_id, message_id),
            other => panic!("expected task frame, got {:?}", other),
        }
    }

    fn try_next(&mut self) -> Option<HubFrame> {
        self.inbound.try_recv().ok()
    }

    async fn disconnect(self, hub: &Hub) {
        hub.registry.unregister(&self.name, self.conn_id).await;
        hub.status.remove(&self.name).await;
        self.closer.cancel();
    }
}

fn mention_task(from: &str, to: &str, content: &str, chat_id: i64, message_id: i32) -> NewTask {
    NewTask {
        from: from.into(),
        to: to.into(),
        content: content.into(),
        chat_id,
        message_id,
        conversation_id: None,
        parent_task_id: None,
    }
}

// Register → approve → dispatch → result, with the chat anchor riding along.
#[tokio::test]
async fn register_dispatch_result() {
    let mut hub = hub();
    let cred = hub.registry.issue_token("alice", 1000).await;
    let mut alice = FakeAgent::connect(&hub, "alice", &cred.token)
        .await
        .expect("valid token registers");

    // bob (not the owner) posts "@alice ping" in chat 42 at message 7.
    let task = hub
        .store
        .create_task(mention_task("bob", "alice", "ping", 42, 7), Vec::new())
        .await;
    hub.store
        .update_status(task.task_id, TaskStatus::AwaitingApproval, None)
        .await
        .unwrap();

    // Nothing is delivered while approval is pending.
    hub.gateway.flush_backlog("alice").await;
    assert!(alice.try_next().is_none());

    // Owner approves; the frame carries the chat anchor.
    let task = hub
        .store
        .update_status(task.task_id, TaskStatus::Approved, None)
        .await
        .unwrap();
    assert!(hub.gateway.dispatch_task(&task).await);
    let (dispatched, chat_id, message_id) = alice.expect_task().await;
    assert_eq!(dispatched, task.task_id);
    assert_eq!(chat_id, 42);
    assert_eq!(message_id, 7);
    assert_eq!(
        hub.store.get(task.task_id).await.unwrap().status,
        TaskStatus::Running
    );

    // Agent replies with a successful result.
    let (out_tx, _out_rx) = mpsc::channel(8);
    hub.gateway
        .handle_frame(
            "alice",
            AgentFrame::TaskResult {
                task_id: task.task_id,
                result: "pong".into(),
                status: ResultStatus::Success,
            },
            &out_tx,
        )
        .await;

    let done = hub.store.get(task.task_id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.result.as_deref(), Some("pong"));
    assert!(done.completed_at.is_some());

    // The adapter indexes the reply it sent so the thread can continue.
    hub.store.set_result_message(task.task_id, 900).await;
    assert_eq!(
        hub.store.find_by_result_message(900).await.unwrap().task_id,
        task.task_id
    );
}

// Auto-approve: the owner's own mention skips awaiting_approval entirely.
#[tokio::test]
async fn auto_approve_when_sender_owns_agent() {
    let mut hub = hub();
    let cred = hub.registry.issue_token("alice", 1000).await;
    let mut alice = FakeAgent::connect(&hub, "alice", &cred.token).await.unwrap();

    let task = hub
        .store
        .create_task(mention_task("owner", "alice", "ping", 42, 8), Vec::new())
        .await;
    assert_eq!(hub.registry.owner_of("alice").await, Some(1000));
    // Sender id matches owner_id: pending -> approved directly.
    let task = hub
        .store
        .update_status(task.task_id, TaskStatus::Approved, None)
        .await
        .unwrap();
    assert!(hub.gateway.dispatch_task(&task).await);

    let (dispatched, _, _) = alice.expect_task().await;
    assert_eq!(dispatched, task.task_id);
}

// Reply continuation shares the conversation and builds the parent chain.
#[tokio::test]
async fn reply_continuation_builds_parent_chain() {
    let mut hub = hub();
    let cred = hub.registry.issue_token("alice", 1000).await;
    let mut alice = FakeAgent::connect(&hub, "alice", &cred.token).await.unwrap();

    let t1 = hub
        .store
        .create_task(mention_task("bob", "alice", "ping", 42, 7), Vec::new())
        .await;
    let t1 = hub
        .store
        .update_status(t1.task_id, TaskStatus::Approved, None)
        .await
        .unwrap();
    hub.gateway.dispatch_task(&t1).await;
    alice.expect_task().await;
    hub.store
        .update_status(t1.task_id, TaskStatus::Completed, Some("done".into()))
        .await
        .unwrap();
    hub.store.set_result_message(t1.task_id, 900).await;

    // User replies "again" to the result message.
    let parent = hub.store.find_by_result_message(900).await.unwrap();
    assert!(!hub.store.is_closed(parent.conversation_id).await);
    let t2 = hub
        .store
        .create_task(
            NewTask {
                from: "bob".into(),
                to: parent.to.clone(),
                content: "again".into(),
                chat_id: 42,
                message_id: 10,
                conversation_id: Some(parent.conversation_id),
                parent_task_id: Some(parent.task_id),
            },
            Vec::new(),
        )
        .await;
    let t2 = hub
        .store
        .update_status(t2.task_id, TaskStatus::Approved, None)
        .await
        .unwrap();
    assert!(hub.gateway.dispatch_task(&t2).await);
    assert_eq!(hub.store.turn_count(parent.conversation_id).await, 2);

    let chain = hub.store.by_conversation(parent.conversation_id).await;
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[0].task_id, t1.task_id);
    assert_eq!(chain[1].task_id, t2.task_id);
    assert_eq!(chain[1].parent_task_id, Some(t1.task_id));

    // Closing the conversation blocks further turns.
    hub.store.close_conversation(parent.conversation_id).await;
    assert!(hub.store.is_closed(parent.conversation_id).await);
}

// Backlog survives the agent being offline and flushes on reconnect, in
// insertion order.
#[tokio::test]
async fn backlog_flushes_on_reconnect_in_order() {
    let hub = hub();
    let cred = hub.registry.issue_token("carol", 2000).await;

    // carol is offline; two tasks get approved meanwhile.
    let t1 = hub
        .store
        .create_task(mention_task("bob", "carol", "run", 42, 1), Vec::new())
        .await;
    let t2 = hub
        .store
        .create_task(mention_task("bob", "carol", "run again", 42, 2), Vec::new())
        .await;
    for t in [&t1, &t2] {
        let approved = hub
            .store
            .update_status(t.task_id, TaskStatus::Approved, None)
            .await
            .unwrap();
        // Offline: dispatch refuses, the task stays approved and queued.
        assert!(!hub.gateway.dispatch_task(&approved).await);
    }
    assert_eq!(hub.store.pending_for("carol").await.len(), 2);

    // Reconnect with the same token: both frames flush, oldest first.
    let mut carol = FakeAgent::connect(&hub, "carol", &cred.token).await.unwrap();
    let (first, _, _) = carol.expect_task().await;
    let (second, _, _) = carol.expect_task().await;
    assert_eq!(first, t1.task_id);
    assert_eq!(second, t2.task_id);
    assert!(hub.store.pending_for("carol").await.is_empty());
    assert_eq!(
        hub.store.get(t1.task_id).await.unwrap().status,
        TaskStatus::Running
    );

    // A second flush delivers nothing.
    hub.gateway.flush_backlog("carol").await;
    assert!(carol.try_next().is_none());
}

// Token rotation evicts the live connection and the old token stops
// registering.
#[tokio::test]
async fn token_rotation_evicts_and_invalidates() {
    let hub = hub();
    let cred = hub.registry.issue_token("dave", 3000).await;
    let dave = FakeAgent::connect(&hub, "dave", &cred.token).await.unwrap();
    assert!(hub.registry.is_online("dave").await);

    let rotated = hub.registry.refresh_token("dave", 3000).await.unwrap();
    assert!(dave.closer.is_cancelled());
    assert!(!hub.registry.is_online("dave").await);

    // The old token now fails the registration gate.
    assert!(FakeAgent::connect(&hub, "dave", &cred.token).await.is_none());
    assert!(FakeAgent::connect(&hub, "dave", &rotated.token).await.is_some());
}

// Cancel a running task through the agent's ack; a second cancel is refused
// by the absorbing terminal state.
#[tokio::test]
async fn cancel_running_task_via_agent_ack() {
    let mut hub = hub();
    let cred = hub.registry.issue_token("eve", 4000).await;
    let mut eve = FakeAgent::connect(&hub, "eve", &cred.token).await.unwrap();

    let t5 = hub
        .store
        .create_task(mention_task("bob", "eve", "long job", 42, 3), Vec::new())
        .await;
    let t5 = hub
        .store
        .update_status(t5.task_id, TaskStatus::Approved, None)
        .await
        .unwrap();
    hub.gateway.dispatch_task(&t5).await;
    eve.expect_task().await;

    // Owner cancels: the hub sends cancel_task to eve.
    assert!(hub.gateway.send_cancel("eve", t5.task_id).await);
    match eve.inbound.recv().await.unwrap() {
        HubFrame::CancelTask { task_id } => assert_eq!(task_id, t5.task_id),
        other => panic!("expected cancel frame, got {:?}", other),
    }

    // eve acknowledges.
    let (out_tx, _out_rx) = mpsc::channel(8);
    hub.gateway
        .handle_frame(
            "eve",
            AgentFrame::TaskCancelled { task_id: t5.task_id },
            &out_tx,
        )
        .await;
    assert_eq!(
        hub.store.get(t5.task_id).await.unwrap().status,
        TaskStatus::Cancelled
    );

    // Any further transition hits the absorbing terminal state.
    let err = hub
        .store
        .update_status(t5.task_id, TaskStatus::Failed, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cancelled"));
}

// Offline cancel: no connection, the hub cancels directly.
#[tokio::test]
async fn cancel_offline_task_directly() {
    let hub = hub();
    hub.registry.issue_token("frank", 5000).await;

    let task = hub
        .store
        .create_task(mention_task("bob", "frank", "job", 42, 4), Vec::new())
        .await;
    hub.store
        .update_status(task.task_id, TaskStatus::Approved, None)
        .await
        .unwrap();

    assert!(!hub.gateway.send_cancel("frank", task.task_id).await);
    let cancelled = hub
        .store
        .update_status(task.task_id, TaskStatus::Cancelled, None)
        .await
        .unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(hub.store.pending_for("frank").await.is_empty());
}

// Restart: credentials, open tasks, and the backlog reload from SQLite, and
// the approved downtime task is redelivered exactly once.
#[tokio::test]
async fn restart_reloads_backlog_and_redelivers_once() {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    crate::db::open_for_tests(&pool).await.unwrap();

    let task_repo: Arc<dyn TaskRepo> = Arc::new(SqlTaskRepo::new(pool.clone()));
    let cred_repo: Arc<dyn CredentialRepo> = Arc::new(SqlCredentialRepo::new(pool.clone()));

    // First process lifetime: credential issued, task approved but never
    // delivered (agent offline the whole time).
    let (task_id, token) = {
        let registry = Arc::new(Registry::new(cred_repo.clone()));
        let store = Arc::new(TaskStore::new(Some(task_repo.clone())));
        let hub = build_hub(registry, store);

        let cred = hub.registry.issue_token("carol", 2000).await;
        let task = hub
            .store
            .create_task(mention_task("bob", "carol", "run", 42, 5), Vec::new())
            .await;
        hub.store
            .update_status(task.task_id, TaskStatus::AwaitingApproval, None)
            .await
            .unwrap();
        hub.store
            .update_status(task.task_id, TaskStatus::Approved, None)
            .await
            .unwrap();
        (task.task_id, cred.token)
    };

    // Second process lifetime: reload everything from the database.
    let registry = Arc::new(Registry::new(cred_repo));
    assert_eq!(registry.load().await.unwrap(), 1);
    let store = Arc::new(TaskStore::new(Some(task_repo)));
    assert_eq!(store.load_open().await.unwrap(), 1);
    let mut hub = build_hub(registry, store);

    let pending = hub.store.pending_for("carol").await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].task_id, task_id);
    assert_eq!(pending[0].status, TaskStatus::Approved);

    // carol reconnects with the token issued before the restart.
    let mut carol = FakeAgent::connect(&hub, "carol", &token).await.unwrap();
    let (delivered, chat_id, _) = carol.expect_task().await;
    assert_eq!(delivered, task_id);
    assert_eq!(chat_id, 42);
    assert!(carol.try_next().is_none());
    assert!(hub.store.pending_for("carol").await.is_empty());

    match hub.events.recv().await.unwrap() {
        GatewayEvent::TaskDispatched { task } => assert_eq!(task.task_id, task_id),
        other => panic!("expected dispatch event, got {:?}", other),
    }
}

// Disconnect leaves running tasks running; a duplicate result after
// reconnect is absorbed by terminal idempotence.
#[tokio::test]
async fn duplicate_result_after_reconnect_is_noop() {
    let mut hub = hub();
    let cred = hub.registry.issue_token("alice", 1000).await;
    let mut alice = FakeAgent::connect(&hub, "alice", &cred.token).await.unwrap();

    let task = hub
        .store
        .create_task(mention_task("bob", "alice", "ping", 42, 6), Vec::new())
        .await;
    let task = hub
        .store
        .update_status(task.task_id, TaskStatus::Approved, None)
        .await
        .unwrap();
    hub.gateway.dispatch_task(&task).await;
    alice.expect_task().await;

    // Connection drops mid-flight: the task stays running.
    alice.disconnect(&hub).await;
    assert_eq!(
        hub.store.get(task.task_id).await.unwrap().status,
        TaskStatus::Running
    );

    // Reconnect and report the result twice (the hub may have lost the
    // connection before observing the first one).
    let _alice = FakeAgent::connect(&hub, "alice", &cred.token).await.unwrap();
    let (out_tx, _out_rx) = mpsc::channel(8);
    let result = AgentFrame::TaskResult {
        task_id: task.task_id,
        result: "pong".into(),
        status: ResultStatus::Success,
    };
    hub.gateway
        .handle_frame("alice", result.clone(), &out_tx)
        .await;
    hub.gateway.handle_frame("alice", result, &out_tx).await;

    assert_eq!(hub.status.snapshot("alice").await.completed_count, 1);
    let done = hub.store.get(task.task_id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);

    let mut completions = 0;
    while let Ok(event) = hub.events.try_recv() {
        if matches!(event, GatewayEvent::TaskCompleted { .. }) {
            completions += 1;
        }
    }
    assert_eq!(completions, 1);
}
