use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::TaskRepo;
use crate::types::{Attachment, Task, TaskStatus};

/// Parameters for a new task. A fresh conversation is opened unless one is
/// supplied (reply continuations supply the parent's).
pub struct NewTask {
    pub from: String,
    pub to: String,
    pub content: String,
    pub chat_id: i64,
    pub message_id: i32,
    pub conversation_id: Option<Uuid>,
    pub parent_task_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
struct ConversationState {
    turn_count: u32,
    last_active_at: DateTime<Utc>,
    closed: bool,
}

/// Owns all task records, the per-agent backlog, the conversation index, and
/// the in-memory attachment cache. In-memory state is authoritative for the
/// live process; persistence runs after each mutation and failures are logged
/// and swallowed (a later update reconciles on success).
pub struct TaskStore {
    tasks: RwLock<HashMap<Uuid, Task>>,
    backlog: RwLock<HashMap<String, Vec<Uuid>>>,
    conversations: RwLock<HashMap<Uuid, ConversationState>>,
    by_result_msg: RwLock<HashMap<i32, Uuid>>,
    attachments: RwLock<HashMap<Uuid, Vec<Attachment>>>,
    repo: Option<Arc<dyn TaskRepo>>,
}

impl TaskStore {
    pub fn new(repo: Option<Arc<dyn TaskRepo>>) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            backlog: RwLock::new(HashMap::new()),
            conversations: RwLock::new(HashMap::new()),
            by_result_msg: RwLock::new(HashMap::new()),
            attachments: RwLock::new(HashMap::new()),
            repo,
        }
    }

    /// Reload non-terminal tasks and the backlog after a restart. Read
    /// failures here are fatal to startup.
    pub async fn load_open(&self) -> anyhow::Result<usize> {
        let Some(repo) = &self.repo else {
            return Ok(0);
        };
        let (open, pending) = repo.load_open_tasks().await?;
        let count = open.len();

        let mut tasks = self.tasks.write().await;
        let mut conversations = self.conversations.write().await;
        let mut by_result = self.by_result_msg.write().await;
        for task in open {
            let entry = conversations
                .entry(task.conversation_id)
                .or_insert(ConversationState {
                    turn_count: 0,
                    last_active_at: task.created_at,
                    closed: false,
                });
            entry.turn_count += 1;
            if task.created_at > entry.last_active_at {
                entry.last_active_at = task.created_at;
            }
            if let Some(mid) = task.result_message_id {
                by_result.insert(mid, task.task_id);
            }
            tasks.insert(task.task_id, task);
        }

        let mut backlog = self.backlog.write().await;
        for (agent, task_id) in pending {
            backlog.entry(agent).or_default().push(task_id);
        }
        Ok(count)
    }

    /// Create a task in `pending`, enqueue it on the target's backlog, and
    /// persist task-then-backlog in that order (the backlog row references
    /// the task row).
    pub async fn create_task(&self, new: NewTask, attachments: Vec<Attachment>) -> Task {
        let now = Utc::now();
        let task = Task {
            task_id: Uuid::new_v4(),
            from: new.from,
            to: new.to,
            content: new.content,
            status: TaskStatus::Pending,
            result: None,
            created_at: now,
            completed_at: None,
            chat_id: new.chat_id,
            message_id: new.message_id,
            conversation_id: new.conversation_id.unwrap_or_else(Uuid::new_v4),
            parent_task_id: new.parent_task_id,
            result_message_id: None,
        };

        {
            let mut tasks = self.tasks.write().await;
            tasks.insert(task.task_id, task.clone());
        }
        {
            let mut conversations = self.conversations.write().await;
            let entry = conversations
                .entry(task.conversation_id)
                .or_insert(ConversationState {
                    turn_count: 0,
                    last_active_at: now,
                    closed: false,
                });
            entry.turn_count += 1;
            entry.last_active_at = now;
        }
        {
            let mut backlog = self.backlog.write().await;
            backlog.entry(task.to.clone()).or_default().push(task.task_id);
        }
        if !attachments.is_empty() {
            self.attachments
                .write()
                .await
                .insert(task.task_id, attachments);
        }

        if let Some(repo) = &self.repo {
            if let Err(e) = repo.upsert_task(&task).await {
                warn!(task_id = %task.task_id, "Failed to persist task: {}", e);
            } else if let Err(e) = repo.save_pending(&task.to, task.task_id).await {
                warn!(task_id = %task.task_id, "Failed to persist backlog entry: {}", e);
            }
        }

        info!(task_id = %task.task_id, to = %task.to, "Task created");
        task
    }

    /// Apply a status transition. Terminal statuses are absorbing: repeating
    /// the current terminal status is an idempotent no-op; any other
    /// transition out of a terminal status is an error, as is any edge not in
    /// the state machine.
    pub async fn update_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        result: Option<String>,
    ) -> anyhow::Result<Task> {
        let updated = {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .get_mut(&task_id)
                .ok_or_else(|| anyhow::anyhow!("task {} not found", task_id))?;

            if task.status.is_terminal() {
                if task.status == status {
                    return Ok(task.clone());
                }
                anyhow::bail!(
                    "task {} is already {} and cannot become {}",
                    task_id,
                    task.status,
                    status
                );
            }
            if !task.status.can_transition(status) {
                anyhow::bail!(
                    "illegal task transition {} -> {} for {}",
                    task.status,
                    status,
                    task_id
                );
            }

            task.status = status;
            if result.is_some() {
                task.result = result;
            }
            if status.is_terminal() && status != TaskStatus::Rejected {
                task.completed_at = Some(Utc::now());
            }
            task.clone()
        };

        if status.is_terminal() {
            self.remove_pending(&updated.to, task_id).await;
            self.attachments.write().await.remove(&task_id);
            let mut conversations = self.conversations.write().await;
            if let Some(entry) = conversations.get_mut(&updated.conversation_id) {
                entry.last_active_at = Utc::now();
            }
        }

        self.persist_update(&updated).await;
        Ok(updated)
    }

    pub async fn get(&self, task_id: Uuid) -> Option<Task> {
        if let Some(task) = self.tasks.read().await.get(&task_id) {
            return Some(task.clone());
        }
        match &self.repo {
            Some(repo) => repo.find_task(task_id).await.unwrap_or_else(|e| {
                warn!(task_id = %task_id, "Task lookup failed: {}", e);
                None
            }),
            None => None,
        }
    }

    /// Ordered backlog snapshot for one agent.
    pub async fn pending_for(&self, agent: &str) -> Vec<Task> {
        let ids: Vec<Uuid> = self
            .backlog
            .read()
            .await
            .get(agent)
            .cloned()
            .unwrap_or_default();
        let tasks = self.tasks.read().await;
        ids.iter().filter_map(|id| tasks.get(id).cloned()).collect()
    }

    /// Remove one backlog entry. Idempotent.
    pub async fn remove_pending(&self, agent: &str, task_id: Uuid) {
        {
            let mut backlog = self.backlog.write().await;
            if let Some(queue) = backlog.get_mut(agent) {
                queue.retain(|id| *id != task_id);
                if queue.is_empty() {
                    backlog.remove(agent);
                }
            }
        }
        if let Some(repo) = &self.repo {
            if let Err(e) = repo.remove_pending(agent, task_id).await {
                warn!(task_id = %task_id, "Failed to remove persisted backlog entry: {}", e);
            }
        }
    }

    /// All tasks of a conversation ordered by creation time then id; the
    /// ordering is stable across persistence round-trips.
    pub async fn by_conversation(&self, conversation_id: Uuid) -> Vec<Task> {
        let mut chain: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.conversation_id == conversation_id)
            .cloned()
            .collect();

        if let Some(repo) = &self.repo {
            match repo.load_conversation(conversation_id).await {
                Ok(stored) => {
                    for task in stored {
                        if !chain.iter().any(|t| t.task_id == task.task_id) {
                            chain.push(task);
                        }
                    }
                }
                Err(e) => warn!(conversation = %conversation_id, "Conversation load failed: {}", e),
            }
        }

        chain.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        chain
    }

    pub async fn find_by_result_message(&self, message_id: i32) -> Option<Task> {
        let indexed = { self.by_result_msg.read().await.get(&message_id).copied() };
        if let Some(task_id) = indexed {
            if let Some(task) = self.tasks.read().await.get(&task_id) {
                return Some(task.clone());
            }
        }
        match &self.repo {
            Some(repo) => repo
                .find_by_result_message(message_id)
                .await
                .unwrap_or_else(|e| {
                    warn!(message_id, "Result-message lookup failed: {}", e);
                    None
                }),
            None => None,
        }
    }

    /// Index the chat message that carried a task's result so replies to it
    /// can continue the conversation.
    pub async fn set_result_message(&self, task_id: Uuid, message_id: i32) {
        let updated = {
            let mut tasks = self.tasks.write().await;
            match tasks.get_mut(&task_id) {
                Some(task) => {
                    task.result_message_id = Some(message_id);
                    Some(task.clone())
                }
                None => None,
            }
        };
        self.by_result_msg.write().await.insert(message_id, task_id);
        if let Some(task) = updated {
            self.persist_update(&task).await;
        } else if let Some(repo) = &self.repo {
            // Terminal tasks may already be evicted from memory; patch the row.
            if let Ok(Some(mut task)) = repo.find_task(task_id).await {
                task.result_message_id = Some(message_id);
                if let Err(e) = repo.update_task(&task).await {
                    warn!(task_id = %task_id, "Failed to persist result message id: {}", e);
                }
            }
        }
    }

    /// Back-fill the origin chat anchor for an API-created task once the
    /// adapter has posted its approval bubble.
    pub async fn update_chat_info(&self, task_id: Uuid, chat_id: i64, message_id: i32) {
        let updated = {
            let mut tasks = self.tasks.write().await;
            match tasks.get_mut(&task_id) {
                Some(task) => {
                    task.chat_id = chat_id;
                    task.message_id = message_id;
                    Some(task.clone())
                }
                None => None,
            }
        };
        if let Some(task) = updated {
            self.persist_update(&task).await;
        }
    }

    /// Take a task's attachments for dispatch, clearing the cache entry.
    pub async fn take_attachments(&self, task_id: Uuid) -> Vec<Attachment> {
        self.attachments
            .write()
            .await
            .remove(&task_id)
            .unwrap_or_default()
    }

    /// Re-attach payloads after a failed dispatch so the retry can resend them.
    pub async fn put_attachments(&self, task_id: Uuid, attachments: Vec<Attachment>) {
        if !attachments.is_empty() {
            self.attachments.write().await.insert(task_id, attachments);
        }
    }

    #[cfg(test)]
    pub async fn has_attachments(&self, task_id: Uuid) -> bool {
        self.attachments.read().await.contains_key(&task_id)
    }

    pub async fn find_recent(&self, agent: Option<&str>, limit: u32) -> Vec<Task> {
        let limit = limit.min(20);
        if let Some(repo) = &self.repo {
            match repo.find_recent(agent, limit).await {
                Ok(tasks) => return tasks,
                Err(e) => warn!("Recent-task query failed, using memory: {}", e),
            }
        }
        let tasks = self.tasks.read().await;
        let mut recent: Vec<Task> = tasks
            .values()
            .filter(|t| agent.map_or(true, |a| t.to == a))
            .cloned()
            .collect();
        recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        recent.truncate(limit as usize);
        recent
    }

    pub async fn close_conversation(&self, conversation_id: Uuid) {
        let mut conversations = self.conversations.write().await;
        let entry = conversations
            .entry(conversation_id)
            .or_insert(ConversationState {
                turn_count: 0,
                last_active_at: Utc::now(),
                closed: false,
            });
        entry.closed = true;
    }

    pub async fn is_closed(&self, conversation_id: Uuid) -> bool {
        self.conversations
            .read()
            .await
            .get(&conversation_id)
            .map(|c| c.closed)
            .unwrap_or(false)
    }

    pub async fn turn_count(&self, conversation_id: Uuid) -> u32 {
        self.conversations
            .read()
            .await
            .get(&conversation_id)
            .map(|c| c.turn_count)
            .unwrap_or(0)
    }

    /// One sweep: close conversations idle past the threshold, returning the
    /// last task of each newly closed conversation (for the timeout notice).
    pub async fn sweep_idle_once(&self, idle: Duration) -> Vec<Task> {
        let cutoff = Utc::now() - chrono::Duration::from_std(idle).unwrap_or_default();
        let expired: Vec<Uuid> = {
            let mut conversations = self.conversations.write().await;
            conversations
                .iter_mut()
                .filter(|(_, state)| !state.closed && state.last_active_at < cutoff)
                .map(|(id, state)| {
                    state.closed = true;
                    *id
                })
                .collect()
        };

        let mut closed_tails = Vec::new();
        for conversation_id in expired {
            info!(conversation = %conversation_id, "Closing idle conversation");
            if let Some(last) = self.by_conversation(conversation_id).await.into_iter().last() {
                closed_tails.push(last);
            }
        }
        closed_tails
    }

    /// Periodic conversation sweeper. Newly closed conversations' last tasks
    /// are sent on `notify` so the chat adapter can post a timeout notice.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        idle: Duration,
        tick: Duration,
        notify: mpsc::Sender<Task>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.cancelled() => break,
                }
                for task in store.sweep_idle_once(idle).await {
                    if notify.send(task).await.is_err() {
                        return;
                    }
                }
            }
        })
    }

    async fn persist_update(&self, task: &Task) {
        if let Some(repo) = &self.repo {
            if let Err(e) = repo.update_task(task).await {
                warn!(task_id = %task.task_id, "Failed to persist task update: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MAX_ATTACHMENT_BYTES;

    fn store() -> TaskStore {
        TaskStore::new(None)
    }

    fn new_task(to: &str) -> NewTask {
        NewTask {
            from: "bob".into(),
            to: to.into(),
            content: "ping".into(),
            chat_id: 42,
            message_id: 7,
            conversation_id: None,
            parent_task_id: None,
        }
    }

    #[tokio::test]
    async fn create_assigns_ids_and_enqueues() {
        let store = store();
        let task = store.create_task(new_task("alice"), Vec::new()).await;

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.chat_id, 42);
        assert_eq!(store.turn_count(task.conversation_id).await, 1);

        let pending = store.pending_for("alice").await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_id, task.task_id);
    }

    #[tokio::test]
    async fn approval_flow_transitions() {
        let store = store();
        let task = store.create_task(new_task("alice"), Vec::new()).await;

        store
            .update_status(task.task_id, TaskStatus::AwaitingApproval, None)
            .await
            .unwrap();
        store
            .update_status(task.task_id, TaskStatus::Approved, None)
            .await
            .unwrap();
        store
            .update_status(task.task_id, TaskStatus::Running, None)
            .await
            .unwrap();
        let done = store
            .update_status(task.task_id, TaskStatus::Completed, Some("pong".into()))
            .await
            .unwrap();

        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result.as_deref(), Some("pong"));
        assert!(done.completed_at.is_some());
        assert!(store.pending_for("alice").await.is_empty());
    }

    #[tokio::test]
    async fn illegal_transitions_rejected() {
        let store = store();
        let task = store.create_task(new_task("alice"), Vec::new()).await;

        // pending cannot jump straight to running.
        assert!(store
            .update_status(task.task_id, TaskStatus::Running, None)
            .await
            .is_err());

        store
            .update_status(task.task_id, TaskStatus::AwaitingApproval, None)
            .await
            .unwrap();
        // awaiting_approval can only approve or reject.
        assert!(store
            .update_status(task.task_id, TaskStatus::Cancelled, None)
            .await
            .is_err());
        let rejected = store
            .update_status(task.task_id, TaskStatus::Rejected, None)
            .await
            .unwrap();
        // rejected carries no completed_at.
        assert!(rejected.completed_at.is_none());

        // Terminal is absorbing.
        assert!(store
            .update_status(task.task_id, TaskStatus::Approved, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn terminal_update_is_idempotent() {
        let store = store();
        let task = store.create_task(new_task("alice"), Vec::new()).await;
        store
            .update_status(task.task_id, TaskStatus::Approved, None)
            .await
            .unwrap();
        store
            .update_status(task.task_id, TaskStatus::Running, None)
            .await
            .unwrap();

        let first = store
            .update_status(task.task_id, TaskStatus::Completed, Some("x".into()))
            .await
            .unwrap();
        let second = store
            .update_status(task.task_id, TaskStatus::Completed, Some("y".into()))
            .await
            .unwrap();

        // The duplicate terminal report changes nothing.
        assert_eq!(second.result.as_deref(), Some("x"));
        assert_eq!(second.completed_at, first.completed_at);
    }

    #[tokio::test]
    async fn cancel_before_run_and_while_running() {
        let store = store();
        let t1 = store.create_task(new_task("alice"), Vec::new()).await;
        store
            .update_status(t1.task_id, TaskStatus::Approved, None)
            .await
            .unwrap();
        let cancelled = store
            .update_status(t1.task_id, TaskStatus::Cancelled, None)
            .await
            .unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());

        let t2 = store.create_task(new_task("alice"), Vec::new()).await;
        store
            .update_status(t2.task_id, TaskStatus::Approved, None)
            .await
            .unwrap();
        store
            .update_status(t2.task_id, TaskStatus::Running, None)
            .await
            .unwrap();
        store
            .update_status(t2.task_id, TaskStatus::Cancelled, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn backlog_is_fifo_and_removal_idempotent() {
        let store = store();
        let t1 = store.create_task(new_task("carol"), Vec::new()).await;
        let t2 = store.create_task(new_task("carol"), Vec::new()).await;
        let t3 = store.create_task(new_task("carol"), Vec::new()).await;

        let ids: Vec<Uuid> = store
            .pending_for("carol")
            .await
            .iter()
            .map(|t| t.task_id)
            .collect();
        assert_eq!(ids, vec![t1.task_id, t2.task_id, t3.task_id]);

        store.remove_pending("carol", t2.task_id).await;
        store.remove_pending("carol", t2.task_id).await;
        let ids: Vec<Uuid> = store
            .pending_for("carol")
            .await
            .iter()
            .map(|t| t.task_id)
            .collect();
        assert_eq!(ids, vec![t1.task_id, t3.task_id]);
    }

    #[tokio::test]
    async fn conversation_chain_is_ordered() {
        let store = store();
        let t1 = store.create_task(new_task("alice"), Vec::new()).await;

        let t2 = store
            .create_task(
                NewTask {
                    conversation_id: Some(t1.conversation_id),
                    parent_task_id: Some(t1.task_id),
                    ..new_task("alice")
                },
                Vec::new(),
            )
            .await;

        let chain = store.by_conversation(t1.conversation_id).await;
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].task_id, t1.task_id);
        assert_eq!(chain[1].task_id, t2.task_id);
        assert_eq!(chain[1].parent_task_id, Some(t1.task_id));
        assert_eq!(store.turn_count(t1.conversation_id).await, 2);
    }

    #[tokio::test]
    async fn result_message_resolves_parent() {
        let store = store();
        let task = store.create_task(new_task("alice"), Vec::new()).await;
        store.set_result_message(task.task_id, 500).await;

        let found = store.find_by_result_message(500).await.unwrap();
        assert_eq!(found.task_id, task.task_id);
        assert_eq!(found.result_message_id, Some(500));
        assert!(store.find_by_result_message(501).await.is_none());
    }

    #[tokio::test]
    async fn chat_info_backfill() {
        let store = store();
        let task = store
            .create_task(
                NewTask {
                    chat_id: 0,
                    message_id: 0,
                    ..new_task("alice")
                },
                Vec::new(),
            )
            .await;

        store.update_chat_info(task.task_id, -100555, 12).await;
        let task = store.get(task.task_id).await.unwrap();
        assert_eq!(task.chat_id, -100555);
        assert_eq!(task.message_id, 12);
    }

    #[tokio::test]
    async fn attachments_cleared_on_dispatch_and_terminal() {
        let store = store();
        let attachment =
            Attachment::new("notes.txt", "text/plain", b"hello".to_vec()).unwrap();
        assert!(attachment.size <= MAX_ATTACHMENT_BYTES);

        let t1 = store
            .create_task(new_task("alice"), vec![attachment.clone()])
            .await;
        let taken = store.take_attachments(t1.task_id).await;
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].filename, "notes.txt");
        assert!(!store.has_attachments(t1.task_id).await);

        let t2 = store.create_task(new_task("alice"), vec![attachment]).await;
        store
            .update_status(t2.task_id, TaskStatus::AwaitingApproval, None)
            .await
            .unwrap();
        store
            .update_status(t2.task_id, TaskStatus::Rejected, None)
            .await
            .unwrap();
        assert!(!store.has_attachments(t2.task_id).await);
    }

    #[tokio::test]
    async fn closed_conversations_stay_closed() {
        let store = store();
        let task = store.create_task(new_task("alice"), Vec::new()).await;
        assert!(!store.is_closed(task.conversation_id).await);

        store.close_conversation(task.conversation_id).await;
        assert!(store.is_closed(task.conversation_id).await);

        // Unknown conversations read as open.
        assert!(!store.is_closed(Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn sweeper_closes_idle_conversations() {
        let store = store();
        let stale = store.create_task(new_task("alice"), Vec::new()).await;
        let fresh = store.create_task(new_task("bob"), Vec::new()).await;

        // Age the first conversation past the threshold.
        {
            let mut conversations = store.conversations.write().await;
            conversations
                .get_mut(&stale.conversation_id)
                .unwrap()
                .last_active_at = Utc::now() - chrono::Duration::minutes(31);
        }

        let closed = store.sweep_idle_once(Duration::from_secs(30 * 60)).await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].task_id, stale.task_id);
        assert!(store.is_closed(stale.conversation_id).await);
        assert!(!store.is_closed(fresh.conversation_id).await);

        // Already-closed conversations are not reported again.
        assert!(store
            .sweep_idle_once(Duration::from_secs(30 * 60))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn find_recent_in_memory_caps_at_twenty() {
        let store = store();
        for _ in 0..25 {
            store.create_task(new_task("alice"), Vec::new()).await;
        }
        assert_eq!(store.find_recent(None, 100).await.len(), 20);
        assert_eq!(store.find_recent(Some("alice"), 3).await.len(), 3);
        assert!(store.find_recent(Some("nobody"), 10).await.is_empty());
    }
}
