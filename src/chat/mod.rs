//! Telegram adapter: parses inbound chat events, drives the task state
//! machine through approval and dispatch, renders results, and maintains the
//! pinned status panel.

pub mod formatting;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use teloxide::prelude::*;
use teloxide::types::{
    InlineKeyboardButton, InlineKeyboardMarkup, MaybeInaccessibleMessage, MessageId, ReplyParameters,
    Update, UpdateKind,
};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::PanelRepo;
use crate::gateway::{Gateway, GatewayEvent};
use crate::registry::Registry;
use crate::status::AgentStatusCache;
use crate::store::{NewTask, TaskStore};
use crate::types::{valid_agent_name, Attachment, Task, TaskStatus, MAX_ATTACHMENT_BYTES};

use formatting::{paginate, render_markdown, to_entities, Page, PAGE_CHARS};

/// Minimum interval between edits of one progress message.
const PROGRESS_DEBOUNCE: Duration = Duration::from_secs(3);
/// Minimum interval between edits of one status panel.
const PANEL_DEBOUNCE: Duration = Duration::from_secs(2);
/// Rendered results kept around for pagination callbacks.
const MAX_CACHED_RESULTS: usize = 100;

struct ProgressSlot {
    chat_id: i64,
    reply_to: Option<i32>,
    message_id: Option<i32>,
    last_update: Instant,
}

struct RenderedResult {
    pages: Vec<Page>,
    conversation_id: Uuid,
}

struct PanelState {
    message_id: i32,
    last_edit: Option<Instant>,
}

pub struct ChatAdapter {
    bot: Bot,
    bot_token: String,
    registry: Arc<Registry>,
    store: Arc<TaskStore>,
    status: Arc<AgentStatusCache>,
    gateway: Arc<Gateway>,
    panel_repo: Option<Arc<dyn PanelRepo>>,
    public_url: Option<String>,
    default_chat_id: Option<i64>,
    bot_username: RwLock<Option<String>>,
    /// First group chat the bot has seen activity in; API-task approval
    /// bubbles and agent notices land here.
    active_group: RwLock<Option<i64>>,
    progress: Mutex<HashMap<Uuid, ProgressSlot>>,
    results: Mutex<HashMap<Uuid, RenderedResult>>,
    result_order: Mutex<VecDeque<Uuid>>,
    panels: Mutex<HashMap<i64, PanelState>>,
}

impl ChatAdapter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bot_token: &str,
        registry: Arc<Registry>,
        store: Arc<TaskStore>,
        status: Arc<AgentStatusCache>,
        gateway: Arc<Gateway>,
        panel_repo: Option<Arc<dyn PanelRepo>>,
        public_url: Option<String>,
        default_chat_id: Option<i64>,
    ) -> Self {
        Self {
            bot: Bot::new(bot_token),
            bot_token: bot_token.to_string(),
            registry,
            store,
            status,
            gateway,
            panel_repo,
            public_url,
            default_chat_id,
            bot_username: RwLock::new(None),
            active_group: RwLock::new(None),
            progress: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
            result_order: Mutex::new(VecDeque::new()),
            panels: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the bot's own handle and reload persisted panel pointers so a
    /// restart edits the same pinned messages instead of orphaning them.
    pub async fn init(&self) {
        match self.bot.get_me().await {
            Ok(me) => {
                let username = me.username().to_string();
                info!(bot = %username, "Resolved bot identity");
                *self.bot_username.write().await = Some(username);
            }
            Err(e) => warn!("Failed to resolve bot identity: {}", e),
        }

        if let Some(repo) = &self.panel_repo {
            match repo.load_panels().await {
                Ok(panels) => {
                    let mut map = self.panels.lock().await;
                    for (chat_id, message_id) in panels {
                        map.insert(
                            chat_id,
                            PanelState {
                                message_id,
                                last_edit: None,
                            },
                        );
                    }
                    if !map.is_empty() {
                        info!(count = map.len(), "Reloaded status panel pointers");
                    }
                }
                Err(e) => warn!("Failed to reload panel pointers: {}", e),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound updates
    // -----------------------------------------------------------------------

    /// Entry point for webhook-delivered updates; polling mode routes through
    /// the same handlers.
    pub async fn handle_update(&self, update: Update) {
        match update.kind {
            UpdateKind::Message(msg) => self.handle_message(msg).await,
            UpdateKind::CallbackQuery(q) => self.handle_callback(q).await,
            _ => {}
        }
    }

    async fn handle_message(&self, msg: Message) {
        let Some(user) = msg.from.clone() else {
            return;
        };
        let sender_id = user.id.0;
        let sender_label = user
            .username
            .clone()
            .map(|u| format!("@{}", u))
            .unwrap_or_else(|| user.first_name.clone());

        if msg.chat.is_group() || msg.chat.is_supergroup() {
            let mut group = self.active_group.write().await;
            if group.is_none() {
                info!(chat_id = msg.chat.id.0, "Tracking active group chat");
                *group = Some(msg.chat.id.0);
            }
        }

        let text = msg.text().or_else(|| msg.caption()).unwrap_or("").to_string();

        if text.starts_with('/') {
            self.handle_command(&text, &msg, sender_id).await;
            return;
        }

        // Reply to a previous result: conversation continuation.
        if let Some(reply) = msg.reply_to_message() {
            if let Some(parent) = self.store.find_by_result_message(reply.id.0).await {
                self.continue_conversation(&msg, parent, &sender_label, &text)
                    .await;
                return;
            }
        }

        let bot_username = self.bot_username.read().await.clone();
        let Some((target, content)) = parse_mention(&text, bot_username.as_deref()) else {
            return;
        };

        // Media with caption rides along as an inline attachment.
        let attachments = match self.extract_attachment(&msg).await {
            Ok(list) => list,
            Err(e) => {
                self.reply_to(&msg, &format!("❌ 附件处理失败: {}", e)).await;
                return;
            }
        };

        self.dispatch_new_task(&msg, sender_id, &sender_label, &target, &content, attachments)
            .await;
    }

    /// The mention flow of §dispatch: create, gate on approval, deliver.
    async fn dispatch_new_task(
        &self,
        msg: &Message,
        sender_id: u64,
        sender_label: &str,
        target: &str,
        content: &str,
        attachments: Vec<Attachment>,
    ) {
        if !self.registry.agent_exists(target).await {
            self.reply_to(msg, &format!("❌ 未知 Agent: @{}", target)).await;
            return;
        }

        let task = self
            .store
            .create_task(
                NewTask {
                    from: sender_label.to_string(),
                    to: target.to_string(),
                    content: content.to_string(),
                    chat_id: msg.chat.id.0,
                    message_id: msg.id.0,
                    conversation_id: None,
                    parent_task_id: None,
                },
                attachments,
            )
            .await;

        let owner = self.registry.owner_of(target).await;

        if owner == Some(sender_id) {
            // Auto-approve: the requester owns the target agent.
            let Ok(task) = self
                .store
                .update_status(task.task_id, TaskStatus::Approved, None)
                .await
            else {
                return;
            };
            if self.gateway.dispatch_task(&task).await {
                self.reply_to(msg, &format!("✅ 已派发给 @{}", target)).await;
            } else {
                self.reply_to(msg, &format!("📦 @{} 离线，任务已加入队列", target))
                    .await;
            }
            return;
        }

        if self
            .store
            .update_status(task.task_id, TaskStatus::AwaitingApproval, None)
            .await
            .is_err()
        {
            return;
        }

        let prompt = format!(
            "📨 任务审批请求\n来自: {}\n目标: @{}\n内容: {}",
            sender_label,
            target,
            truncate(content, 300)
        );
        let keyboard = approval_keyboard(task.task_id);

        // Prompt the owner privately; fall back to the originating chat.
        let delivered = match owner {
            Some(owner_id) => self
                .bot
                .send_message(ChatId(owner_id as i64), &prompt)
                .reply_markup(keyboard.clone())
                .await
                .is_ok(),
            None => false,
        };
        if !delivered {
            let _ = self
                .bot
                .send_message(msg.chat.id, &prompt)
                .reply_markup(keyboard)
                .reply_parameters(ReplyParameters::new(msg.id))
                .await;
        } else {
            self.reply_to(msg, &format!("⏳ 已发送审批请求给 @{} 的主人", target))
                .await;
        }
    }

    async fn continue_conversation(
        &self,
        msg: &Message,
        parent: Task,
        sender_label: &str,
        content: &str,
    ) {
        if content.trim().is_empty() {
            return;
        }
        if self.store.is_closed(parent.conversation_id).await {
            self.reply_to(msg, "⚠️ 对话已结束，无法继续。请发起新任务。").await;
            return;
        }

        let attachments = match self.extract_attachment(msg).await {
            Ok(list) => list,
            Err(e) => {
                self.reply_to(msg, &format!("❌ 附件处理失败: {}", e)).await;
                return;
            }
        };

        let task = self
            .store
            .create_task(
                NewTask {
                    from: sender_label.to_string(),
                    to: parent.to.clone(),
                    content: content.to_string(),
                    chat_id: msg.chat.id.0,
                    message_id: msg.id.0,
                    conversation_id: Some(parent.conversation_id),
                    parent_task_id: Some(parent.task_id),
                },
                attachments,
            )
            .await;

        // Continuations inherit the original approval.
        let Ok(task) = self
            .store
            .update_status(task.task_id, TaskStatus::Approved, None)
            .await
        else {
            return;
        };

        let turn = self.store.turn_count(task.conversation_id).await;
        if !self.gateway.dispatch_task(&task).await {
            self.reply_to(msg, &format!("📦 @{} 离线，任务已加入队列", task.to))
                .await;
            return;
        }
        self.reply_to(msg, &format!("💬 对话 #{} → {}", turn, task.to))
            .await;
    }

    // -----------------------------------------------------------------------
    // Interactive callbacks
    // -----------------------------------------------------------------------

    async fn handle_callback(&self, q: CallbackQuery) {
        let Some(data) = q.data.clone() else { return };
        let clicker = q.from.id.0;

        let anchor = match &q.message {
            Some(MaybeInaccessibleMessage::Regular(m)) => Some((m.chat.id, m.id)),
            _ => None,
        };

        let mut parts = data.splitn(3, ':');
        let verb = parts.next().unwrap_or("");
        match verb {
            "approve" | "reject" => {
                let Some(task_id) = parts.next().and_then(|s| s.parse().ok()) else {
                    return;
                };
                let answer = self
                    .handle_approval(task_id, clicker, verb == "approve", anchor)
                    .await;
                let _ = self.bot.answer_callback_query(q.id).text(answer).await;
            }
            "endconv" => {
                let Some(conversation_id) = parts.next().and_then(|s| s.parse().ok()) else {
                    return;
                };
                self.store.close_conversation(conversation_id).await;
                let _ = self.bot.answer_callback_query(q.id).text("对话已结束").await;
                if let Some((chat_id, message_id)) = anchor {
                    let _ = self
                        .bot
                        .edit_message_reply_markup(chat_id, message_id)
                        .await;
                }
            }
            "page" => {
                let task_id: Option<Uuid> = parts.next().and_then(|s| s.parse().ok());
                let index: Option<usize> = parts.next().and_then(|s| s.parse().ok());
                if let (Some(task_id), Some(index), Some((chat_id, message_id))) =
                    (task_id, index, anchor)
                {
                    self.show_result_page(task_id, index, chat_id, message_id).await;
                }
                let _ = self.bot.answer_callback_query(q.id).await;
            }
            _ => {}
        }
    }

    /// Gate and apply an approval decision; the returned string is shown to
    /// the clicker as the callback answer.
    async fn handle_approval(
        &self,
        task_id: Uuid,
        clicker: u64,
        approve: bool,
        anchor: Option<(ChatId, MessageId)>,
    ) -> String {
        let Some(task) = self.store.get(task_id).await else {
            return "任务不存在".to_string();
        };
        if task.status != TaskStatus::AwaitingApproval {
            return "任务已处理".to_string();
        }
        if let Some(owner) = self.registry.owner_of(&task.to).await {
            if owner != clicker {
                return "只有 Agent 主人可以审批".to_string();
            }
        }

        let (new_status, label) = if approve {
            (TaskStatus::Approved, "已批准")
        } else {
            (TaskStatus::Rejected, "已拒绝")
        };
        let task = match self.store.update_status(task_id, new_status, None).await {
            Ok(task) => task,
            Err(_) => return "任务已处理".to_string(),
        };

        // Strike the buttons and record the decision on the prompt message.
        if let Some((chat_id, message_id)) = anchor {
            let _ = self
                .bot
                .edit_message_text(
                    chat_id,
                    message_id,
                    format!("📨 任务审批 — {}\n目标: @{}", label, task.to),
                )
                .await;
        }

        if approve {
            self.gateway.dispatch_task(&task).await;
        } else if task.chat_id != 0 {
            let _ = self
                .bot
                .send_message(
                    ChatId(task.chat_id),
                    format!("❌ 任务已被拒绝: @{}", task.to),
                )
                .await;
        }
        label.to_string()
    }

    async fn show_result_page(
        &self,
        task_id: Uuid,
        index: usize,
        chat_id: ChatId,
        message_id: MessageId,
    ) {
        let (page, keyboard) = {
            let results = self.results.lock().await;
            let Some(cached) = results.get(&task_id) else {
                return;
            };
            let index = index.min(cached.pages.len().saturating_sub(1));
            (
                cached.pages[index].clone(),
                page_keyboard(task_id, index, cached.pages.len(), cached.conversation_id),
            )
        };

        let entities = to_entities(&page);
        let mut request = self
            .bot
            .edit_message_text(chat_id, message_id, page.text.clone())
            .reply_markup(keyboard.clone());
        if !entities.is_empty() {
            request = request.entities(entities);
        }
        if let Err(e) = request.await {
            warn!("Page edit with entities failed, retrying plain: {}", e);
            let _ = self
                .bot
                .edit_message_text(chat_id, message_id, page.text)
                .reply_markup(keyboard)
                .await;
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn handle_command(&self, text: &str, msg: &Message, sender_id: u64) {
        let mut parts = text.splitn(2, char::is_whitespace);
        let cmd = parts
            .next()
            .unwrap_or("")
            .split('@')
            .next()
            .unwrap_or("");
        let arg = parts.next().map(str::trim).unwrap_or("");

        match cmd {
            "/start" | "/help" => {
                self.reply_to(msg, HELP_TEXT).await;
            }
            "/register" => {
                self.cmd_register(msg, sender_id, arg).await;
            }
            "/token" => {
                if arg == "refresh" {
                    self.cmd_token_refresh(msg, sender_id).await;
                } else {
                    self.reply_to(msg, "用法: /token refresh").await;
                }
            }
            "/unregister" => {
                if arg.is_empty() {
                    self.reply_to(msg, "用法: /unregister <agent名称>").await;
                } else if self.registry.revoke(arg, sender_id).await {
                    self.reply_to(msg, &format!("✅ 已注销 Agent: {}", arg)).await;
                } else {
                    self.reply_to(msg, "只有 Agent 主人可以注销").await;
                }
            }
            "/agents" => {
                let text = self.agents_digest().await;
                self.reply_to(msg, &text).await;
            }
            "/cancel" => {
                let reply = match arg.parse::<Uuid>() {
                    Ok(task_id) => self.cancel_task(task_id).await,
                    Err(_) => "用法: /cancel <任务ID>".to_string(),
                };
                self.reply_to(msg, &reply).await;
            }
            "/recent" => {
                let agent = (!arg.is_empty()).then_some(arg);
                let text = self.recent_digest(agent).await;
                self.reply_to(msg, &text).await;
            }
            _ => {
                self.reply_to(msg, "未知命令，/help 查看用法").await;
            }
        }
    }

    async fn cmd_register(&self, msg: &Message, sender_id: u64, arg: &str) {
        let name = arg.trim_start_matches('@');
        if !valid_agent_name(name) {
            self.reply_to(msg, "用法: /register <agent名称>（字母、数字、下划线）")
                .await;
            return;
        }
        if let Some(owner) = self.registry.owner_of(name).await {
            if owner != sender_id {
                self.reply_to(msg, &format!("❌ 名称 {} 已被注册", name)).await;
                return;
            }
        }

        let cred = self.registry.issue_token(name, sender_id).await;
        let ws_url = self.ws_url();
        let private = format!(
            "🤖 Agent {} 已注册\n\ntoken: {}\n连接地址: {}\n\n请妥善保管 token。",
            name, cred.token, ws_url
        );
        // Tokens go to the owner privately, never into a group.
        if self
            .bot
            .send_message(ChatId(sender_id as i64), private)
            .await
            .is_ok()
        {
            if msg.chat.id.0 != sender_id as i64 {
                self.reply_to(msg, "✅ 注册成功，token 已私聊发送").await;
            }
        } else {
            self.reply_to(msg, "⚠️ 无法私聊发送 token，请先与我私聊一次再重试")
                .await;
        }
    }

    async fn cmd_token_refresh(&self, msg: &Message, sender_id: u64) {
        let Some(cred) = self.registry.find_credential_by_owner(sender_id).await else {
            self.reply_to(msg, "你还没有注册 Agent，使用 /register <名称>").await;
            return;
        };
        let Some(rotated) = self.registry.refresh_token(&cred.agent_name, sender_id).await
        else {
            self.reply_to(msg, "只有 Agent 主人可以刷新 token").await;
            return;
        };
        let private = format!(
            "🔄 {} 的 token 已更新\n\n新 token: {}\n旧 token 已失效，Agent 需要使用新 token 重连。",
            rotated.agent_name, rotated.token
        );
        if self
            .bot
            .send_message(ChatId(sender_id as i64), private)
            .await
            .is_ok()
        {
            if msg.chat.id.0 != sender_id as i64 {
                self.reply_to(msg, "✅ token 已更新并私聊发送").await;
            }
        } else {
            self.reply_to(msg, "⚠️ 无法私聊发送 token，请先与我私聊一次再重试")
                .await;
        }
    }

    /// Cancel flow: running tasks online get a `cancel_task` frame and wait
    /// for the agent's ack; otherwise the hub cancels directly when the state
    /// machine allows it.
    async fn cancel_task(&self, task_id: Uuid) -> String {
        let Some(task) = self.store.get(task_id).await else {
            return "任务不存在".to_string();
        };
        if task.status.is_terminal() {
            return format!("任务状态为 {}，无法取消", task.status);
        }

        if task.status == TaskStatus::Running && self.registry.is_online(&task.to).await {
            if self.gateway.send_cancel(&task.to, task_id).await {
                return format!("⏳ 已发送取消请求: {}", task.to);
            }
        }

        match self
            .store
            .update_status(task_id, TaskStatus::Cancelled, None)
            .await
        {
            Ok(task) => format!("任务已取消: {}", task.to),
            Err(_) => format!("任务状态为 {}，无法取消", task.status),
        }
    }

    async fn agents_digest(&self) -> String {
        let online = self.registry.list_online().await;
        if online.is_empty() {
            return "（无在线 Agent）".to_string();
        }
        let mut lines = vec!["🟢 在线 Agent:".to_string()];
        for agent in online {
            let snap = self.status.snapshot(&agent.name).await;
            let current = match snap.current_task_id {
                Some(task_id) => format!(" · 当前 {}", &task_id.to_string()[..8]),
                None => String::new(),
            };
            lines.push(format!(
                "  {} — 运行中 {} · 已完成 {}{}",
                agent.name, snap.running_tasks, snap.completed_count, current
            ));
        }
        lines.join("\n")
    }

    async fn recent_digest(&self, agent: Option<&str>) -> String {
        let tasks = self.store.find_recent(agent, 10).await;
        if tasks.is_empty() {
            return "没有找到任务记录".to_string();
        }
        tasks
            .iter()
            .map(|t| {
                format!(
                    "{} [{}] @{} — {}",
                    &t.task_id.to_string()[..8],
                    t.status,
                    t.to,
                    truncate(&t.content, 40)
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    // -----------------------------------------------------------------------
    // Gateway events
    // -----------------------------------------------------------------------

    /// Main outbound loop: consumes gateway events and sweeper notices until
    /// both channels close.
    pub async fn run_event_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<GatewayEvent>,
        mut swept: mpsc::Receiver<Task>,
    ) {
        loop {
            tokio::select! {
                maybe = events.recv() => {
                    match maybe {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    }
                }
                maybe = swept.recv() => {
                    if let Some(task) = maybe {
                        self.on_conversation_closed(task).await;
                    }
                }
            }
        }
    }

    async fn handle_event(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::AgentOnline { name } => {
                self.notify(&format!("🟢 Agent 上线: {}", name)).await;
                self.refresh_panels().await;
            }
            GatewayEvent::AgentOffline { name } => {
                self.notify(&format!("🔴 Agent 下线: {}", name)).await;
                self.refresh_panels().await;
            }
            GatewayEvent::TaskDispatched { task } => {
                self.allocate_progress_slot(&task).await;
                self.refresh_panels().await;
            }
            GatewayEvent::TaskProgress {
                task_id,
                status,
                detail,
                elapsed_ms,
            } => {
                self.render_progress(task_id, &status, detail.as_deref(), elapsed_ms)
                    .await;
                self.refresh_panels().await;
            }
            GatewayEvent::TaskCompleted { task, success } => {
                self.clear_progress(task.task_id).await;
                self.deliver_result(&task, success).await;
                self.refresh_panels().await;
            }
            GatewayEvent::TaskCancelled { task } => {
                self.clear_progress(task.task_id).await;
                self.notify_task_chat(&task, &format!("任务已取消: {}", task.to))
                    .await;
                self.refresh_panels().await;
            }
        }
    }

    async fn on_conversation_closed(&self, task: Task) {
        self.notify_task_chat(&task, "⏰ 对话空闲超时，已自动结束").await;
    }

    /// API-created task: post the approval bubble to the first known group
    /// (back-filling the task's chat anchor) and ping the owner privately.
    pub async fn on_api_task(&self, task: Task) {
        let prompt = format!(
            "📨 API 任务审批请求\n来自: {}\n目标: @{}\n内容: {}",
            task.from,
            task.to,
            truncate(&task.content, 300)
        );
        let keyboard = approval_keyboard(task.task_id);

        let group = self.group_chat_id().await;
        if let Some(chat_id) = group {
            match self
                .bot
                .send_message(ChatId(chat_id), &prompt)
                .reply_markup(keyboard.clone())
                .await
            {
                Ok(sent) => {
                    self.store
                        .update_chat_info(task.task_id, chat_id, sent.id.0)
                        .await;
                }
                Err(e) => warn!("Failed to post API approval bubble: {}", e),
            }
        }

        if let Some(owner) = self.registry.owner_of(&task.to).await {
            let _ = self
                .bot
                .send_message(ChatId(owner as i64), &prompt)
                .reply_markup(approval_keyboard(task.task_id))
                .await;
        }
    }

    // -----------------------------------------------------------------------
    // Progress messages
    // -----------------------------------------------------------------------

    async fn allocate_progress_slot(&self, task: &Task) {
        let chat_id = match self.resolve_result_chat(task).await {
            Some(id) => id,
            None => return,
        };
        let reply_to = (task.message_id != 0).then_some(task.message_id);
        let mut progress = self.progress.lock().await;
        progress.insert(
            task.task_id,
            ProgressSlot {
                chat_id,
                reply_to,
                message_id: None,
                last_update: Instant::now() - PROGRESS_DEBOUNCE,
            },
        );
    }

    async fn render_progress(
        &self,
        task_id: Uuid,
        status: &str,
        detail: Option<&str>,
        elapsed_ms: u64,
    ) {
        let (chat_id, reply_to, existing) = {
            let mut progress = self.progress.lock().await;
            let Some(slot) = progress.get_mut(&task_id) else {
                return;
            };
            if slot.last_update.elapsed() < PROGRESS_DEBOUNCE {
                return;
            }
            slot.last_update = Instant::now();
            (slot.chat_id, slot.reply_to, slot.message_id)
        };

        let label = progress_label(status, detail, elapsed_ms);

        match existing {
            Some(message_id) => {
                let _ = self
                    .bot
                    .edit_message_text(ChatId(chat_id), MessageId(message_id), label)
                    .await;
            }
            None => {
                let mut request = self.bot.send_message(ChatId(chat_id), label);
                if let Some(reply_to) = reply_to {
                    request = request.reply_parameters(ReplyParameters::new(MessageId(reply_to)));
                }
                if let Ok(sent) = request.await {
                    let mut progress = self.progress.lock().await;
                    if let Some(slot) = progress.get_mut(&task_id) {
                        slot.message_id = Some(sent.id.0);
                    }
                }
            }
        }
    }

    async fn clear_progress(&self, task_id: Uuid) {
        let slot = self.progress.lock().await.remove(&task_id);
        if let Some(slot) = slot {
            if let Some(message_id) = slot.message_id {
                let _ = self
                    .bot
                    .delete_message(ChatId(slot.chat_id), MessageId(message_id))
                    .await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Result rendering
    // -----------------------------------------------------------------------

    async fn deliver_result(&self, task: &Task, success: bool) {
        let Some(chat_id) = self.resolve_result_chat(task).await else {
            warn!(task_id = %task.task_id, "No destination chat for result");
            return;
        };

        let raw = task.result.clone().unwrap_or_default();
        let body = if success {
            raw
        } else {
            format!("❌ 执行失败\n{}", raw)
        };
        let (text, segments) = render_markdown(&body);
        let pages = paginate(&text, &segments, PAGE_CHARS);
        let keyboard = page_keyboard(task.task_id, 0, pages.len(), task.conversation_id);

        let first = &pages[0];
        let entities = to_entities(first);
        let reply_to = (chat_id == task.chat_id && task.message_id != 0).then(|| task.message_id);

        let mut request = self
            .bot
            .send_message(ChatId(chat_id), first.text.clone())
            .reply_markup(keyboard.clone());
        if let Some(reply_to) = reply_to {
            request = request.reply_parameters(ReplyParameters::new(MessageId(reply_to)));
        }
        if !entities.is_empty() {
            request = request.entities(entities);
        }

        let sent = match request.await {
            Ok(sent) => sent,
            Err(e) => {
                // Rich formatting failed; fall back to plain text, same pages.
                warn!("Result send with entities failed, retrying plain: {}", e);
                let mut plain = self
                    .bot
                    .send_message(ChatId(chat_id), first.text.clone())
                    .reply_markup(keyboard);
                if let Some(reply_to) = reply_to {
                    plain = plain.reply_parameters(ReplyParameters::new(MessageId(reply_to)));
                }
                match plain.await {
                    Ok(sent) => sent,
                    Err(e) => {
                        warn!(task_id = %task.task_id, "Failed to deliver result: {}", e);
                        return;
                    }
                }
            }
        };

        // The first page is the anchor for reply continuations.
        self.store.set_result_message(task.task_id, sent.id.0).await;
        self.cache_result(task, pages).await;
    }

    async fn cache_result(&self, task: &Task, pages: Vec<Page>) {
        let mut results = self.results.lock().await;
        let mut order = self.result_order.lock().await;
        let previous = results.insert(
            task.task_id,
            RenderedResult {
                pages,
                conversation_id: task.conversation_id,
            },
        );
        if previous.is_none() {
            order.push_back(task.task_id);
        }
        while order.len() > MAX_CACHED_RESULTS {
            if let Some(evicted) = order.pop_front() {
                results.remove(&evicted);
            }
        }
    }

    /// Destination chat for a task's result: its origin chat, else the
    /// owner's private chat, else the configured default, else the first
    /// known group (API tasks racing their chat back-fill).
    async fn resolve_result_chat(&self, task: &Task) -> Option<i64> {
        if task.chat_id != 0 {
            return Some(task.chat_id);
        }
        if let Some(owner) = self.registry.owner_of(&task.to).await {
            return Some(owner as i64);
        }
        if let Some(default) = self.default_chat_id {
            return Some(default);
        }
        *self.active_group.read().await
    }

    // -----------------------------------------------------------------------
    // Status panel
    // -----------------------------------------------------------------------

    /// Debounced refresh of every known status panel plus the active group.
    async fn refresh_panels(&self) {
        let mut chats: Vec<i64> = self.panels.lock().await.keys().copied().collect();
        if let Some(group) = self.group_chat_id().await {
            if !chats.contains(&group) {
                chats.push(group);
            }
        }
        if chats.is_empty() {
            return;
        }

        let text = self.panel_text().await;
        for chat_id in chats {
            self.update_panel(chat_id, &text).await;
        }
    }

    async fn panel_text(&self) -> String {
        let online = self.registry.list_online().await;
        let mut lines = vec!["📊 Agent 状态".to_string()];
        if online.is_empty() {
            lines.push("（无在线 Agent）".to_string());
        }
        for agent in online {
            let snap = self.status.snapshot(&agent.name).await;
            let state = if snap.running_tasks > 0 {
                format!("运行中 {}", snap.running_tasks)
            } else if let Some(idle_since) = snap.idle_since {
                format!("空闲 (自 {})", idle_since.format("%H:%M"))
            } else {
                "空闲".to_string()
            };
            lines.push(format!(
                "🟢 {} — {} · 已完成 {}",
                agent.name, state, snap.completed_count
            ));
        }
        lines.push(format!(
            "\n更新于 {}",
            chrono::Utc::now().format("%H:%M:%S UTC")
        ));
        lines.join("\n")
    }

    async fn update_panel(&self, chat_id: i64, text: &str) {
        let existing = {
            let mut panels = self.panels.lock().await;
            match panels.get_mut(&chat_id) {
                Some(panel) => {
                    if let Some(last) = panel.last_edit {
                        if last.elapsed() < PANEL_DEBOUNCE {
                            return;
                        }
                    }
                    panel.last_edit = Some(Instant::now());
                    Some(panel.message_id)
                }
                None => None,
            }
        };

        if let Some(message_id) = existing {
            if self
                .bot
                .edit_message_text(ChatId(chat_id), MessageId(message_id), text)
                .await
                .is_ok()
            {
                return;
            }
            // Message gone (deleted or unpinned chat history); fall through
            // and send a fresh panel.
        }

        let Ok(sent) = self.bot.send_message(ChatId(chat_id), text).await else {
            return;
        };
        let _ = self.bot.pin_chat_message(ChatId(chat_id), sent.id).await;
        {
            let mut panels = self.panels.lock().await;
            panels.insert(
                chat_id,
                PanelState {
                    message_id: sent.id.0,
                    last_edit: Some(Instant::now()),
                },
            );
        }
        if let Some(repo) = &self.panel_repo {
            if let Err(e) = repo.save_panel(chat_id, sent.id.0).await {
                warn!(chat_id, "Failed to persist panel pointer: {}", e);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    async fn group_chat_id(&self) -> Option<i64> {
        if let Some(group) = *self.active_group.read().await {
            return Some(group);
        }
        self.default_chat_id
    }

    /// General notice to the active group (or configured default chat).
    async fn notify(&self, text: &str) {
        if let Some(chat_id) = self.group_chat_id().await {
            self.send_text(chat_id, text).await;
        }
    }

    async fn notify_task_chat(&self, task: &Task, text: &str) {
        if let Some(chat_id) = self.resolve_result_chat(task).await {
            self.send_text(chat_id, text).await;
        }
    }

    async fn send_text(&self, chat_id: i64, text: &str) {
        if let Err(e) = self.bot.send_message(ChatId(chat_id), text).await {
            warn!(chat_id, "Failed to send message: {}", e);
        }
    }

    async fn reply_to(&self, msg: &Message, text: &str) {
        if let Err(e) = self
            .bot
            .send_message(msg.chat.id, text)
            .reply_parameters(ReplyParameters::new(msg.id))
            .await
        {
            warn!(chat_id = msg.chat.id.0, "Failed to send reply: {}", e);
        }
    }

    fn ws_url(&self) -> String {
        match &self.public_url {
            Some(url) => {
                let trimmed = url.trim_end_matches('/');
                let ws = trimmed
                    .replacen("https://", "wss://", 1)
                    .replacen("http://", "ws://", 1);
                format!("{}/ws", ws)
            }
            None => "ws://<hub-host>:<port>/ws".to_string(),
        }
    }

    /// Pull a document or photo attachment off the message, enforcing the
    /// inline size ceiling before download.
    async fn extract_attachment(&self, msg: &Message) -> anyhow::Result<Vec<Attachment>> {
        let (file_id, file_size, filename, mime_type) = if let Some(doc) = msg.document() {
            (
                doc.file.id.clone(),
                doc.file.size as u64,
                doc.file_name.clone().unwrap_or_else(|| "document".to_string()),
                doc.mime_type
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
            )
        } else if let Some(photos) = msg.photo() {
            // Last photo in the array is the largest rendition.
            let photo = photos
                .last()
                .ok_or_else(|| anyhow::anyhow!("empty photo array"))?;
            (
                photo.file.id.clone(),
                photo.file.size as u64,
                "photo.jpg".to_string(),
                "image/jpeg".to_string(),
            )
        } else {
            return Ok(Vec::new());
        };

        if file_size > MAX_ATTACHMENT_BYTES as u64 {
            anyhow::bail!(
                "文件过大 ({:.1} MB)，上限 {} MB",
                file_size as f64 / 1_048_576.0,
                MAX_ATTACHMENT_BYTES / 1_048_576
            );
        }

        let file = self.bot.get_file(file_id).await?;
        let url = format!(
            "https://api.telegram.org/file/bot{}/{}",
            self.bot_token, file.path
        );
        let response = reqwest::get(&url).await?;
        if !response.status().is_success() {
            anyhow::bail!("下载失败: HTTP {}", response.status());
        }
        let bytes = response.bytes().await?;
        Ok(vec![Attachment::new(&filename, &mime_type, bytes.to_vec())?])
    }

    // -----------------------------------------------------------------------
    // Polling mode
    // -----------------------------------------------------------------------

    /// Long-polling dispatcher with automatic retry on crash, used when no
    /// public URL is configured. Exponential backoff 5s → 60s, reset after a
    /// stable run.
    pub async fn start_polling_with_retry(self: Arc<Self>) {
        let initial_backoff = Duration::from_secs(5);
        let max_backoff = Duration::from_secs(60);
        let stable_threshold = Duration::from_secs(60);
        let mut backoff = initial_backoff;

        let _ = self.bot.delete_webhook().await;

        loop {
            info!("Starting Telegram long-polling dispatcher");
            let started = Instant::now();
            self.clone().start_polling().await;
            let ran_for = started.elapsed();

            if ran_for >= stable_threshold {
                backoff = initial_backoff;
            }

            warn!(
                backoff_secs = backoff.as_secs(),
                ran_for_secs = ran_for.as_secs(),
                "Telegram dispatcher stopped, restarting"
            );
            tokio::time::sleep(backoff).await;
            backoff = std::cmp::min(backoff * 2, max_backoff);
        }
    }

    async fn start_polling(self: Arc<Self>) {
        let handler = dptree::entry()
            .branch(Update::filter_message().endpoint({
                let adapter = Arc::clone(&self);
                move |msg: Message| {
                    let adapter = Arc::clone(&adapter);
                    async move {
                        adapter.handle_message(msg).await;
                        respond(())
                    }
                }
            }))
            .branch(Update::filter_callback_query().endpoint({
                let adapter = Arc::clone(&self);
                move |q: CallbackQuery| {
                    let adapter = Arc::clone(&adapter);
                    async move {
                        adapter.handle_callback(q).await;
                        respond(())
                    }
                }
            }));

        Dispatcher::builder(self.bot.clone(), handler)
            .build()
            .dispatch()
            .await;
    }

    /// Register the Telegram webhook at `<public_url>/webhook`.
    pub async fn set_webhook(&self, public_url: &str) -> anyhow::Result<()> {
        let url = format!("{}/webhook", public_url.trim_end_matches('/'));
        let parsed = reqwest::Url::parse(&url)
            .map_err(|e| anyhow::anyhow!("invalid HUB_PUBLIC_URL: {}", e))?;
        self.bot.set_webhook(parsed).await?;
        info!(url = %url, "Telegram webhook registered");
        Ok(())
    }
}

const HELP_TEXT: &str = "🤖 Agent 任务路由\n\
    @agent名称 <内容> — 发任务给指定 Agent\n\
    回复结果消息 — 继续该对话\n\n\
    /register <名称> — 注册新 Agent（token 私聊发送）\n\
    /token refresh — 刷新自己的 Agent token\n\
    /unregister <名称> — 注销 Agent\n\
    /agents — 查看在线 Agent\n\
    /cancel <任务ID> — 取消任务\n\
    /recent [agent] — 最近任务\n\
    /help — 本帮助";

/// Parse `@agent content`. When the first mention is the bot's own handle
/// (case-insensitive) it is skipped and the next token becomes the target.
pub fn parse_mention(text: &str, bot_username: Option<&str>) -> Option<(String, String)> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?s)^@(\w+)\s+(.+)$").expect("valid mention regex"));

    let mut rest = text.trim();
    for _ in 0..2 {
        let caps = re.captures(rest)?;
        let target = caps.get(1)?.as_str();
        let content = caps.get(2)?.as_str().trim();
        match bot_username {
            Some(bot) if target.eq_ignore_ascii_case(bot) => {
                // Our own handle: re-parse the remainder.
                rest = content;
            }
            _ => return Some((target.to_string(), content.to_string())),
        }
    }
    None
}

fn progress_label(status: &str, detail: Option<&str>, elapsed_ms: u64) -> String {
    let label = match status {
        "thinking" => "🤔 thinking".to_string(),
        "tool_use" => match detail {
            Some(name) => format!("🔧 tool_use: {}", name),
            None => "🔧 tool_use".to_string(),
        },
        "responding" => "💬 responding".to_string(),
        other => format!("⏳ {}", other),
    };
    format!("{} · {}s", label, elapsed_ms / 1000)
}

fn approval_keyboard(task_id: Uuid) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![
        InlineKeyboardButton::callback("✅ 批准", format!("approve:{}", task_id)),
        InlineKeyboardButton::callback("❌ 拒绝", format!("reject:{}", task_id)),
    ]])
}

/// Pagination keyboard: prev/next as applicable plus the end-conversation
/// button for the task's conversation.
fn page_keyboard(
    task_id: Uuid,
    index: usize,
    page_count: usize,
    conversation_id: Uuid,
) -> InlineKeyboardMarkup {
    let mut nav = Vec::new();
    if index > 0 {
        nav.push(InlineKeyboardButton::callback(
            "⬅️ 上一页",
            format!("page:{}:{}", task_id, index - 1),
        ));
    }
    if index + 1 < page_count {
        nav.push(InlineKeyboardButton::callback(
            "下一页 ➡️",
            format!("page:{}:{}", task_id, index + 1),
        ));
    }

    let mut rows = Vec::new();
    if !nav.is_empty() {
        rows.push(nav);
    }
    rows.push(vec![InlineKeyboardButton::callback(
        "🔚 结束对话",
        format!("endconv:{}", conversation_id),
    )]);
    InlineKeyboardMarkup::new(rows)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}…", cut)
    }
}
