use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Max size of a single inline attachment (5 MiB).
pub const MAX_ATTACHMENT_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    AwaitingApproval,
    Approved,
    Running,
    Completed,
    Failed,
    Rejected,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Rejected | TaskStatus::Cancelled
        )
    }

    /// Whether `self -> next` is a legal edge of the task state machine.
    ///
    /// pending -> awaiting_approval | approved (auto-approve)
    /// awaiting_approval -> approved | rejected
    /// approved -> running | cancelled (cancel before run)
    /// running -> completed | failed | cancelled
    pub fn can_transition(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, AwaitingApproval)
                | (Pending, Approved)
                | (AwaitingApproval, Approved)
                | (AwaitingApproval, Rejected)
                | (Approved, Running)
                | (Approved, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::AwaitingApproval => "awaiting_approval",
            TaskStatus::Approved => "approved",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Rejected => "rejected",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<TaskStatus> {
        Some(match raw {
            "pending" => TaskStatus::Pending,
            "awaiting_approval" => TaskStatus::AwaitingApproval,
            "approved" => TaskStatus::Approved,
            "running" => TaskStatus::Running,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "rejected" => TaskStatus::Rejected,
            "cancelled" => TaskStatus::Cancelled,
            _ => return None,
        })
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single executable request, owned by the task store and persisted on
/// every transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    /// Free-form requester label (chat display name or API caller identity).
    pub from: String,
    /// Target agent name.
    pub to: String,
    pub content: String,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Origin chat anchor. 0 for API-created tasks pending back-fill.
    pub chat_id: i64,
    pub message_id: i32,
    pub conversation_id: Uuid,
    pub parent_task_id: Option<Uuid>,
    /// Chat message that carried the result; resolves reply continuations.
    pub result_message_id: Option<i32>,
}

/// Agent credential: the durable identity behind a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub agent_name: String,
    pub token: String,
    pub owner_id: u64,
    pub created_at: DateTime<Utc>,
}

/// Snapshot of a live agent connection.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub name: String,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub owner_id: Option<u64>,
}

/// In-memory attachment riding along with a task until dispatch.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub data: Vec<u8>,
    pub size: usize,
}

impl Attachment {
    pub fn new(filename: &str, mime_type: &str, data: Vec<u8>) -> anyhow::Result<Self> {
        if data.len() > MAX_ATTACHMENT_BYTES {
            anyhow::bail!(
                "attachment too large ({:.1} MB, max {} MB)",
                data.len() as f64 / 1_048_576.0,
                MAX_ATTACHMENT_BYTES / 1_048_576
            );
        }
        let size = data.len();
        Ok(Self {
            filename: sanitize_filename(filename),
            mime_type: mime_type.to_string(),
            data,
            size,
        })
    }
}

/// Sanitize a filename: remove path separators, null bytes, and limit length.
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .filter(|c| *c != '/' && *c != '\\' && *c != '\0')
        .collect();
    let sanitized = sanitized.trim_start_matches('.').to_string();
    let sanitized = if sanitized.is_empty() {
        "file".to_string()
    } else {
        sanitized
    };
    if sanitized.len() <= 200 {
        sanitized
    } else if let Some(dot_pos) = sanitized.rfind('.') {
        let ext = &sanitized[dot_pos..];
        if ext.len() < 20 {
            let stem_len = 200 - ext.len();
            format!("{}{}", &sanitized[..stem_len], ext)
        } else {
            sanitized[..200].to_string()
        }
    } else {
        sanitized[..200].to_string()
    }
}

/// Whether a name is acceptable as an agent identity: ASCII word, 1-64 chars.
pub fn valid_agent_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}
