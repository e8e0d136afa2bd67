mod migrations;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::types::{Credential, Task, TaskStatus};

/// Open the SQLite pool and run migrations. `url` accepts a `sqlite:` URL or
/// a bare filesystem path. Migration failure is fatal to startup.
pub async fn open(url: &str) -> anyhow::Result<SqlitePool> {
    let path = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:")).unwrap_or(url);

    let opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(opts)
        .await?;

    set_db_file_permissions(path);
    migrations::migrate(&pool).await?;
    Ok(pool)
}

/// Set restrictive file permissions (0600) on the database and WAL files.
fn set_db_file_permissions(db_path: &str) {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::Permissions::from_mode(0o600);
    if let Err(e) = std::fs::set_permissions(db_path, mode.clone()) {
        tracing::warn!("Failed to set permissions on {}: {}", db_path, e);
    }
    for suffix in &["-wal", "-shm"] {
        let path = format!("{}{}", db_path, suffix);
        if Path::new(&path).exists() {
            if let Err(e) = std::fs::set_permissions(&path, mode.clone()) {
                tracing::warn!("Failed to set permissions on {}: {}", path, e);
            }
        }
    }
}

#[async_trait]
pub trait CredentialRepo: Send + Sync {
    async fn upsert(&self, cred: &Credential) -> anyhow::Result<()>;
    async fn find_by_name(&self, name: &str) -> anyhow::Result<Option<Credential>>;
    async fn delete(&self, name: &str) -> anyhow::Result<()>;
    async fn load_all(&self) -> anyhow::Result<Vec<Credential>>;
}

#[async_trait]
pub trait TaskRepo: Send + Sync {
    async fn upsert_task(&self, task: &Task) -> anyhow::Result<()>;
    async fn update_task(&self, task: &Task) -> anyhow::Result<()>;
    async fn save_pending(&self, agent: &str, task_id: Uuid) -> anyhow::Result<()>;
    async fn remove_pending(&self, agent: &str, task_id: Uuid) -> anyhow::Result<()>;
    /// Non-terminal tasks plus the backlog in stored position order.
    async fn load_open_tasks(&self) -> anyhow::Result<(Vec<Task>, Vec<(String, Uuid)>)>;
    async fn find_recent(&self, agent: Option<&str>, limit: u32) -> anyhow::Result<Vec<Task>>;
    async fn find_task(&self, task_id: Uuid) -> anyhow::Result<Option<Task>>;
    /// Resolve a result message back to the task that produced it.
    async fn find_by_result_message(&self, message_id: i32) -> anyhow::Result<Option<Task>>;
    async fn load_conversation(&self, conversation_id: Uuid) -> anyhow::Result<Vec<Task>>;
}

#[async_trait]
pub trait PanelRepo: Send + Sync {
    async fn save_panel(&self, chat_id: i64, message_id: i32) -> anyhow::Result<()>;
    async fn load_panels(&self) -> anyhow::Result<Vec<(i64, i32)>>;
}

// ---------------------------------------------------------------------------
// SQL repositories
// ---------------------------------------------------------------------------

pub struct SqlCredentialRepo {
    pool: SqlitePool,
}

impl SqlCredentialRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct CredentialRow {
    agent_name: String,
    token: String,
    owner_id: i64,
    created_at: String,
}

impl CredentialRow {
    fn into_credential(self) -> anyhow::Result<Credential> {
        Ok(Credential {
            agent_name: self.agent_name,
            token: self.token,
            owner_id: self.owner_id as u64,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

#[async_trait]
impl CredentialRepo for SqlCredentialRepo {
    async fn upsert(&self, cred: &Credential) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO credentials (agent_name, token, owner_id, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(agent_name) DO UPDATE SET
                token = excluded.token,
                owner_id = excluded.owner_id,
                created_at = excluded.created_at",
        )
        .bind(&cred.agent_name)
        .bind(&cred.token)
        .bind(cred.owner_id as i64)
        .bind(cred.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_name(&self, name: &str) -> anyhow::Result<Option<Credential>> {
        let row = sqlx::query_as::<_, CredentialRow>(
            "SELECT agent_name, token, owner_id, created_at FROM credentials WHERE agent_name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(CredentialRow::into_credential).transpose()
    }

    async fn delete(&self, name: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM credentials WHERE agent_name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_all(&self) -> anyhow::Result<Vec<Credential>> {
        let rows = sqlx::query_as::<_, CredentialRow>(
            "SELECT agent_name, token, owner_id, created_at FROM credentials",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(CredentialRow::into_credential).collect()
    }
}

pub struct SqlTaskRepo {
    pool: SqlitePool,
}

impl SqlTaskRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    task_id: String,
    from_user: String,
    to_agent: String,
    content: String,
    status: String,
    result: Option<String>,
    created_at: String,
    completed_at: Option<String>,
    chat_id: i64,
    message_id: i64,
    conversation_id: String,
    parent_task_id: Option<String>,
    result_message_id: Option<i64>,
}

const TASK_COLUMNS: &str = "task_id, from_user, to_agent, content, status, result, created_at, \
                            completed_at, chat_id, message_id, conversation_id, parent_task_id, \
                            result_message_id";

impl TaskRow {
    fn into_task(self) -> anyhow::Result<Task> {
        let status = TaskStatus::parse(&self.status)
            .ok_or_else(|| anyhow::anyhow!("unknown task status in db: {}", self.status))?;
        Ok(Task {
            task_id: self.task_id.parse()?,
            from: self.from_user,
            to: self.to_agent,
            content: self.content,
            status,
            result: self.result,
            created_at: parse_ts(&self.created_at)?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
            chat_id: self.chat_id,
            message_id: self.message_id as i32,
            conversation_id: self.conversation_id.parse()?,
            parent_task_id: self.parent_task_id.as_deref().map(str::parse).transpose()?,
            result_message_id: self.result_message_id.map(|v| v as i32),
        })
    }
}

fn parse_ts(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

#[async_trait]
impl TaskRepo for SqlTaskRepo {
    async fn upsert_task(&self, task: &Task) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO tasks (task_id, from_user, to_agent, content, status, result,
                                created_at, completed_at, chat_id, message_id,
                                conversation_id, parent_task_id, result_message_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(task_id) DO UPDATE SET
                status = excluded.status,
                result = excluded.result,
                completed_at = excluded.completed_at,
                chat_id = excluded.chat_id,
                message_id = excluded.message_id,
                result_message_id = excluded.result_message_id",
        )
        .bind(task.task_id.to_string())
        .bind(&task.from)
        .bind(&task.to)
        .bind(&task.content)
        .bind(task.status.as_str())
        .bind(&task.result)
        .bind(task.created_at.to_rfc3339())
        .bind(task.completed_at.map(|t| t.to_rfc3339()))
        .bind(task.chat_id)
        .bind(task.message_id as i64)
        .bind(task.conversation_id.to_string())
        .bind(task.parent_task_id.map(|id| id.to_string()))
        .bind(task.result_message_id.map(|v| v as i64))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE tasks SET status = ?, result = ?, completed_at = ?, chat_id = ?,
                              message_id = ?, result_message_id = ?
             WHERE task_id = ?",
        )
        .bind(task.status.as_str())
        .bind(&task.result)
        .bind(task.completed_at.map(|t| t.to_rfc3339()))
        .bind(task.chat_id)
        .bind(task.message_id as i64)
        .bind(task.result_message_id.map(|v| v as i64))
        .bind(task.task_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_pending(&self, agent: &str, task_id: Uuid) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO pending_tasks (agent_name, task_id, position)
             VALUES (?, ?, (SELECT COALESCE(MAX(position), 0) + 1 FROM pending_tasks))",
        )
        .bind(agent)
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_pending(&self, agent: &str, task_id: Uuid) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM pending_tasks WHERE agent_name = ? AND task_id = ?")
            .bind(agent)
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_open_tasks(&self) -> anyhow::Result<(Vec<Task>, Vec<(String, Uuid)>)> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM tasks
             WHERE status NOT IN ('completed', 'failed', 'rejected', 'cancelled')
             ORDER BY created_at, task_id",
            TASK_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        let tasks: Vec<Task> = rows
            .into_iter()
            .map(TaskRow::into_task)
            .collect::<anyhow::Result<_>>()?;

        #[derive(sqlx::FromRow)]
        struct PendingRow {
            agent_name: String,
            task_id: String,
        }
        let pending = sqlx::query_as::<_, PendingRow>(
            "SELECT agent_name, task_id FROM pending_tasks ORDER BY position",
        )
        .fetch_all(&self.pool)
        .await?;
        let backlog = pending
            .into_iter()
            .map(|r| Ok((r.agent_name, r.task_id.parse()?)))
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok((tasks, backlog))
    }

    async fn find_recent(&self, agent: Option<&str>, limit: u32) -> anyhow::Result<Vec<Task>> {
        let limit = limit.min(20) as i64;
        let rows = match agent {
            Some(name) => {
                sqlx::query_as::<_, TaskRow>(&format!(
                    "SELECT {} FROM tasks WHERE to_agent = ?
                     ORDER BY created_at DESC LIMIT ?",
                    TASK_COLUMNS
                ))
                .bind(name)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, TaskRow>(&format!(
                    "SELECT {} FROM tasks ORDER BY created_at DESC LIMIT ?",
                    TASK_COLUMNS
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    async fn find_task(&self, task_id: Uuid) -> anyhow::Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM tasks WHERE task_id = ?",
            TASK_COLUMNS
        ))
        .bind(task_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(TaskRow::into_task).transpose()
    }

    async fn find_by_result_message(&self, message_id: i32) -> anyhow::Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM tasks WHERE result_message_id = ?
             ORDER BY created_at DESC LIMIT 1",
            TASK_COLUMNS
        ))
        .bind(message_id as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TaskRow::into_task).transpose()
    }

    async fn load_conversation(&self, conversation_id: Uuid) -> anyhow::Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM tasks WHERE conversation_id = ?
             ORDER BY created_at, task_id",
            TASK_COLUMNS
        ))
        .bind(conversation_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }
}

pub struct SqlPanelRepo {
    pool: SqlitePool,
}

impl SqlPanelRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PanelRepo for SqlPanelRepo {
    async fn save_panel(&self, chat_id: i64, message_id: i32) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO status_panels (chat_id, message_id, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(chat_id) DO UPDATE SET
                message_id = excluded.message_id,
                updated_at = excluded.updated_at",
        )
        .bind(chat_id)
        .bind(message_id as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_panels(&self) -> anyhow::Result<Vec<(i64, i32)>> {
        #[derive(sqlx::FromRow)]
        struct PanelRow {
            chat_id: i64,
            message_id: i64,
        }
        let rows = sqlx::query_as::<_, PanelRow>("SELECT chat_id, message_id FROM status_panels")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| (r.chat_id, r.message_id as i32)).collect())
    }
}

// ---------------------------------------------------------------------------
// File fallback: credentials only, tasks stay in-memory
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Default)]
struct CredentialFile {
    credentials: Vec<Credential>,
}

/// JSON-file credential store used when no DATABASE_URL is configured.
/// The directory is created 0700 and the file written 0600.
pub struct FileCredentialStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        use std::os::unix::fs::PermissionsExt;
        let path: PathBuf = path.into();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self {
            path,
            lock: tokio::sync::Mutex::new(()),
        })
    }

    fn read_file(&self) -> anyhow::Result<CredentialFile> {
        if !self.path.exists() {
            return Ok(CredentialFile::default());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn write_file(&self, file: &CredentialFile) -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let raw = serde_json::to_string_pretty(file)?;
        std::fs::write(&self.path, raw)?;
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        Ok(())
    }
}

#[async_trait]
impl CredentialRepo for FileCredentialStore {
    async fn upsert(&self, cred: &Credential) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.read_file()?;
        file.credentials.retain(|c| c.agent_name != cred.agent_name);
        file.credentials.push(cred.clone());
        self.write_file(&file)
    }

    async fn find_by_name(&self, name: &str) -> anyhow::Result<Option<Credential>> {
        let _guard = self.lock.lock().await;
        let file = self.read_file()?;
        Ok(file.credentials.into_iter().find(|c| c.agent_name == name))
    }

    async fn delete(&self, name: &str) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.read_file()?;
        file.credentials.retain(|c| c.agent_name != name);
        self.write_file(&file)
    }

    async fn load_all(&self) -> anyhow::Result<Vec<Credential>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_file()?.credentials)
    }
}

/// Run migrations on an externally built pool (shared in-memory databases in
/// tests).
#[cfg(test)]
pub async fn open_for_tests(pool: &SqlitePool) -> anyhow::Result<()> {
    migrations::migrate(pool).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_cred(name: &str, owner: u64) -> Credential {
        Credential {
            agent_name: name.to_string(),
            token: format!("agt_test_{}", name),
            owner_id: owner,
            created_at: Utc::now(),
        }
    }

    fn make_task(to: &str) -> Task {
        Task {
            task_id: Uuid::new_v4(),
            from: "bob".into(),
            to: to.into(),
            content: "ping".into(),
            status: TaskStatus::Pending,
            result: None,
            created_at: Utc::now(),
            completed_at: None,
            chat_id: 42,
            message_id: 7,
            conversation_id: Uuid::new_v4(),
            parent_task_id: None,
            result_message_id: None,
        }
    }

    async fn test_pool() -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrations::migrate(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn credential_round_trip_sql() {
        let repo = SqlCredentialRepo::new(test_pool().await);
        let cred = make_cred("alice", 100);
        repo.upsert(&cred).await.unwrap();

        let found = repo.find_by_name("alice").await.unwrap().unwrap();
        assert_eq!(found.token, cred.token);
        assert_eq!(found.owner_id, 100);

        // Upsert replaces in place.
        let rotated = Credential {
            token: "agt_rotated".into(),
            ..cred.clone()
        };
        repo.upsert(&rotated).await.unwrap();
        let found = repo.find_by_name("alice").await.unwrap().unwrap();
        assert_eq!(found.token, "agt_rotated");
        assert_eq!(repo.load_all().await.unwrap().len(), 1);

        repo.delete("alice").await.unwrap();
        assert!(repo.find_by_name("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn task_and_backlog_round_trip() {
        let pool = test_pool().await;
        let repo = SqlTaskRepo::new(pool);

        let mut t1 = make_task("carol");
        let t2 = make_task("carol");
        repo.upsert_task(&t1).await.unwrap();
        repo.upsert_task(&t2).await.unwrap();
        repo.save_pending("carol", t1.task_id).await.unwrap();
        repo.save_pending("carol", t2.task_id).await.unwrap();
        // Duplicate save is ignored, not an error.
        repo.save_pending("carol", t1.task_id).await.unwrap();

        let (tasks, backlog) = repo.load_open_tasks().await.unwrap();
        assert_eq!(tasks.len(), 2);
        let carol: Vec<Uuid> = backlog
            .iter()
            .filter(|(a, _)| a == "carol")
            .map(|(_, id)| *id)
            .collect();
        assert_eq!(carol, vec![t1.task_id, t2.task_id]);

        // Terminal tasks disappear from the open set.
        t1.status = TaskStatus::Completed;
        t1.completed_at = Some(Utc::now());
        t1.result = Some("pong".into());
        repo.update_task(&t1).await.unwrap();
        repo.remove_pending("carol", t1.task_id).await.unwrap();

        let (tasks, backlog) = repo.load_open_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].1, t2.task_id);
    }

    #[tokio::test]
    async fn find_recent_caps_and_filters() {
        let repo = SqlTaskRepo::new(test_pool().await);
        for i in 0..25 {
            let mut t = make_task(if i % 2 == 0 { "even" } else { "odd" });
            t.created_at = Utc::now() + chrono::Duration::seconds(i);
            repo.upsert_task(&t).await.unwrap();
        }
        assert_eq!(repo.find_recent(None, 100).await.unwrap().len(), 20);
        let odd = repo.find_recent(Some("odd"), 5).await.unwrap();
        assert_eq!(odd.len(), 5);
        assert!(odd.iter().all(|t| t.to == "odd"));
        // Ordered newest first.
        assert!(odd.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    }

    #[tokio::test]
    async fn result_message_and_conversation_lookup() {
        let repo = SqlTaskRepo::new(test_pool().await);
        let conversation = Uuid::new_v4();

        let mut t1 = make_task("alice");
        t1.conversation_id = conversation;
        t1.status = TaskStatus::Completed;
        t1.completed_at = Some(Utc::now());
        t1.result_message_id = Some(99);
        repo.upsert_task(&t1).await.unwrap();

        let mut t2 = make_task("alice");
        t2.conversation_id = conversation;
        t2.parent_task_id = Some(t1.task_id);
        t2.created_at = t1.created_at + chrono::Duration::seconds(5);
        repo.upsert_task(&t2).await.unwrap();

        let found = repo.find_by_result_message(99).await.unwrap().unwrap();
        assert_eq!(found.task_id, t1.task_id);
        assert!(repo.find_by_result_message(12345).await.unwrap().is_none());

        let chain = repo.load_conversation(conversation).await.unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].task_id, t1.task_id);
        assert_eq!(chain[1].parent_task_id, Some(t1.task_id));

        assert_eq!(
            repo.find_task(t2.task_id).await.unwrap().unwrap().task_id,
            t2.task_id
        );
        assert!(repo.find_task(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn panel_pointer_round_trip() {
        let repo = SqlPanelRepo::new(test_pool().await);
        repo.save_panel(-100123, 55).await.unwrap();
        repo.save_panel(-100123, 56).await.unwrap();
        repo.save_panel(777, 1).await.unwrap();

        let mut panels = repo.load_panels().await.unwrap();
        panels.sort();
        assert_eq!(panels, vec![(-100123, 56), (777, 1)]);
    }

    #[tokio::test]
    async fn file_store_round_trip_and_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("credentials.json");
        let store = FileCredentialStore::new(&path).unwrap();

        assert!(store.load_all().await.unwrap().is_empty());

        store.upsert(&make_cred("alice", 1)).await.unwrap();
        store.upsert(&make_cred("bob", 2)).await.unwrap();
        store.upsert(&make_cred("alice", 3)).await.unwrap();

        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 2);
        let alice = store.find_by_name("alice").await.unwrap().unwrap();
        assert_eq!(alice.owner_id, 3);

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);

        store.delete("alice").await.unwrap();
        assert!(store.find_by_name("alice").await.unwrap().is_none());
    }

}
