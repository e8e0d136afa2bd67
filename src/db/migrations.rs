use sqlx::SqlitePool;
use tracing::info;

/// Schema migrations, applied at most once each, gated by the `_migrations`
/// name ledger. The whole batch runs inside one transaction so a failed
/// migration leaves the ledger and schema untouched.
const MIGRATIONS: &[(&str, &[&str])] = &[
    (
        "0001_credentials",
        &["CREATE TABLE IF NOT EXISTS credentials (
            agent_name TEXT PRIMARY KEY,
            token TEXT NOT NULL UNIQUE,
            owner_id INTEGER NOT NULL,
            created_at TEXT NOT NULL
        )"],
    ),
    (
        "0002_tasks",
        &[
            "CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                from_user TEXT NOT NULL,
                to_agent TEXT NOT NULL,
                content TEXT NOT NULL,
                status TEXT NOT NULL,
                result TEXT,
                created_at TEXT NOT NULL,
                completed_at TEXT,
                chat_id INTEGER NOT NULL DEFAULT 0,
                message_id INTEGER NOT NULL DEFAULT 0,
                conversation_id TEXT NOT NULL,
                parent_task_id TEXT,
                result_message_id INTEGER
            )",
            "CREATE INDEX IF NOT EXISTS idx_tasks_conversation
             ON tasks(conversation_id, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_agent_time
             ON tasks(to_agent, created_at DESC)",
        ],
    ),
    (
        "0003_pending_tasks",
        &[
            "CREATE TABLE IF NOT EXISTS pending_tasks (
                agent_name TEXT NOT NULL,
                task_id TEXT NOT NULL REFERENCES tasks(task_id),
                position INTEGER NOT NULL,
                PRIMARY KEY (agent_name, task_id)
            )",
            "CREATE INDEX IF NOT EXISTS idx_pending_agent_position
             ON pending_tasks(agent_name, position)",
        ],
    ),
    (
        "0004_status_panels",
        &["CREATE TABLE IF NOT EXISTS status_panels (
            chat_id INTEGER PRIMARY KEY,
            message_id INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        )"],
    ),
];

pub(crate) async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS _migrations (
            name TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    let mut tx = pool.begin().await?;
    let mut applied = 0usize;

    for (name, statements) in MIGRATIONS {
        let seen = sqlx::query("SELECT 1 FROM _migrations WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?;
        if seen.is_some() {
            continue;
        }

        for statement in *statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        sqlx::query("INSERT INTO _migrations (name, applied_at) VALUES (?, ?)")
            .bind(name)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;
        applied += 1;
    }

    tx.commit().await?;

    if applied > 0 {
        info!(applied, "Database migrations applied");
    }
    Ok(())
}
