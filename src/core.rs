use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::{self, ApiState, RateLimiter};
use crate::chat::ChatAdapter;
use crate::config::Config;
use crate::db::{
    self, CredentialRepo, FileCredentialStore, PanelRepo, SqlCredentialRepo, SqlPanelRepo,
    SqlTaskRepo, TaskRepo,
};
use crate::gateway::{self, Gateway};
use crate::registry::Registry;
use crate::status::AgentStatusCache;
use crate::store::TaskStore;

pub async fn run(config: Config) -> anyhow::Result<()> {
    // 1. Persistence. With a database URL everything is durable; without one
    //    credentials live in a JSON file and task state is in-memory only.
    let (cred_repo, task_repo, panel_repo): (
        Arc<dyn CredentialRepo>,
        Option<Arc<dyn TaskRepo>>,
        Option<Arc<dyn PanelRepo>>,
    ) = match &config.database_url {
        Some(url) => {
            let pool = db::open(url).await?;
            info!("Database opened ({})", url);
            (
                Arc::new(SqlCredentialRepo::new(pool.clone())),
                Some(Arc::new(SqlTaskRepo::new(pool.clone()))),
                Some(Arc::new(SqlPanelRepo::new(pool))),
            )
        }
        None => {
            info!("DATABASE_URL not set; credentials in data/credentials.json, tasks in-memory");
            (
                Arc::new(FileCredentialStore::new("data/credentials.json")?),
                None,
                None,
            )
        }
    };

    // 2. Registry with persisted credentials.
    let registry = Arc::new(Registry::new(cred_repo));
    let credentials = registry.load().await?;
    info!(credentials, "Registry loaded");

    // 3. Task store with non-terminal tasks and the backlog.
    let store = Arc::new(TaskStore::new(task_repo));
    let reloaded = store.load_open().await?;
    info!(tasks = reloaded, "Open tasks reloaded");

    // 4. Agent-status cache.
    let status = Arc::new(AgentStatusCache::new());

    // 5. Connection gateway; its events feed the chat adapter.
    let (event_tx, event_rx) = mpsc::channel(256);
    let gateway = Arc::new(Gateway::new(
        registry.clone(),
        store.clone(),
        status.clone(),
        event_tx,
    ));

    // 6. Chat adapter: resolve the bot identity and reload panel pointers.
    let adapter = Arc::new(ChatAdapter::new(
        &config.bot_token,
        registry.clone(),
        store.clone(),
        status.clone(),
        gateway.clone(),
        panel_repo,
        config.public_url.clone(),
        config.default_chat_id,
    ));
    adapter.init().await;

    let shutdown = CancellationToken::new();

    // 7. Conversation-idle sweeper.
    let (sweep_tx, sweep_rx) = mpsc::channel(32);
    let _sweeper = store.spawn_sweeper(
        config.conversation_idle,
        config.sweep_interval,
        sweep_tx,
        shutdown.clone(),
    );

    // 8. Heartbeat over all agent connections.
    let _heartbeat = gateway::spawn_heartbeat(registry.clone(), shutdown.clone());

    // 9. Outbound event loop (results, progress, notices, panel upkeep).
    tokio::spawn(adapter.clone().run_event_loop(event_rx, sweep_rx));

    // 10. API-created tasks flow to the adapter for their approval bubble.
    let (api_task_tx, mut api_task_rx) = mpsc::channel(32);
    {
        let adapter = adapter.clone();
        tokio::spawn(async move {
            while let Some(task) = api_task_rx.recv().await {
                adapter.on_api_task(task).await;
            }
        });
    }

    // 11. Inbound chat updates: webhook when public, long-polling otherwise.
    if let Some(url) = &config.public_url {
        adapter.set_webhook(url).await?;
    } else {
        tokio::spawn(adapter.clone().start_polling_with_retry());
    }

    // 12. HTTP API and the agent WebSocket share one listener.
    let api_state = ApiState {
        registry: registry.clone(),
        store: store.clone(),
        status: status.clone(),
        adapter: adapter.clone(),
        api_tasks: api_task_tx,
        rate_limiter: Arc::new(RateLimiter::new(
            config.api_rate_limit.0,
            config.api_rate_limit.1,
        )),
    };
    let app = api::build_router(api_state).merge(
        Router::new()
            .route("/ws", axum::routing::get(gateway::ws_handler))
            .with_state(gateway.clone()),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("agenthub listening on http://{} (agents connect at /ws)", addr);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            server_shutdown.cancel();
        })
        .await?;

    // Close agent connections and give writers a moment to flush close
    // frames; periodic workers observed the cancelled token already.
    registry.close_all().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!("agenthub stopped");
    Ok(())
}
