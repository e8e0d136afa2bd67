use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Runtime counters for one connected agent.
#[derive(Debug, Clone, Default)]
pub struct AgentRuntimeStatus {
    pub running_tasks: u32,
    pub completed_count: u64,
    pub current_task_id: Option<Uuid>,
    pub idle_since: Option<DateTime<Utc>>,
}

/// In-memory per-agent runtime state, fed by `status_report` frames and the
/// result demultiplexer. Entries live only while the agent stays relevant;
/// disconnect clears them.
#[derive(Default)]
pub struct AgentStatusCache {
    agents: RwLock<HashMap<String, AgentRuntimeStatus>>,
}

impl AgentStatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn apply_report(
        &self,
        agent: &str,
        running_tasks: u32,
        current_task_id: Option<Uuid>,
        idle_since: Option<DateTime<Utc>>,
    ) {
        let mut agents = self.agents.write().await;
        let entry = agents.entry(agent.to_string()).or_default();
        entry.running_tasks = running_tasks;
        entry.current_task_id = current_task_id;
        entry.idle_since = idle_since;
    }

    pub async fn mark_dispatched(&self, agent: &str, task_id: Uuid) {
        let mut agents = self.agents.write().await;
        let entry = agents.entry(agent.to_string()).or_default();
        entry.running_tasks = entry.running_tasks.saturating_add(1);
        entry.current_task_id = Some(task_id);
        entry.idle_since = None;
    }

    /// Bump the completed counter after a terminal result.
    pub async fn incr_completed(&self, agent: &str) {
        let mut agents = self.agents.write().await;
        let entry = agents.entry(agent.to_string()).or_default();
        entry.completed_count += 1;
        entry.running_tasks = entry.running_tasks.saturating_sub(1);
        if entry.running_tasks == 0 {
            entry.current_task_id = None;
            entry.idle_since = Some(Utc::now());
        }
    }

    pub async fn snapshot(&self, agent: &str) -> AgentRuntimeStatus {
        self.agents
            .read()
            .await
            .get(agent)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn remove(&self, agent: &str) {
        self.agents.write().await.remove(agent);
    }
}
