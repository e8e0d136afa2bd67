use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::db::CredentialRepo;
use crate::protocol::HubFrame;
use crate::types::{AgentInfo, Credential};

/// A live agent connection. At most one per agent name; a new registration
/// evicts the previous connection before installing itself.
struct ConnEntry {
    conn_id: u64,
    outbound: mpsc::Sender<HubFrame>,
    closer: CancellationToken,
    connected_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

#[derive(Default)]
struct CredMap {
    by_name: HashMap<String, Credential>,
    by_token: HashMap<String, String>,
}

/// Credential issuance and validation plus the live connection index.
pub struct Registry {
    creds: RwLock<CredMap>,
    conns: RwLock<HashMap<String, ConnEntry>>,
    repo: Arc<dyn CredentialRepo>,
    next_conn_id: AtomicU64,
}

impl Registry {
    pub fn new(repo: Arc<dyn CredentialRepo>) -> Self {
        Self {
            creds: RwLock::new(CredMap::default()),
            conns: RwLock::new(HashMap::new()),
            repo,
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Reload persisted credentials. Read failure at startup is fatal.
    pub async fn load(&self) -> anyhow::Result<usize> {
        let all = self.repo.load_all().await?;
        let mut creds = self.creds.write().await;
        for cred in &all {
            creds.by_token.insert(cred.token.clone(), cred.agent_name.clone());
            creds.by_name.insert(cred.agent_name.clone(), cred.clone());
        }
        Ok(all.len())
    }

    /// Issue a fresh token for `agent_name`, replacing any existing credential
    /// atomically (the old token stops validating in the same transition).
    pub async fn issue_token(&self, agent_name: &str, owner_id: u64) -> Credential {
        let cred = Credential {
            agent_name: agent_name.to_string(),
            token: generate_token(),
            owner_id,
            created_at: Utc::now(),
        };
        {
            let mut creds = self.creds.write().await;
            if let Some(old) = creds.by_name.remove(agent_name) {
                creds.by_token.remove(&old.token);
            }
            creds.by_token.insert(cred.token.clone(), cred.agent_name.clone());
            creds.by_name.insert(cred.agent_name.clone(), cred.clone());
        }
        if let Err(e) = self.repo.upsert(&cred).await {
            warn!(agent = %agent_name, "Failed to persist credential: {}", e);
        }
        info!(agent = %agent_name, owner_id, "Issued agent token");
        cred
    }

    /// Rotate the token for the credential owned by `owner_id`. Returns None
    /// when the name is unknown or the caller is not the owner. A live
    /// connection for the name is closed so it must reconnect with the new
    /// token.
    pub async fn refresh_token(&self, agent_name: &str, owner_id: u64) -> Option<Credential> {
        {
            let creds = self.creds.read().await;
            let existing = creds.by_name.get(agent_name)?;
            if existing.owner_id != owner_id {
                return None;
            }
        }
        let cred = self.issue_token(agent_name, owner_id).await;
        self.close_connection(agent_name).await;
        Some(cred)
    }

    /// Delete a credential. Owner-gated; also closes any live connection.
    pub async fn revoke(&self, agent_name: &str, owner_id: u64) -> bool {
        {
            let mut creds = self.creds.write().await;
            match creds.by_name.get(agent_name) {
                Some(cred) if cred.owner_id == owner_id => {
                    let token = cred.token.clone();
                    creds.by_name.remove(agent_name);
                    creds.by_token.remove(&token);
                }
                _ => return false,
            }
        }
        self.close_connection(agent_name).await;
        if let Err(e) = self.repo.delete(agent_name).await {
            warn!(agent = %agent_name, "Failed to delete credential: {}", e);
        }
        info!(agent = %agent_name, "Revoked agent credential");
        true
    }

    /// Constant-time token check; the sole gate for accepting `register`.
    pub async fn validate(&self, agent_name: &str, token: &str) -> bool {
        let creds = self.creds.read().await;
        match creds.by_name.get(agent_name) {
            Some(cred) => constant_time_eq(cred.token.as_bytes(), token.as_bytes()),
            None => false,
        }
    }

    pub async fn lookup_by_token(&self, token: &str) -> Option<String> {
        self.creds.read().await.by_token.get(token).cloned()
    }

    pub async fn owner_of(&self, agent_name: &str) -> Option<u64> {
        self.creds
            .read()
            .await
            .by_name
            .get(agent_name)
            .map(|c| c.owner_id)
    }

    pub async fn agent_exists(&self, agent_name: &str) -> bool {
        self.creds.read().await.by_name.contains_key(agent_name)
    }

    pub async fn find_credential_by_owner(&self, owner_id: u64) -> Option<Credential> {
        self.creds
            .read()
            .await
            .by_name
            .values()
            .find(|c| c.owner_id == owner_id)
            .cloned()
    }

    /// Install a live connection, evicting (closing) any prior connection for
    /// the same name. Returns the connection id used to guard unregister.
    pub async fn register(
        &self,
        agent_name: &str,
        outbound: mpsc::Sender<HubFrame>,
        closer: CancellationToken,
    ) -> u64 {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let mut conns = self.conns.write().await;
        if let Some(old) = conns.remove(agent_name) {
            info!(agent = %agent_name, "Evicting previous connection");
            old.closer.cancel();
        }
        let now = Utc::now();
        conns.insert(
            agent_name.to_string(),
            ConnEntry {
                conn_id,
                outbound,
                closer,
                connected_at: now,
                last_seen: now,
            },
        );
        conn_id
    }

    /// Remove a live connection. The `conn_id` guard keeps an evicted
    /// connection's teardown from tearing down its replacement.
    pub async fn unregister(&self, agent_name: &str, conn_id: u64) -> bool {
        let mut conns = self.conns.write().await;
        match conns.get(agent_name) {
            Some(entry) if entry.conn_id == conn_id => {
                conns.remove(agent_name);
                true
            }
            _ => false,
        }
    }

    /// Record inbound activity for heartbeat liveness.
    pub async fn touch(&self, agent_name: &str) {
        if let Some(entry) = self.conns.write().await.get_mut(agent_name) {
            entry.last_seen = Utc::now();
        }
    }

    pub async fn is_online(&self, agent_name: &str) -> bool {
        self.conns.read().await.contains_key(agent_name)
    }

    /// Queue a frame to a connected agent. Errors when offline or when the
    /// outbound channel is gone (connection tearing down).
    pub async fn send_to(&self, agent_name: &str, frame: HubFrame) -> anyhow::Result<()> {
        let tx = {
            let conns = self.conns.read().await;
            match conns.get(agent_name) {
                Some(entry) => entry.outbound.clone(),
                None => anyhow::bail!("agent {} is not connected", agent_name),
            }
        };
        tx.send(frame)
            .await
            .map_err(|_| anyhow::anyhow!("connection to {} is closing", agent_name))
    }

    pub async fn list_online(&self) -> Vec<AgentInfo> {
        let conns = self.conns.read().await;
        let creds = self.creds.read().await;
        let mut agents: Vec<AgentInfo> = conns
            .iter()
            .map(|(name, entry)| AgentInfo {
                name: name.clone(),
                connected_at: entry.connected_at,
                last_seen: entry.last_seen,
                owner_id: creds.by_name.get(name).map(|c| c.owner_id),
            })
            .collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }

    /// Snapshot for the heartbeat sweep: (name, last_seen, outbound, closer).
    pub async fn heartbeat_snapshot(
        &self,
    ) -> Vec<(String, DateTime<Utc>, mpsc::Sender<HubFrame>, CancellationToken)> {
        self.conns
            .read()
            .await
            .iter()
            .map(|(name, e)| {
                (
                    name.clone(),
                    e.last_seen,
                    e.outbound.clone(),
                    e.closer.clone(),
                )
            })
            .collect()
    }

    /// Shutdown path: close every live connection.
    pub async fn close_all(&self) {
        let mut conns = self.conns.write().await;
        for (_, entry) in conns.drain() {
            entry.closer.cancel();
        }
    }

    async fn close_connection(&self, agent_name: &str) {
        let mut conns = self.conns.write().await;
        if let Some(entry) = conns.remove(agent_name) {
            entry.closer.cancel();
        }
    }
}

/// `agt_` + 24 random bytes, base64url without padding.
fn generate_token() -> String {
    let mut bytes = [0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    format!(
        "agt_{}",
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
    )
}

/// Constant-time byte comparison to prevent timing side channels on token
/// validation.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
