// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Agent registry: lifecycle, health, and the reverse-dial channel cache.
//!
//! State is in memory only and rebuilt from agent registrations and
//! heartbeats. All writes are serialized under one lock; `status = online`
//! holds exactly while `now - last_seen <= offline_threshold`, maintained by
//! heartbeats on one side and the periodic health sweep on the other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tonic::transport::Channel;
use tracing::{info, warn};

use mandau_plugin::{AuditEntry, Registry as PluginRegistry};
use mandau_transport::{
    client_tls_config, connect_with_backoff, endpoint, TlsPaths, AGENT_PORT, AGENT_SERVER_NAME,
};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_OFFLINE_THRESHOLD: Duration = Duration::from_secs(90);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Dial attempts per reverse-dial before surfacing `Unavailable`; retries
/// are paced by the shared exponential backoff schedule.
const DIAL_ATTEMPTS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Online,
    Offline,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Offline => "offline",
            AgentStatus::Error => "error",
        }
    }
}

/// One registered agent. The outbound channel is established lazily on
/// first use and dropped when the agent goes offline.
#[derive(Clone)]
pub struct AgentConnection {
    pub id: String,
    pub hostname: String,
    pub labels: HashMap<String, String>,
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    pub last_seen: DateTime<Utc>,
    /// Stack ids the agent reported in its last inventory.
    pub stacks: Vec<String>,
    pub channel: Option<Channel>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("agent offline: {0}")]
    AgentOffline(String),

    #[error("stack not found on any agent: {0}")]
    StackNotFound(String),

    #[error("stack {0} present on multiple agents")]
    StackAmbiguous(String),

    #[error("dial agent {agent_id}: {message}")]
    Dial { agent_id: String, message: String },
}

pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentConnection>>,
    plugins: Arc<PluginRegistry>,
    tls_paths: TlsPaths,
    offline_threshold: Duration,
    pub heartbeat_interval: Duration,
}

impl AgentRegistry {
    pub fn new(
        plugins: Arc<PluginRegistry>,
        tls_paths: TlsPaths,
        heartbeat_interval: Duration,
        offline_threshold: Duration,
    ) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            plugins,
            tls_paths,
            offline_threshold,
            heartbeat_interval,
        }
    }

    /// Register or re-register an agent. A supplied id is adopted; an empty
    /// one gets a generated `agent-<hostname>-<unix_ts>`. Re-registration
    /// refreshes labels, capabilities, and liveness, and keeps any cached
    /// channel for lazy re-validation on next use.
    pub async fn register(
        &self,
        hostname: &str,
        agent_id: &str,
        labels: HashMap<String, String>,
        capabilities: Vec<String>,
    ) -> String {
        let id = if agent_id.is_empty() {
            format!("agent-{hostname}-{}", Utc::now().timestamp())
        } else {
            agent_id.to_string()
        };

        let mut agents = self.agents.write().await;
        match agents.get_mut(&id) {
            Some(existing) => {
                existing.hostname = hostname.to_string();
                existing.labels = labels;
                existing.capabilities = capabilities;
                existing.last_seen = Utc::now();
                existing.status = AgentStatus::Online;
                info!(agent_id = %id, hostname, "agent re-registered");
            }
            None => {
                agents.insert(
                    id.clone(),
                    AgentConnection {
                        id: id.clone(),
                        hostname: hostname.to_string(),
                        labels,
                        capabilities,
                        status: AgentStatus::Online,
                        last_seen: Utc::now(),
                        stacks: Vec::new(),
                        channel: None,
                    },
                );
                info!(agent_id = %id, hostname, "agent registered");
            }
        }
        id
    }

    /// Refresh liveness. Flips offline agents back online.
    pub async fn heartbeat(&self, agent_id: &str) -> Result<(), RegistryError> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::AgentNotFound(agent_id.to_string()))?;

        agent.last_seen = Utc::now();
        if agent.status == AgentStatus::Offline {
            info!(agent_id, "agent back online via heartbeat");
        }
        agent.status = AgentStatus::Online;
        Ok(())
    }

    /// Snapshot every agent (without channels).
    pub async fn list(&self) -> Vec<AgentConnection> {
        let agents = self.agents.read().await;
        let mut list: Vec<_> = agents
            .values()
            .map(|a| AgentConnection {
                channel: None,
                ..a.clone()
            })
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Replace an agent's known stack inventory, atomically with the
    /// `ListStacks` response that produced it.
    pub async fn update_stacks(&self, agent_id: &str, stacks: Vec<String>) {
        let mut agents = self.agents.write().await;
        if let Some(agent) = agents.get_mut(agent_id) {
            agent.stacks = stacks;
        }
    }

    /// Resolve the agent holding a stack. Zero owners is `StackNotFound`;
    /// more than one is ambiguous and refused.
    pub async fn find_agent_with_stack(&self, stack_id: &str) -> Result<String, RegistryError> {
        let agents = self.agents.read().await;
        let mut owners = agents
            .values()
            .filter(|a| a.stacks.iter().any(|s| s == stack_id))
            .map(|a| a.id.clone());

        let first = owners
            .next()
            .ok_or_else(|| RegistryError::StackNotFound(stack_id.to_string()))?;
        if owners.next().is_some() {
            return Err(RegistryError::StackAmbiguous(stack_id.to_string()));
        }
        Ok(first)
    }

    /// The reverse-dial channel for an agent, establishing and caching it on
    /// first use. The dial retries under exponential backoff (base 1 s,
    /// multiplier 1.6, jitter 0.2, max 10 s); exhausting the attempts
    /// surfaces as `Unavailable` without demoting the agent.
    pub async fn channel(&self, agent_id: &str) -> Result<Channel, RegistryError> {
        // Fast path plus the dial parameters, without holding the lock
        // across the dial.
        let hostname = {
            let agents = self.agents.read().await;
            let agent = agents
                .get(agent_id)
                .ok_or_else(|| RegistryError::AgentNotFound(agent_id.to_string()))?;
            if agent.status == AgentStatus::Offline {
                return Err(RegistryError::AgentOffline(agent_id.to_string()));
            }
            if let Some(channel) = &agent.channel {
                return Ok(channel.clone());
            }
            agent.hostname.clone()
        };

        let addr = format!("{hostname}:{AGENT_PORT}");
        let tls = client_tls_config(&self.tls_paths, AGENT_SERVER_NAME).map_err(|e| {
            RegistryError::Dial {
                agent_id: agent_id.to_string(),
                message: e.to_string(),
            }
        })?;
        let endpoint = endpoint(addr.clone(), tls).map_err(|e| RegistryError::Dial {
            agent_id: agent_id.to_string(),
            message: e.to_string(),
        })?;
        let channel = connect_with_backoff(&endpoint, DIAL_ATTEMPTS)
            .await
            .map_err(|e| RegistryError::Dial {
                agent_id: agent_id.to_string(),
                message: format!("{addr}: {e}"),
            })?;

        let mut agents = self.agents.write().await;
        if let Some(agent) = agents.get_mut(agent_id) {
            agent.channel = Some(channel.clone());
        }
        Ok(channel)
    }

    /// Drop an agent's cached channel so the next use re-dials. Called after
    /// a forwarded call fails with a transport-shaped status.
    pub async fn drop_channel(&self, agent_id: &str) {
        let mut agents = self.agents.write().await;
        if let Some(agent) = agents.get_mut(agent_id) {
            if agent.channel.take().is_some() {
                info!(agent_id, "dropped reverse-dial channel after transport failure");
            }
        }
    }

    /// One health sweep pass: demote agents silent past the threshold, drop
    /// their cached channels, and write an `agent_offline` audit record.
    pub async fn sweep(&self) {
        let mut went_offline = Vec::new();
        {
            let mut agents = self.agents.write().await;
            let now = Utc::now();
            for (id, agent) in agents.iter_mut() {
                let elapsed = (now - agent.last_seen)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if elapsed > self.offline_threshold {
                    if agent.status != AgentStatus::Offline {
                        agent.status = AgentStatus::Offline;
                        went_offline.push(id.clone());
                        warn!(agent_id = %id, silent_for = ?elapsed, "agent marked offline");
                    }
                    if agent.channel.take().is_some() {
                        info!(agent_id = %id, "dropped stale channel for offline agent");
                    }
                }
            }
        }

        for agent_id in went_offline {
            self.plugins
                .audit_all(&AuditEntry {
                    timestamp: Utc::now(),
                    agent_id,
                    identity: None,
                    action: "agent_offline".to_string(),
                    resource: String::new(),
                    result: "success".to_string(),
                    duration: Duration::ZERO,
                    metadata: HashMap::new(),
                })
                .await;
        }
    }

    /// Run the periodic health sweep until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, shutdown: tokio_util::sync::CancellationToken) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                () = shutdown.cancelled() => return,
            }
        }
    }

    #[cfg(test)]
    pub async fn age_agent(&self, agent_id: &str, by: Duration) {
        let mut agents = self.agents.write().await;
        if let Some(agent) = agents.get_mut(agent_id) {
            agent.last_seen -= chrono::Duration::from_std(by).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> AgentRegistry {
        AgentRegistry::new(
            Arc::new(PluginRegistry::new()),
            TlsPaths::new("/etc/mandau/core.crt", "/etc/mandau/core.key", "/etc/mandau/ca.crt"),
            DEFAULT_HEARTBEAT_INTERVAL,
            DEFAULT_OFFLINE_THRESHOLD,
        )
    }

    #[tokio::test]
    async fn empty_id_gets_generated_one() {
        let registry = test_registry();
        let id = registry
            .register("node-a", "", HashMap::new(), vec!["docker".into()])
            .await;
        assert!(id.starts_with("agent-node-a-"));

        let agents = registry.list().await;
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].hostname, "node-a");
        assert_eq!(agents[0].status, AgentStatus::Online);
    }

    #[tokio::test]
    async fn supplied_id_is_adopted_and_reregistration_refreshes() {
        let registry = test_registry();
        let id = registry
            .register("node-a", "agent-node-a", HashMap::new(), vec![])
            .await;
        assert_eq!(id, "agent-node-a");

        let id2 = registry
            .register(
                "node-a",
                "agent-node-a",
                HashMap::from([("zone".to_string(), "eu".to_string())]),
                vec!["stack".into()],
            )
            .await;
        assert_eq!(id2, "agent-node-a");

        let agents = registry.list().await;
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].labels.get("zone").map(String::as_str), Some("eu"));
        assert_eq!(agents[0].capabilities, vec!["stack".to_string()]);
    }

    #[tokio::test]
    async fn heartbeat_unknown_agent_is_not_found() {
        let registry = test_registry();
        let err = registry.heartbeat("ghost").await.unwrap_err();
        assert!(matches!(err, RegistryError::AgentNotFound(_)));
    }

    #[tokio::test]
    async fn sweep_demotes_silent_agents_and_heartbeat_revives() {
        let registry = test_registry();
        let id = registry.register("node-a", "", HashMap::new(), vec![]).await;

        // Fresh agent survives a sweep.
        registry.sweep().await;
        assert_eq!(registry.list().await[0].status, AgentStatus::Online);

        // Silent past the threshold: demoted.
        registry.age_agent(&id, Duration::from_secs(91)).await;
        registry.sweep().await;
        assert_eq!(registry.list().await[0].status, AgentStatus::Offline);

        // A heartbeat flips it straight back.
        registry.heartbeat(&id).await.unwrap();
        assert_eq!(registry.list().await[0].status, AgentStatus::Online);
    }

    #[tokio::test]
    async fn stack_resolution_rejects_zero_and_many() {
        let registry = test_registry();
        let a = registry.register("node-a", "", HashMap::new(), vec![]).await;
        let b = registry.register("node-b", "", HashMap::new(), vec![]).await;

        let err = registry.find_agent_with_stack("web").await.unwrap_err();
        assert!(matches!(err, RegistryError::StackNotFound(_)));

        registry.update_stacks(&a, vec!["web".into()]).await;
        assert_eq!(registry.find_agent_with_stack("web").await.unwrap(), a);

        registry.update_stacks(&b, vec!["web".into()]).await;
        let err = registry.find_agent_with_stack("web").await.unwrap_err();
        assert!(matches!(err, RegistryError::StackAmbiguous(_)));
    }

    #[tokio::test]
    async fn channel_for_offline_agent_is_refused() {
        let registry = test_registry();
        let id = registry.register("node-a", "", HashMap::new(), vec![]).await;
        registry.age_agent(&id, Duration::from_secs(120)).await;
        registry.sweep().await;

        let err = registry.channel(&id).await.unwrap_err();
        assert!(matches!(err, RegistryError::AgentOffline(_)));
    }
}
