//! Agent registry.
//!
//! The in-memory table is authoritative; every change is written through to
//! the agent repository while the table lock is held, so the stored copy
//! never runs ahead of or behind the table. Load changes are atomic
//! compare-and-increment operations bounded by `max_concurrent_tasks`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::adapters::Repository;
use crate::domain::{AgentInfo, AgentStatus};
use crate::error::{CoordError, Result};

pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentInfo>>,
    repo: Arc<dyn Repository<AgentInfo>>,
}

impl AgentRegistry {
    pub fn new(repo: Arc<dyn Repository<AgentInfo>>) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            repo,
        }
    }

    /// Add an agent, or update capabilities and capacity of a known one
    pub async fn register(&self, mut agent: AgentInfo) -> Result<AgentInfo> {
        if agent.agent_id.trim().is_empty() {
            return Err(CoordError::Validation("agent_id is required".into()));
        }
        if agent.max_concurrent_tasks == 0 {
            return Err(CoordError::Validation(format!(
                "agent '{}' needs max_concurrent_tasks >= 1",
                agent.agent_id
            )));
        }

        let mut agents = self.agents.write().await;
        if let Some(existing) = agents.get(&agent.agent_id) {
            agent.current_load = existing.current_load;
            agent.registered_at = existing.registered_at;
        }
        if agent.current_load > agent.max_concurrent_tasks {
            return Err(CoordError::Validation(format!(
                "agent '{}' load {} exceeds capacity {}",
                agent.agent_id, agent.current_load, agent.max_concurrent_tasks
            )));
        }
        agent.refresh_status();

        self.repo.save(&agent).await?;
        agents.insert(agent.agent_id.clone(), agent.clone());
        info!(agent_id = %agent.agent_id, capacity = agent.max_concurrent_tasks, "Agent registered");
        Ok(agent)
    }

    /// Remove an agent; the caller reassigns its work
    pub async fn unregister(&self, agent_id: &str) -> Result<AgentInfo> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .remove(agent_id)
            .ok_or_else(|| CoordError::not_found("Agent", agent_id))?;
        self.repo.delete(agent_id).await?;
        info!(agent_id, "Agent unregistered");
        Ok(agent)
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentInfo> {
        self.agents.read().await.get(agent_id).cloned()
    }

    /// All agents sorted by id
    pub async fn list(&self) -> Vec<AgentInfo> {
        let mut agents: Vec<AgentInfo> = self.agents.read().await.values().cloned().collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    /// Snapshot of the named agents (or every agent), skipping unknown ids
    pub async fn snapshot(&self, ids: Option<&[String]>) -> Vec<AgentInfo> {
        match ids {
            None => self.list().await,
            Some(ids) => {
                let agents = self.agents.read().await;
                let mut picked: Vec<AgentInfo> =
                    ids.iter().filter_map(|id| agents.get(id).cloned()).collect();
                picked.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
                picked.dedup_by(|a, b| a.agent_id == b.agent_id);
                picked
            }
        }
    }

    /// Mark an agent offline, or bring it back (status derived from load)
    pub async fn set_status(&self, agent_id: &str, status: AgentStatus) -> Result<AgentInfo> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| CoordError::not_found("Agent", agent_id))?;
        agent.status = status;
        agent.refresh_status();
        let updated = agent.clone();
        self.repo.save(&updated).await?;
        Ok(updated)
    }

    /// Take one slot if the agent is online and below capacity
    pub async fn try_acquire_slot(&self, agent_id: &str) -> Result<bool> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| CoordError::not_found("Agent", agent_id))?;
        if agent.status == AgentStatus::Offline || !agent.has_capacity() {
            return Ok(false);
        }
        agent.current_load += 1;
        agent.refresh_status();
        let updated = agent.clone();
        self.repo.save(&updated).await?;
        debug!(agent_id, load = updated.current_load, "Slot acquired");
        Ok(true)
    }

    /// Give a slot back; unknown agents are ignored
    pub async fn release_slot(&self, agent_id: &str) -> Result<()> {
        let mut agents = self.agents.write().await;
        let Some(agent) = agents.get_mut(agent_id) else {
            return Ok(());
        };
        agent.current_load = agent.current_load.saturating_sub(1);
        agent.refresh_status();
        let updated = agent.clone();
        self.repo.save(&updated).await?;
        debug!(agent_id, load = updated.current_load, "Slot released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryStore, StoreRepository};

    fn registry() -> AgentRegistry {
        AgentRegistry::new(Arc::new(StoreRepository::<AgentInfo>::new(Arc::new(
            InMemoryStore::new(),
        ))))
    }

    #[tokio::test]
    async fn test_slot_bounded_by_capacity() {
        let registry = registry();
        registry.register(AgentInfo::new("a", ["x"], 1)).await.unwrap();

        assert!(registry.try_acquire_slot("a").await.unwrap());
        assert!(!registry.try_acquire_slot("a").await.unwrap());
        let agent = registry.get("a").await.unwrap();
        assert_eq!(agent.current_load, 1);
        assert_eq!(agent.status, AgentStatus::Busy);

        registry.release_slot("a").await.unwrap();
        assert_eq!(registry.get("a").await.unwrap().status, AgentStatus::Available);
    }

    #[tokio::test]
    async fn test_offline_agent_takes_no_work() {
        let registry = registry();
        registry.register(AgentInfo::new("a", ["x"], 3)).await.unwrap();
        registry.set_status("a", AgentStatus::Offline).await.unwrap();

        assert!(!registry.try_acquire_slot("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_reregister_keeps_load() {
        let registry = registry();
        registry.register(AgentInfo::new("a", ["x"], 2)).await.unwrap();
        registry.try_acquire_slot("a").await.unwrap();

        let updated = registry.register(AgentInfo::new("a", ["x", "y"], 4)).await.unwrap();
        assert_eq!(updated.current_load, 1);
        assert_eq!(updated.capabilities.len(), 2);

        let err = registry.register(AgentInfo::new("b", ["x"], 0)).await.unwrap_err();
        assert!(matches!(err, CoordError::Validation(_)));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_never_exceeds_capacity() {
        let registry = Arc::new(registry());
        registry.register(AgentInfo::new("a", ["x"], 3)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move { registry.try_acquire_slot("a").await.unwrap() }));
        }
        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 3);
        assert_eq!(registry.get("a").await.unwrap().current_load, 3);
    }
}
