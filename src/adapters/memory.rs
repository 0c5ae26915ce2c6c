//! In-memory collaborators.
//!
//! Used by tests and by the `dispatch` command; nothing survives a restart.

use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::debug;

use crate::domain::{AuditEntry, Event};
use crate::error::Result;

use super::{AuditLogger, EventBus, StateStore};

#[derive(Default)]
pub struct InMemoryStore {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryAuditLogger {
    entries: RwLock<Vec<AuditEntry>>,
}

impl InMemoryAuditLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl AuditLogger for InMemoryAuditLogger {
    async fn append(&self, entry: AuditEntry) -> Result<()> {
        self.entries.write().await.push(entry);
        Ok(())
    }

    async fn get_audit_trail(&self, subject_id: &str) -> Result<Vec<AuditEntry>> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|e| e.subject_id == subject_id)
            .cloned()
            .collect())
    }
}

/// Event bus over a tokio broadcast channel
///
/// Keeps the most recent `capacity` events so callers without a live
/// subscription can still inspect what was published.
pub struct BroadcastEventBus {
    sender: broadcast::Sender<Event>,
    history: Mutex<VecDeque<Event>>,
    capacity: usize,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Retained events in publish order
    pub async fn events(&self) -> Vec<Event> {
        self.history.lock().await.iter().cloned().collect()
    }

    pub async fn events_for(&self, subject_id: &str) -> Vec<Event> {
        self.history
            .lock()
            .await
            .iter()
            .filter(|e| e.subject_id == subject_id)
            .cloned()
            .collect()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        {
            let mut history = self.history.lock().await;
            if history.len() == self.capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        if self.sender.send(event).is_err() {
            debug!("No subscribers listening to event");
        }
        Ok(())
    }
}
