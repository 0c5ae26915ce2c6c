//! Collaborator interfaces consumed by the core.
//!
//! The core never embeds persistence, audit storage, or event delivery. It
//! talks to them through the traits here; in-memory implementations back the
//! tests and the JSONL implementations back the CLI.

pub mod jsonl;
pub mod memory;

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::audit::actions;
use crate::domain::{
    AgentInfo, AuditEntry, AuditResult, ConfirmRequest, Event, TaskAssignment,
};
use crate::error::{CoordError, Result};

pub use jsonl::{JsonlAuditLog, JsonlEventLog};
pub use memory::{BroadcastEventBus, InMemoryAuditLogger, InMemoryStore};

/// Key/value store for JSON documents
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Returns true if the key existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Keys starting with `prefix`, sorted
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// A persistable aggregate
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn entity_id(&self) -> String;
}

impl Entity for ConfirmRequest {
    const KIND: &'static str = "ConfirmRequest";

    fn entity_id(&self) -> String {
        self.confirm_id.to_string()
    }
}

impl Entity for AgentInfo {
    const KIND: &'static str = "Agent";

    fn entity_id(&self) -> String {
        self.agent_id.clone()
    }
}

impl Entity for TaskAssignment {
    const KIND: &'static str = "Task";

    fn entity_id(&self) -> String {
        self.task_id.clone()
    }
}

/// Equality match on top-level serialized fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter(pub BTreeMap<String, Value>);

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn matches(&self, document: &Value) -> bool {
        self.0
            .iter()
            .all(|(field, expected)| document.get(field) == Some(expected))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: default_limit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

/// CRUD over one aggregate type
#[async_trait]
pub trait Repository<T: Entity>: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<T>>;

    async fn save(&self, entity: &T) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<bool>;

    async fn query(&self, filter: &Filter, pagination: Pagination) -> Result<Page<T>>;
}

/// Repository over any [`StateStore`], keyed `{KIND}/{id}`
pub struct StoreRepository<T> {
    store: Arc<dyn StateStore>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> StoreRepository<T> {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            _entity: PhantomData,
        }
    }

    fn key(id: &str) -> String {
        format!("{}/{}", T::KIND, id)
    }
}

#[async_trait]
impl<T: Entity> Repository<T> for StoreRepository<T> {
    async fn find_by_id(&self, id: &str) -> Result<Option<T>> {
        match self.store.get(&Self::key(id)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, entity: &T) -> Result<()> {
        let value = serde_json::to_value(entity)?;
        self.store.set(&Self::key(&entity.entity_id()), value).await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.store.delete(&Self::key(id)).await
    }

    async fn query(&self, filter: &Filter, pagination: Pagination) -> Result<Page<T>> {
        let prefix = format!("{}/", T::KIND);
        let mut matched = Vec::new();
        for key in self.store.keys(&prefix).await? {
            let Some(value) = self.store.get(&key).await? else {
                continue;
            };
            if filter.matches(&value) {
                matched.push(value);
            }
        }
        let total = matched.len();
        let items = matched
            .into_iter()
            .skip(pagination.offset)
            .take(pagination.limit)
            .map(serde_json::from_value)
            .collect::<std::result::Result<Vec<T>, _>>()?;
        Ok(Page {
            items,
            total,
            offset: pagination.offset,
            limit: pagination.limit,
        })
    }
}

/// Append-only audit storage
#[async_trait]
pub trait AuditLogger: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> Result<()>;

    /// Every entry about `subject_id`, oldest first
    async fn get_audit_trail(&self, subject_id: &str) -> Result<Vec<AuditEntry>>;

    async fn log_security_event(&self, entry: AuditEntry) -> Result<()> {
        self.append(entry).await
    }

    /// Recorded as a failed `security_violation` regardless of the entry's action
    async fn log_security_violation(&self, mut entry: AuditEntry) -> Result<()> {
        if entry.action != actions::SECURITY_VIOLATION {
            let attempted = std::mem::replace(&mut entry.action, actions::SECURITY_VIOLATION.into());
            if let Value::Object(ref mut map) = entry.details {
                map.insert("attempted_action".into(), Value::String(attempted));
            } else {
                entry.details = serde_json::json!({ "attempted_action": attempted });
            }
        }
        entry.result = AuditResult::Failure;
        self.append(entry).await
    }

    async fn log_approval_action(&self, entry: AuditEntry) -> Result<()> {
        self.append(entry).await
    }
}

/// Lifecycle event sink; delivery is at-least-once
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: Event) -> Result<()>;
}

/// Publishes to several buses in order; the first failure is returned after all were tried
pub struct FanoutEventBus {
    buses: Vec<Arc<dyn EventBus>>,
}

impl FanoutEventBus {
    pub fn new(buses: Vec<Arc<dyn EventBus>>) -> Self {
        Self { buses }
    }
}

#[async_trait]
impl EventBus for FanoutEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        let mut first_error: Option<CoordError> = None;
        for bus in &self.buses {
            if let Err(err) = bus.publish(event.clone()).await {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
