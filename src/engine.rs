//! Composition root.
//!
//! Builds the store, audit log, event bus, security auditor, coordinator,
//! approval gate and stage pipeline once, wires the built-in stage handlers,
//! and hands out the pieces. Nothing in the crate reaches for a global.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::adapters::{
    AuditLogger, BroadcastEventBus, EventBus, FanoutEventBus, InMemoryAuditLogger, InMemoryStore,
    JsonlAuditLog, JsonlEventLog, StateStore, StoreRepository,
};
use crate::config::{Config, Settings};
use crate::core::{
    AgentRegistry, ApprovalGate, ConfirmStage, PassthroughStage, PipelineConfig, PlanStage,
    SecurityAuditor, StageHandler, StagePipeline, TaskCoordinator,
};
use crate::domain::{AgentInfo, ConfirmRequest, TaskAssignment, WorkflowExecution};
use crate::error::{CoordError, Result};
use crate::protocol::Dispatcher;

pub struct EngineBuilder {
    settings: Settings,
    store: Option<Arc<dyn StateStore>>,
    audit: Option<Arc<dyn AuditLogger>>,
    event_log: Option<Arc<JsonlEventLog>>,
    handlers: Vec<(String, Arc<dyn StageHandler>)>,
}

impl EngineBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            store: None,
            audit: None,
            event_log: None,
            handlers: Vec::new(),
        }
    }

    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn audit_log(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Also append every event to per-subject JSONL files
    pub fn event_log(mut self, log: Arc<JsonlEventLog>) -> Self {
        self.event_log = Some(log);
        self
    }

    /// Register an extra stage handler (or replace a built-in one)
    pub fn handler(mut self, stage_type: impl Into<String>, handler: Arc<dyn StageHandler>) -> Self {
        self.handlers.push((stage_type.into(), handler));
        self
    }

    pub fn build(self) -> Engine {
        let settings = self.settings;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()) as Arc<dyn StateStore>);
        let audit = self
            .audit
            .unwrap_or_else(|| Arc::new(InMemoryAuditLogger::new()) as Arc<dyn AuditLogger>);

        let broadcast = Arc::new(BroadcastEventBus::new(settings.events.broadcast_capacity));
        let bus: Arc<dyn EventBus> = match &self.event_log {
            Some(log) => Arc::new(FanoutEventBus::new(vec![
                broadcast.clone() as Arc<dyn EventBus>,
                log.clone() as Arc<dyn EventBus>,
            ])),
            None => broadcast.clone(),
        };

        let confirms = Arc::new(StoreRepository::<ConfirmRequest>::new(store.clone()));
        let auditor = Arc::new(SecurityAuditor::new(
            settings.security.clone(),
            confirms.clone(),
            audit.clone(),
        ));
        let registry = Arc::new(AgentRegistry::new(Arc::new(
            StoreRepository::<AgentInfo>::new(store.clone()),
        )));
        let coordinator = Arc::new(TaskCoordinator::new(
            registry.clone(),
            Arc::new(StoreRepository::<TaskAssignment>::new(store.clone())),
            bus.clone(),
            auditor.clone(),
            settings.scoring.clone(),
        ));
        let gate = Arc::new(ApprovalGate::new(
            confirms,
            auditor.clone(),
            bus.clone(),
            settings.approval.clone(),
        ));

        let mut pipeline = StagePipeline::new(bus.clone())
            .with_handler("plan", Arc::new(PlanStage::new(coordinator.clone())))
            .with_handler("confirm", Arc::new(ConfirmStage::new(gate.clone())))
            .with_handler("passthrough", Arc::new(PassthroughStage));
        for (stage_type, handler) in self.handlers {
            pipeline.register(stage_type, handler);
        }

        Engine {
            settings,
            broadcast,
            event_log: self.event_log,
            audit,
            auditor,
            registry,
            coordinator,
            gate,
            pipeline,
        }
    }
}

pub struct Engine {
    settings: Settings,
    broadcast: Arc<BroadcastEventBus>,
    event_log: Option<Arc<JsonlEventLog>>,
    audit: Arc<dyn AuditLogger>,
    auditor: Arc<SecurityAuditor>,
    registry: Arc<AgentRegistry>,
    coordinator: Arc<TaskCoordinator>,
    gate: Arc<ApprovalGate>,
    pipeline: StagePipeline,
}

impl Engine {
    pub fn builder(settings: Settings) -> EngineBuilder {
        EngineBuilder::new(settings)
    }

    /// Everything in memory; nothing touches the filesystem
    pub fn in_memory(settings: Settings) -> Self {
        EngineBuilder::new(settings).build()
    }

    /// Engine backed by the JSONL event and audit logs under the config home
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let audit = JsonlAuditLog::open(config.audit_log_path())
            .await
            .context("Failed to open audit log")?;
        let mut builder = EngineBuilder::new(config.settings.clone()).audit_log(Arc::new(audit));
        if config.settings.events.jsonl {
            let log = JsonlEventLog::open(config.events_dir())
                .await
                .context("Failed to open event log")?;
            builder = builder.event_log(Arc::new(log));
        }
        info!(home = %config.home.display(), "Engine opened");
        Ok(builder.build())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn events(&self) -> &Arc<BroadcastEventBus> {
        &self.broadcast
    }

    pub fn event_log(&self) -> Option<&Arc<JsonlEventLog>> {
        self.event_log.as_ref()
    }

    pub fn audit_log(&self) -> &Arc<dyn AuditLogger> {
        &self.audit
    }

    pub fn auditor(&self) -> &Arc<SecurityAuditor> {
        &self.auditor
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<TaskCoordinator> {
        &self.coordinator
    }

    pub fn gate(&self) -> &Arc<ApprovalGate> {
        &self.gate
    }

    pub fn pipeline(&self) -> &StagePipeline {
        &self.pipeline
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.gate.clone(), self.coordinator.clone())
    }

    /// Run a pipeline under a fresh workflow id
    pub async fn run(&self, config: &PipelineConfig, input: Value) -> Result<WorkflowExecution> {
        let workflow_id = Uuid::new_v4().to_string();
        self.pipeline.execute(&workflow_id, config, input).await
    }

    /// Re-run a workflow from its JSONL history, skipping completed stages
    pub async fn resume(
        &self,
        workflow_id: &str,
        config: &PipelineConfig,
        input: Value,
    ) -> Result<WorkflowExecution> {
        let log = self.event_log.as_ref().ok_or_else(|| {
            CoordError::Validation("resume needs the JSONL event log enabled".into())
        })?;
        let history = log.replay(workflow_id).await?;
        if history.is_empty() {
            return Err(CoordError::not_found("Workflow", workflow_id));
        }
        self.pipeline
            .resume(workflow_id, config, input, &history)
            .await
    }

    /// Expire overdue and escalate stalled confirm requests
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<(usize, usize)> {
        let expired = self.gate.expire_overdue(now).await?;
        let escalated = self.gate.escalate_stalled(now).await?;
        Ok((expired.len(), escalated.len()))
    }
}
