//! Task coordinator.
//!
//! Places tasks on agents by score, keeps shared-resource claims within
//! capacity, turns dependency and capacity problems into conflicts with
//! suggested resolutions, and reports plan progress.
//!
//! Assignment changes are serialized through one lock so a task never has
//! two active assignments; agent load changes go through the registry's
//! compare-and-increment; each resource has its own single-writer lock.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::adapters::{EventBus, Filter, Pagination, Repository};
use crate::domain::audit::actions;
use crate::domain::{
    AgentInfo, AgentStatus, AllocationShare, AssignmentStatus, AuditEntry, AuditResult, Conflict,
    ConflictType, CoordinationResult, Event, EventType, ExecutionIssue, ExecutionProgress,
    Priority, ReallocationConstraints, Resolution, ResourceAllocation, RiskLevel, Severity,
    SuggestedAction, TaskAssignment, TaskSpec,
};
use crate::error::{CoordError, Result};

use super::conflict::{
    dependents_of, find_cycles, missing_dependencies, topological_order,
    DependencyGraph,
};
use super::registry::AgentRegistry;
use super::security::{PermissionTarget, SecurityAuditor};

/// Score boost per task priority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityBoosts {
    #[serde(default)]
    pub low: f64,
    #[serde(default = "default_normal_boost")]
    pub normal: f64,
    #[serde(default = "default_high_boost")]
    pub high: f64,
    #[serde(default = "default_critical_boost")]
    pub critical: f64,
}

fn default_normal_boost() -> f64 {
    0.1
}
fn default_high_boost() -> f64 {
    0.2
}
fn default_critical_boost() -> f64 {
    0.3
}

impl Default for PriorityBoosts {
    fn default() -> Self {
        Self {
            low: 0.0,
            normal: default_normal_boost(),
            high: default_high_boost(),
            critical: default_critical_boost(),
        }
    }
}

impl PriorityBoosts {
    pub fn for_priority(&self, priority: Priority) -> f64 {
        match priority {
            Priority::Low => self.low,
            Priority::Normal => self.normal,
            Priority::High => self.high,
            Priority::Critical => self.critical,
        }
    }
}

/// Weights for agent selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringPolicy {
    #[serde(default = "default_weight")]
    pub capability_weight: f64,
    #[serde(default = "default_weight")]
    pub load_weight: f64,
    #[serde(default)]
    pub specialization_weight: f64,
    #[serde(default)]
    pub priority_boost: PriorityBoosts,
    /// Expected run time for tasks that do not state one
    #[serde(default = "default_expected_duration_ms")]
    pub default_expected_duration_ms: u64,
}

fn default_weight() -> f64 {
    1.0
}
fn default_expected_duration_ms() -> u64 {
    300_000
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            capability_weight: default_weight(),
            load_weight: default_weight(),
            specialization_weight: 0.0,
            priority_boost: PriorityBoosts::default(),
            default_expected_duration_ms: default_expected_duration_ms(),
        }
    }
}

impl ScoringPolicy {
    /// capabilityMatch - loadPenalty + priorityBoost (+ optional specialization)
    pub fn score(&self, agent: &AgentInfo, task: &TaskSpec) -> f64 {
        self.capability_weight * agent.capability_match(&task.requirements)
            - self.load_weight * agent.utilization()
            + self.specialization_weight * agent.specialization(&task.requirements)
            + self.priority_boost.for_priority(task.priority)
    }

    pub fn is_eligible(agent: &AgentInfo, task: &TaskSpec) -> bool {
        agent.status != AgentStatus::Offline
            && agent.has_capacity()
            && agent.supports_all(&task.requirements)
    }
}

/// A coordination operation with its payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum CoordinationRequest {
    AssignTasks {
        plan_id: String,
        tasks: Vec<TaskSpec>,
        /// Restrict selection to these agents
        #[serde(default)]
        candidate_agents: Option<Vec<String>>,
    },
    ReallocateResources {
        resource_id: String,
        #[serde(default)]
        constraints: ReallocationConstraints,
    },
    ResolveConflict {
        conflicts: Vec<Conflict>,
        /// Task specs not (or no longer) held as assignments
        #[serde(default)]
        tasks: Vec<TaskSpec>,
    },
    MonitorExecution {
        plan_id: String,
    },
}

impl CoordinationRequest {
    /// Permission action and audit subject for this request
    fn permission(&self) -> (&'static str, String) {
        match self {
            Self::AssignTasks { plan_id, .. } => ("task:assign", format!("plan:{}", plan_id)),
            Self::ReallocateResources { resource_id, .. } => {
                ("resource:reallocate", format!("resource:{}", resource_id))
            }
            Self::ResolveConflict { .. } => ("plan:resolve_conflict", "plan:conflicts".to_string()),
            Self::MonitorExecution { plan_id } => ("plan:monitor", format!("plan:{}", plan_id)),
        }
    }
}

/// What unregistering an agent did to its work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnregisterOutcome {
    pub agent: AgentInfo,
    pub reassigned: Vec<TaskAssignment>,
    pub failed: Vec<TaskAssignment>,
    pub issues: Vec<ExecutionIssue>,
}

enum Selection {
    Agent(String),
    NoCapability,
    NoCapacity,
}

pub struct TaskCoordinator {
    registry: Arc<AgentRegistry>,
    tasks: Arc<dyn Repository<TaskAssignment>>,
    events: Arc<dyn EventBus>,
    auditor: Arc<SecurityAuditor>,
    policy: ScoringPolicy,
    assign_lock: Mutex<()>,
    resources: RwLock<HashMap<String, Arc<Mutex<ResourceAllocation>>>>,
}

impl TaskCoordinator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        tasks: Arc<dyn Repository<TaskAssignment>>,
        events: Arc<dyn EventBus>,
        auditor: Arc<SecurityAuditor>,
        policy: ScoringPolicy,
    ) -> Self {
        Self {
            registry,
            tasks,
            events,
            auditor,
            policy,
            assign_lock: Mutex::new(()),
            resources: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    /// Dispatch a coordination request; `actor` is checked when given
    pub async fn process(
        &self,
        request: CoordinationRequest,
        actor: Option<&str>,
    ) -> Result<CoordinationResult> {
        if let Some(user_id) = actor {
            let (action, subject) = request.permission();
            self.auditor
                .require_permission(user_id, &PermissionTarget::Resource(subject), action)
                .await?;
        }

        match request {
            CoordinationRequest::AssignTasks {
                plan_id,
                tasks,
                candidate_agents,
            } => {
                self.assign_tasks(&plan_id, tasks, candidate_agents.as_deref())
                    .await
            }
            CoordinationRequest::ReallocateResources {
                resource_id,
                constraints,
            } => self.reallocate_resources(&resource_id, constraints).await,
            CoordinationRequest::ResolveConflict { conflicts, tasks } => {
                self.resolve_conflict(&conflicts, &tasks).await
            }
            CoordinationRequest::MonitorExecution { plan_id } => {
                let progress = self.monitor_execution(&plan_id).await?;
                Ok(CoordinationResult {
                    progress: Some(progress),
                    ..Default::default()
                })
            }
        }
    }

    pub async fn register_agent(&self, agent: AgentInfo) -> Result<AgentInfo> {
        self.registry.register(agent).await
    }

    pub async fn get_agent_status(&self, agent_id: &str) -> Result<AgentInfo> {
        self.registry
            .get(agent_id)
            .await
            .ok_or_else(|| CoordError::not_found("Agent", agent_id))
    }

    pub async fn get_assignment(&self, task_id: &str) -> Result<TaskAssignment> {
        self.tasks
            .find_by_id(task_id)
            .await?
            .ok_or_else(|| CoordError::not_found("TaskAssignment", task_id))
    }

    /// Place each task on the best eligible agent, highest priority first
    #[instrument(skip(self, tasks, candidate_agents), fields(tasks = tasks.len()))]
    pub async fn assign_tasks(
        &self,
        plan_id: &str,
        mut tasks: Vec<TaskSpec>,
        candidate_agents: Option<&[String]>,
    ) -> Result<CoordinationResult> {
        if plan_id.trim().is_empty() {
            return Err(CoordError::Validation("plan_id is required".into()));
        }
        let mut seen = HashSet::new();
        for task in &tasks {
            if task.task_id.trim().is_empty() {
                return Err(CoordError::Validation("task_id is required".into()));
            }
            if !seen.insert(task.task_id.as_str()) {
                return Err(CoordError::Validation(format!(
                    "task '{}' appears more than once",
                    task.task_id
                )));
            }
        }

        let _guard = self.assign_lock.lock().await;
        let mut result = CoordinationResult::default();

        // Tasks that wait on each other inside the batch can never start
        let batch: DependencyGraph = tasks
            .iter()
            .map(|t| (t.task_id.clone(), t.dependencies.clone()))
            .collect();
        let mut in_cycle: BTreeSet<String> = BTreeSet::new();
        for cycle in find_cycles(&batch) {
            warn!(plan_id, ?cycle, "Dependency cycle in task batch");
            result.conflicts.push(Conflict::new(
                ConflictType::Dependency,
                cycle.clone(),
                Severity::High,
                format!("dependency cycle: {}", cycle.join(" -> ")),
            ));
            in_cycle.extend(cycle);
        }
        let waiting = dependents_of(&batch, &in_cycle);
        if !waiting.is_empty() {
            result.conflicts.push(Conflict::new(
                ConflictType::Dependency,
                waiting.iter().cloned().collect(),
                Severity::Medium,
                "tasks depend on a dependency cycle".to_string(),
            ));
        }
        let blocked: HashSet<String> = in_cycle.into_iter().chain(waiting).collect();

        // Stable: equal priorities keep submission order
        tasks.sort_by(|a, b| b.priority.cmp(&a.priority));

        for task in &tasks {
            if blocked.contains(&task.task_id) {
                continue;
            }

            if let Some(existing) = self.tasks.find_by_id(&task.task_id).await? {
                if existing.is_active() {
                    result.conflicts.push(Conflict::new(
                        ConflictType::Duplicate,
                        vec![task.task_id.clone()],
                        Severity::Low,
                        format!(
                            "task '{}' is already assigned to '{}'",
                            task.task_id, existing.agent_id
                        ),
                    ));
                    continue;
                }
            }

            match self.select_agent(task, candidate_agents).await? {
                Selection::Agent(agent_id) => {
                    let assignment = TaskAssignment::new(task, plan_id, &agent_id);
                    self.tasks.save(&assignment).await?;
                    info!(task_id = %task.task_id, agent_id = %agent_id, "Task assigned");
                    self.publish(
                        Event::entity(
                            &task.task_id,
                            EventType::TaskAssigned,
                            format!("Task '{}' assigned to '{}'", task.task_id, agent_id),
                        )
                        .with_data(json!({ "agent_id": agent_id, "plan_id": plan_id })),
                    )
                    .await;
                    result.assignments.push(assignment);
                }
                Selection::NoCapability => {
                    result.conflicts.push(Conflict::new(
                        ConflictType::Capability,
                        vec![task.task_id.clone()],
                        Severity::High,
                        format!(
                            "no agent has capabilities [{}]",
                            task.requirements.join(", ")
                        ),
                    ));
                }
                Selection::NoCapacity => {
                    result.conflicts.push(Conflict::new(
                        ConflictType::Capacity,
                        vec![task.task_id.clone()],
                        Severity::Medium,
                        "every capable agent is at capacity",
                    ));
                }
            }
        }

        debug!(
            plan_id,
            assigned = result.assignments.len(),
            conflicts = result.conflicts.len(),
            "Assignment pass finished"
        );
        Ok(result)
    }

    /// Pick the best eligible agent and take one of its slots
    async fn select_agent(&self, task: &TaskSpec, candidates: Option<&[String]>) -> Result<Selection> {
        loop {
            let pool = self.registry.snapshot(candidates).await;
            let eligible: Vec<&AgentInfo> = pool
                .iter()
                .filter(|a| ScoringPolicy::is_eligible(a, task))
                .collect();

            if eligible.is_empty() {
                let capable = pool
                    .iter()
                    .any(|a| a.status != AgentStatus::Offline && a.supports_all(&task.requirements));
                return Ok(if capable {
                    Selection::NoCapacity
                } else {
                    Selection::NoCapability
                });
            }

            let best = eligible.iter().max_by(|a, b| {
                self.policy
                    .score(a, task)
                    .total_cmp(&self.policy.score(b, task))
                    .then_with(|| b.current_load.cmp(&a.current_load))
                    .then_with(|| b.agent_id.cmp(&a.agent_id))
            });
            let Some(best) = best else {
                return Ok(Selection::NoCapacity);
            };

            // Load may have moved since the snapshot; retry with a fresh one
            if self.registry.try_acquire_slot(&best.agent_id).await? {
                return Ok(Selection::Agent(best.agent_id.clone()));
            }
        }
    }

    /// Remove an agent and move its active tasks to the remaining pool
    #[instrument(skip(self))]
    pub async fn unregister_agent(&self, agent_id: &str) -> Result<UnregisterOutcome> {
        let _guard = self.assign_lock.lock().await;
        let agent = self.registry.unregister(agent_id).await?;

        let mut active: Vec<TaskAssignment> = self
            .query_assignments(Filter::new().eq("agent_id", agent_id))
            .await?
            .into_iter()
            .filter(TaskAssignment::is_active)
            .collect();
        active.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.task_id.cmp(&b.task_id)));

        let mut outcome = UnregisterOutcome {
            agent,
            reassigned: Vec::new(),
            failed: Vec::new(),
            issues: Vec::new(),
        };

        for mut previous in active {
            let spec = previous.spec();
            match self.select_agent(&spec, None).await? {
                Selection::Agent(new_agent) => {
                    let assignment = TaskAssignment::new(&spec, previous.plan_id.clone(), &new_agent);
                    self.tasks.save(&assignment).await?;
                    info!(
                        task_id = %spec.task_id,
                        from = agent_id,
                        to = %new_agent,
                        "Task reassigned"
                    );
                    self.publish(
                        Event::entity(
                            &spec.task_id,
                            EventType::TaskReassigned,
                            format!("Task '{}' moved from '{}' to '{}'", spec.task_id, agent_id, new_agent),
                        )
                        .with_data(json!({
                            "from": agent_id,
                            "to": new_agent,
                            "plan_id": previous.plan_id,
                        })),
                    )
                    .await;
                    self.auditor
                        .audit_log()
                        .log_security_event(
                            AuditEntry::new(
                                &spec.task_id,
                                "system",
                                actions::TASK_REASSIGNED,
                                AuditResult::Success,
                                RiskLevel::Low,
                            )
                            .with_details(json!({ "from": agent_id, "to": new_agent })),
                        )
                        .await?;
                    let findings = self.auditor.detect_suspicious_activity(&spec.task_id).await?;
                    for finding in findings {
                        warn!(task_id = %spec.task_id, description = %finding.description, "Suspicious reassignment pattern");
                    }
                    outcome.reassigned.push(assignment);
                }
                Selection::NoCapability | Selection::NoCapacity => {
                    let now = Utc::now();
                    previous.status = AssignmentStatus::Failed;
                    previous.completed_at = Some(now);
                    previous.updated_at = now;
                    self.tasks.save(&previous).await?;
                    warn!(task_id = %spec.task_id, "No eligible agent left, task failed");
                    self.publish(
                        Event::entity(
                            &spec.task_id,
                            EventType::TaskFailed,
                            format!("Task '{}' lost agent '{}'", spec.task_id, agent_id),
                        )
                        .with_data(json!({ "plan_id": previous.plan_id })),
                    )
                    .await;
                    outcome.issues.push(ExecutionIssue {
                        task_id: spec.task_id.clone(),
                        agent_id: Some(agent_id.to_string()),
                        severity: Severity::High,
                        description: format!(
                            "agent '{}' unregistered and no eligible agent remains",
                            agent_id
                        ),
                        suggested_action: SuggestedAction::Reassign,
                    });
                    outcome.failed.push(previous);
                }
            }
        }

        Ok(outcome)
    }

    /// assigned -> in_progress
    pub async fn start_task(&self, task_id: &str) -> Result<TaskAssignment> {
        self.transition_task(task_id, AssignmentStatus::InProgress).await
    }

    /// in_progress -> completed; frees the agent slot
    pub async fn complete_task(&self, task_id: &str) -> Result<TaskAssignment> {
        self.transition_task(task_id, AssignmentStatus::Completed).await
    }

    /// assigned|in_progress -> failed; frees the agent slot
    pub async fn fail_task(&self, task_id: &str, reason: &str) -> Result<TaskAssignment> {
        let assignment = self.transition_task(task_id, AssignmentStatus::Failed).await?;
        warn!(task_id, reason, "Task failed");
        Ok(assignment)
    }

    async fn transition_task(&self, task_id: &str, next: AssignmentStatus) -> Result<TaskAssignment> {
        let _guard = self.assign_lock.lock().await;
        let mut assignment = self.get_assignment(task_id).await?;

        let allowed = matches!(
            (assignment.status, next),
            (AssignmentStatus::Assigned, AssignmentStatus::InProgress)
                | (AssignmentStatus::Assigned, AssignmentStatus::Failed)
                | (AssignmentStatus::InProgress, AssignmentStatus::Completed)
                | (AssignmentStatus::InProgress, AssignmentStatus::Failed)
        );
        if !allowed {
            return Err(CoordError::transition(assignment.status, next));
        }

        let now = Utc::now();
        assignment.status = next;
        assignment.updated_at = now;
        let event_type = match next {
            AssignmentStatus::InProgress => {
                assignment.started_at = Some(now);
                EventType::TaskStarted
            }
            AssignmentStatus::Completed => {
                assignment.completed_at = Some(now);
                EventType::TaskCompleted
            }
            _ => {
                assignment.completed_at = Some(now);
                EventType::TaskFailed
            }
        };
        self.tasks.save(&assignment).await?;
        if !assignment.is_active() {
            self.registry.release_slot(&assignment.agent_id).await?;
        }

        self.publish(Event::entity(
            task_id,
            event_type,
            format!("Task '{}' {}", task_id, next),
        ))
        .await;
        Ok(assignment)
    }

    /// Drop every active assignment of a plan and free the slots
    pub async fn release_plan(&self, plan_id: &str) -> Result<usize> {
        let _guard = self.assign_lock.lock().await;
        let active: Vec<TaskAssignment> = self
            .query_assignments(Filter::new().eq("plan_id", plan_id))
            .await?
            .into_iter()
            .filter(TaskAssignment::is_active)
            .collect();

        for assignment in &active {
            self.tasks.delete(&assignment.task_id).await?;
            self.registry.release_slot(&assignment.agent_id).await?;
            self.release_task_claims(&assignment.task_id).await;
        }
        info!(plan_id, released = active.len(), "Plan assignments released");
        Ok(active.len())
    }

    async fn release_task_claims(&self, task_id: &str) {
        let cells: Vec<Arc<Mutex<ResourceAllocation>>> =
            self.resources.read().await.values().cloned().collect();
        for cell in cells {
            let freed = cell.lock().await.release_task(task_id);
            if freed > 0 {
                debug!(task_id, freed, "Resource claim released");
            }
        }
    }

    /// Track a shared resource with a fixed capacity
    pub async fn register_resource(
        &self,
        resource_id: &str,
        resource_type: &str,
        capacity: u64,
        unit: &str,
    ) -> Result<ResourceAllocation> {
        if resource_id.trim().is_empty() {
            return Err(CoordError::Validation("resource_id is required".into()));
        }
        let mut resources = self.resources.write().await;
        if resources.contains_key(resource_id) {
            return Err(CoordError::Validation(format!(
                "resource '{}' is already registered",
                resource_id
            )));
        }
        let allocation = ResourceAllocation::new(resource_id, resource_type, capacity, unit);
        resources.insert(
            resource_id.to_string(),
            Arc::new(Mutex::new(allocation.clone())),
        );
        info!(resource_id, capacity, "Resource registered");
        Ok(allocation)
    }

    pub async fn get_resource(&self, resource_id: &str) -> Result<ResourceAllocation> {
        let cell = self.resource_cell(resource_id).await?;
        let allocation = cell.lock().await.clone();
        Ok(allocation)
    }

    async fn resource_cell(&self, resource_id: &str) -> Result<Arc<Mutex<ResourceAllocation>>> {
        self.resources
            .read()
            .await
            .get(resource_id)
            .cloned()
            .ok_or_else(|| CoordError::not_found("Resource", resource_id))
    }

    /// Recompute claims on a resource in priority order
    ///
    /// Demands replace the claim of the same task. When claims exceed
    /// capacity the lowest-priority ones are shrunk (if partial grants are
    /// allowed) or evicted, and each affected task gets a resource conflict.
    pub async fn reallocate_resources(
        &self,
        resource_id: &str,
        constraints: ReallocationConstraints,
    ) -> Result<CoordinationResult> {
        let cell = self.resource_cell(resource_id).await?;
        let mut allocation = cell.lock().await;

        let capacity = constraints.capacity.unwrap_or_else(|| allocation.capacity());

        let mut claims: Vec<AllocationShare> = allocation.shares.clone();
        for demand in constraints.demands {
            let share = AllocationShare {
                agent_id: demand.agent_id,
                task_id: demand.task_id,
                amount: demand.amount,
                priority: demand.priority,
            };
            match claims.iter_mut().find(|c| c.task_id == share.task_id) {
                Some(existing) => *existing = share,
                None => claims.push(share),
            }
        }
        claims.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut result = CoordinationResult::default();
        let mut remaining = capacity;
        let mut granted = Vec::with_capacity(claims.len());
        for mut claim in claims {
            let requested = claim.amount;
            if requested <= remaining {
                remaining -= requested;
            } else if constraints.allow_partial && remaining > 0 {
                claim.amount = remaining;
                remaining = 0;
                result.conflicts.push(Conflict::new(
                    ConflictType::Resource,
                    vec![claim.task_id.clone()],
                    Severity::Medium,
                    format!(
                        "claim on '{}' shrunk from {} to {} {}",
                        resource_id, requested, claim.amount, allocation.unit
                    ),
                ));
            } else {
                claim.amount = 0;
                result.conflicts.push(Conflict::new(
                    ConflictType::Resource,
                    vec![claim.task_id.clone()],
                    Severity::High,
                    format!(
                        "claim of {} {} on '{}' evicted",
                        requested, allocation.unit, resource_id
                    ),
                ));
            }
            granted.push(claim);
        }

        allocation.set_shares(capacity, granted);
        info!(
            resource_id,
            allocated = allocation.allocated,
            available = allocation.available,
            conflicts = result.conflicts.len(),
            "Resources reallocated"
        );

        self.publish(
            Event::entity(
                resource_id,
                EventType::ResourceReallocated,
                format!(
                    "Resource '{}' allocated {}/{} {}",
                    resource_id, allocation.allocated, capacity, allocation.unit
                ),
            )
            .with_data(json!({
                "allocated": allocation.allocated,
                "available": allocation.available,
            })),
        )
        .await;

        result.allocation = Some(allocation.clone());
        Ok(result)
    }

    /// Suggest (or report) how to clear each conflict
    pub async fn resolve_conflict(
        &self,
        conflicts: &[Conflict],
        extra_tasks: &[TaskSpec],
    ) -> Result<CoordinationResult> {
        let mut graph: DependencyGraph = BTreeMap::new();
        let mut priorities: HashMap<String, Priority> = HashMap::new();
        for assignment in self.query_assignments(Filter::new()).await? {
            priorities.insert(assignment.task_id.clone(), assignment.priority);
            graph.insert(assignment.task_id, assignment.dependencies);
        }
        for task in extra_tasks {
            priorities.insert(task.task_id.clone(), task.priority);
            graph.insert(task.task_id.clone(), task.dependencies.clone());
        }

        let mut result = CoordinationResult::default();
        for conflict in conflicts {
            let id = conflict.conflict_id;
            match conflict.conflict_type {
                ConflictType::Dependency | ConflictType::Timing => {
                    let scope = reachable(&graph, &conflict.task_ids);
                    let mut resolved = false;

                    if conflict.conflict_type == ConflictType::Dependency {
                        for (task_id, missing) in missing_dependencies(&scope) {
                            result.resolutions.push(Resolution::MissingDependency {
                                conflict_id: id,
                                task_id,
                                missing,
                            });
                            resolved = true;
                        }
                    }

                    match topological_order(&scope, &priorities) {
                        Err(cycle) => {
                            result.resolutions.push(Resolution::BreakCycle {
                                conflict_id: id,
                                cycle,
                            });
                        }
                        Ok(order) if conflict.conflict_type == ConflictType::Timing || !resolved => {
                            result.resolutions.push(Resolution::Resequence {
                                conflict_id: id,
                                order,
                            });
                        }
                        Ok(_) => {}
                    }
                }
                ConflictType::Resource => result.resolutions.push(Resolution::RebalanceResource {
                    conflict_id: id,
                    task_ids: conflict.task_ids.clone(),
                }),
                ConflictType::Capability | ConflictType::Capacity => {
                    result.resolutions.push(Resolution::AwaitCapacity {
                        conflict_id: id,
                        task_ids: conflict.task_ids.clone(),
                    })
                }
                ConflictType::Duplicate => result.resolutions.push(Resolution::NoAction {
                    conflict_id: id,
                    reason: "task already has an active assignment".to_string(),
                }),
            }
        }
        Ok(result)
    }

    /// Progress of a plan as of now
    pub async fn monitor_execution(&self, plan_id: &str) -> Result<ExecutionProgress> {
        self.monitor_execution_at(plan_id, Utc::now()).await
    }

    /// Progress of a plan, flagging tasks with no status change for longer than expected
    pub async fn monitor_execution_at(
        &self,
        plan_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ExecutionProgress> {
        let mut assignments = self
            .query_assignments(Filter::new().eq("plan_id", plan_id))
            .await?;
        if assignments.is_empty() {
            return Err(CoordError::not_found("Plan", plan_id));
        }
        assignments.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        let mut progress = ExecutionProgress::from_assignments(plan_id, &assignments);

        for assignment in &assignments {
            match assignment.status {
                AssignmentStatus::Failed => progress.issues.push(ExecutionIssue {
                    task_id: assignment.task_id.clone(),
                    agent_id: Some(assignment.agent_id.clone()),
                    severity: Severity::High,
                    description: "task failed".to_string(),
                    suggested_action: SuggestedAction::Reassign,
                }),
                AssignmentStatus::Assigned | AssignmentStatus::InProgress => {
                    let expected = assignment
                        .expected_duration_ms
                        .unwrap_or(self.policy.default_expected_duration_ms);
                    let idle_ms = (now - assignment.updated_at).num_milliseconds().max(0) as u64;
                    if idle_ms <= expected {
                        continue;
                    }

                    let agent_online = self
                        .registry
                        .get(&assignment.agent_id)
                        .await
                        .map(|a| a.status != AgentStatus::Offline)
                        .unwrap_or(false);
                    let suggested_action =
                        if agent_online && assignment.status == AssignmentStatus::InProgress {
                            SuggestedAction::ExtendTimeout
                        } else {
                            SuggestedAction::Reassign
                        };
                    let severity = if idle_ms > expected.saturating_mul(2) {
                        Severity::High
                    } else {
                        Severity::Medium
                    };
                    progress.issues.push(ExecutionIssue {
                        task_id: assignment.task_id.clone(),
                        agent_id: Some(assignment.agent_id.clone()),
                        severity,
                        description: format!(
                            "no status change for {}ms (expected {}ms)",
                            idle_ms, expected
                        ),
                        suggested_action,
                    });
                }
                AssignmentStatus::Completed => {}
            }
        }

        Ok(progress)
    }

    async fn query_assignments(&self, filter: Filter) -> Result<Vec<TaskAssignment>> {
        let page = self
            .tasks
            .query(
                &filter,
                Pagination {
                    offset: 0,
                    limit: usize::MAX,
                },
            )
            .await?;
        Ok(page.items)
    }

    async fn publish(&self, event: Event) {
        if let Err(err) = self.events.publish(event).await {
            warn!(error = %err, "Failed to publish coordination event");
        }
    }
}

/// Subgraph reachable from `roots` through dependency edges
fn reachable(graph: &DependencyGraph, roots: &[String]) -> DependencyGraph {
    let mut scope = DependencyGraph::new();
    let mut stack: Vec<String> = roots.to_vec();
    while let Some(task) = stack.pop() {
        if scope.contains_key(&task) {
            continue;
        }
        let deps = graph.get(&task).cloned().unwrap_or_default();
        stack.extend(deps.iter().filter(|d| graph.contains_key(*d)).cloned());
        scope.insert(task, deps);
    }
    scope
}
