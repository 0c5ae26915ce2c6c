//! Shared-capacity bookkeeping.
//!
//! Total capacity of a resource is fixed: `allocated + available` never
//! changes except through an explicit resize, and the sum of share amounts
//! always equals `allocated`.

use serde::{Deserialize, Serialize};

use super::agent::Priority;

/// One task's claim on a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationShare {
    pub agent_id: String,
    pub task_id: String,
    pub amount: u64,
    #[serde(default)]
    pub priority: Priority,
}

/// Bookkeeping for a single shared resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub resource_id: String,
    pub resource_type: String,
    pub allocated: u64,
    pub available: u64,
    pub unit: String,
    pub shares: Vec<AllocationShare>,
}

impl ResourceAllocation {
    pub fn new(
        resource_id: impl Into<String>,
        resource_type: impl Into<String>,
        capacity: u64,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            resource_type: resource_type.into(),
            allocated: 0,
            available: capacity,
            unit: unit.into(),
            shares: Vec::new(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.allocated + self.available
    }

    pub fn share_total(&self) -> u64 {
        self.shares.iter().map(|s| s.amount).sum()
    }

    pub fn share_for(&self, task_id: &str) -> Option<&AllocationShare> {
        self.shares.iter().find(|s| s.task_id == task_id)
    }

    /// Replace all shares and recompute the counters against `capacity`
    pub fn set_shares(&mut self, capacity: u64, shares: Vec<AllocationShare>) {
        self.shares = shares.into_iter().filter(|s| s.amount > 0).collect();
        self.allocated = self.share_total();
        self.available = capacity.saturating_sub(self.allocated);
    }

    /// Drop every share held by a task; returns the freed amount
    pub fn release_task(&mut self, task_id: &str) -> u64 {
        let before = self.allocated;
        let capacity = self.capacity();
        let shares = self
            .shares
            .drain(..)
            .filter(|s| s.task_id != task_id)
            .collect();
        self.set_shares(capacity, shares);
        before - self.allocated
    }
}

/// A requested claim considered during reallocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDemand {
    pub agent_id: String,
    pub task_id: String,
    pub amount: u64,
    #[serde(default)]
    pub priority: Priority,
}

/// Options for a reallocation pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReallocationConstraints {
    /// New or updated claims; a demand for a task replaces that task's share
    #[serde(default)]
    pub demands: Vec<ResourceDemand>,

    /// Resize the resource before allocating
    #[serde(default)]
    pub capacity: Option<u64>,

    /// Shrink lower-priority claims instead of evicting them outright
    #[serde(default = "default_allow_partial")]
    pub allow_partial: bool,
}

fn default_allow_partial() -> bool {
    true
}

impl Default for ReallocationConstraints {
    fn default() -> Self {
        Self {
            demands: Vec::new(),
            capacity: None,
            allow_partial: default_allow_partial(),
        }
    }
}
