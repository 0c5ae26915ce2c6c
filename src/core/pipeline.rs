//! Pipeline definitions and loading.
//!
//! Pipelines are defined in YAML and consist of named stages, each handled by
//! a registered stage handler, plus the execution options that govern retry,
//! concurrency, and failure handling.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{CoordError, Result};

use super::circuit::CircuitBreakerConfig;

/// A complete pipeline definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name (used in CLI)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Execution options for this pipeline
    #[serde(default)]
    pub options: ExecutionOptions,

    /// Stages in declared order
    pub stages: Vec<StageSpec>,
}

impl PipelineConfig {
    pub fn new(name: impl Into<String>, stages: Vec<StageSpec>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            options: ExecutionOptions::default(),
            stages,
        }
    }

    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    /// Load a pipeline from a YAML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a pipeline from YAML content
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline YAML")
    }

    /// Validate the pipeline definition
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(CoordError::Validation("Pipeline name cannot be empty".into()));
        }

        if self.stages.is_empty() {
            return Err(CoordError::Validation(
                "Pipeline must have at least one stage".into(),
            ));
        }

        if self.options.max_concurrent_executions == 0 {
            return Err(CoordError::Validation(
                "max_concurrent_executions must be at least 1".into(),
            ));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.name.is_empty() {
                return Err(CoordError::Validation(format!("Stage {} has an empty name", i)));
            }

            // Dependencies must be declared earlier, which also rules out cycles
            for dep in &stage.depends_on {
                if !seen.contains(dep.as_str()) {
                    let reason = if self.stage(dep).is_some() {
                        "a later stage (forward references not allowed)"
                    } else {
                        "a non-existent stage"
                    };
                    return Err(CoordError::Validation(format!(
                        "Stage '{}' depends on {} '{}'",
                        stage.name, reason, dep
                    )));
                }
            }

            if !seen.insert(stage.name.as_str()) {
                return Err(CoordError::Validation(format!(
                    "Duplicate stage name '{}'",
                    stage.name
                )));
            }

            if let Some(policy) = &stage.retry_policy {
                policy.validate()?;
            }
        }

        self.options.retry_policy.validate()
    }

    /// Get a stage by name
    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Group stages into layers; every stage's dependencies sit in earlier layers
    pub fn layers(&self) -> Result<Vec<Vec<String>>> {
        self.validate()?;

        let mut depth: HashMap<&str, usize> = HashMap::new();
        let mut layers: Vec<Vec<String>> = Vec::new();
        for stage in &self.stages {
            let level = stage
                .depends_on
                .iter()
                .filter_map(|d| depth.get(d.as_str()))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(stage.name.as_str(), level);
            if layers.len() <= level {
                layers.resize_with(level + 1, Vec::new);
            }
            layers[level].push(stage.name.clone());
        }
        Ok(layers)
    }

    /// Execution plan: dependency layers when parallel, one stage per layer otherwise
    pub fn plan(&self) -> Result<Vec<Vec<String>>> {
        if self.options.parallel_execution {
            self.layers()
        } else {
            self.validate()?;
            Ok(self.stages.iter().map(|s| vec![s.name.clone()]).collect())
        }
    }
}

/// Options that govern one workflow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOptions {
    /// Run independent stages concurrently
    #[serde(default)]
    pub parallel_execution: bool,

    /// Upper bound on concurrently running stages
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_executions: usize,

    /// Default per-stage timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Default retry policy
    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Keep running independent stages after a failure
    #[serde(default)]
    pub continue_on_error: bool,

    /// Compensate completed stages in reverse order after a failure
    #[serde(default)]
    pub rollback_on_failure: bool,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

fn default_max_concurrent() -> usize {
    4
}
fn default_timeout_ms() -> u64 {
    30000
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            parallel_execution: false,
            max_concurrent_executions: default_max_concurrent(),
            timeout_ms: default_timeout_ms(),
            retry_policy: RetryPolicy::default(),
            continue_on_error: false,
            rollback_on_failure: false,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// A single stage in a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Stage name (unique within pipeline)
    pub name: String,

    /// Handler to run; also the stage type for circuit breaking (defaults to the name)
    #[serde(default)]
    pub handler: Option<String>,

    /// Stages that must complete first
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Override timeout for this stage
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Override retry policy for this stage
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,

    /// Static parameters handed to the handler
    #[serde(default)]
    pub params: serde_json::Value,
}

impl StageSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handler: None,
            depends_on: Vec::new(),
            timeout_ms: None,
            retry_policy: None,
            params: serde_json::Value::Null,
        }
    }

    pub fn handled_by(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    pub fn after(mut self, stage: impl Into<String>) -> Self {
        self.depends_on.push(stage.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Stage type used for handler lookup and breaker bookkeeping
    pub fn handler_name(&self) -> &str {
        self.handler.as_deref().unwrap_or(&self.name)
    }

    /// Get the effective timeout for this stage
    pub fn timeout(&self, options: &ExecutionOptions) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(options.timeout_ms))
    }

    pub fn effective_retry<'a>(&'a self, options: &'a ExecutionOptions) -> &'a RetryPolicy {
        self.retry_policy.as_ref().unwrap_or(&options.retry_policy)
    }
}

/// Retry policy for failed stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay after the first failed attempt in milliseconds
    #[serde(default = "default_delay", alias = "initial_delay_ms")]
    pub delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after a failed attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.delay_ms.min(self.max_delay_ms));
        }

        let delay = self.delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(CoordError::Validation("max_attempts must be at least 1".into()));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(CoordError::Validation(
                "backoff_multiplier must be a finite number >= 1.0".into(),
            ));
        }
        Ok(())
    }
}
