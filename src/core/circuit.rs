//! Per-stage-type circuit breakers.
//!
//! Consecutive handler failures for one stage type open the circuit; while
//! open, invocations are short-circuited without calling the handler. After
//! the cool-down a limited number of trial calls are let through (half-open):
//! a success closes the circuit, a failure re-opens it.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time the circuit stays open before trial calls
    #[serde(default = "default_cool_down_ms")]
    pub cool_down_ms: u64,

    /// Trial calls allowed while half-open
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

fn default_enabled() -> bool {
    true
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_cool_down_ms() -> u64 {
    30000
}
fn default_half_open_max_calls() -> u32 {
    1
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            failure_threshold: default_failure_threshold(),
            cool_down_ms: default_cool_down_ms(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_calls: u32,
}

impl Breaker {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_calls: 0,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.trial_calls = 0;
    }
}

/// Breakers keyed by stage type, shared across executions
#[derive(Debug, Default)]
pub struct CircuitBreakers {
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl CircuitBreakers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask permission to invoke the handler for `stage_type`
    pub async fn try_acquire(&self, stage_type: &str, config: &CircuitBreakerConfig) -> bool {
        if !config.enabled {
            return true;
        }

        let mut breakers = self.breakers.lock().await;
        let breaker = breakers
            .entry(stage_type.to_string())
            .or_insert_with(Breaker::closed);

        if breaker.state == CircuitState::Open {
            let cooled = breaker
                .opened_at
                .map(|at| at.elapsed() >= Duration::from_millis(config.cool_down_ms))
                .unwrap_or(true);
            if !cooled {
                return false;
            }
            info!(stage_type, "Circuit half-open, allowing trial calls");
            breaker.state = CircuitState::HalfOpen;
            breaker.trial_calls = 0;
        }

        match breaker.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen if breaker.trial_calls < config.half_open_max_calls => {
                breaker.trial_calls += 1;
                true
            }
            _ => false,
        }
    }

    pub async fn record_success(&self, stage_type: &str) {
        let mut breakers = self.breakers.lock().await;
        if let Some(breaker) = breakers.get_mut(stage_type) {
            if breaker.state != CircuitState::Closed {
                info!(stage_type, "Circuit closed");
            }
            *breaker = Breaker::closed();
        }
    }

    pub async fn record_failure(&self, stage_type: &str, config: &CircuitBreakerConfig) {
        if !config.enabled {
            return;
        }

        let mut breakers = self.breakers.lock().await;
        let breaker = breakers
            .entry(stage_type.to_string())
            .or_insert_with(Breaker::closed);

        match breaker.state {
            CircuitState::HalfOpen => {
                warn!(stage_type, "Trial call failed, circuit re-opened");
                breaker.open();
            }
            CircuitState::Closed => {
                breaker.consecutive_failures += 1;
                if breaker.consecutive_failures >= config.failure_threshold {
                    warn!(
                        stage_type,
                        failures = breaker.consecutive_failures,
                        "Circuit opened"
                    );
                    breaker.open();
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn state(&self, stage_type: &str) -> CircuitState {
        self.breakers
            .lock()
            .await
            .get(stage_type)
            .map(|b| b.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Close every breaker
    pub async fn reset(&self) {
        self.breakers.lock().await.clear();
    }
}
