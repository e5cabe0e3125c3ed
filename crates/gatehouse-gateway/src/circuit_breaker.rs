//! Per-target circuit breakers.
//!
//! States:
//! - Closed: calls pass; consecutive failures are counted.
//! - Open: calls are rejected until the recovery timeout has elapsed since the
//!   last failure.
//! - HalfOpen: a bounded number of trial calls test the target.

use dashmap::DashMap;
use gatehouse_core::{GatewayError, GatewayResult, SharedClock};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    #[default]
    Closed,
    /// Target is failing; calls are rejected.
    Open,
    /// Probing recovery with limited trials.
    HalfOpen,
}

/// Thresholds shared by every breaker in a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerPolicy {
    /// Consecutive failures that open a closed breaker.
    pub failure_threshold: u32,
    /// Time since the last failure before an open breaker admits a trial.
    pub recovery_timeout: Duration,
    /// Concurrent trials admitted while half-open.
    pub half_open_max_requests: u32,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_requests: 3,
        }
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Epoch millis of the most recent failure.
    pub last_failure_at: Option<u64>,
    pub half_open_trials: u32,
}

#[derive(Debug, Default)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    last_failure: Option<u64>,
    trials: u32,
    /// Bumped on every transition into HalfOpen.
    episode: u64,
}

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    /// A trial slot of the given half-open episode.
    Trial(u64),
}

impl BreakerState {
    /// Admission decision; `None` rejects the call.
    fn admit(&mut self, policy: &BreakerPolicy, now: u64, target: &str) -> Option<Admission> {
        if self.state == CircuitState::Open {
            let since = self.last_failure.map_or(u64::MAX, |t| now.saturating_sub(t));
            if u128::from(since) < policy.recovery_timeout.as_millis() {
                return None;
            }
            self.state = CircuitState::HalfOpen;
            self.trials = 0;
            self.episode = self.episode.wrapping_add(1);
            info!(target = %target, "Circuit breaker half-open");
        }
        match self.state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::HalfOpen if self.trials < policy.half_open_max_requests => {
                self.trials += 1;
                Some(Admission::Trial(self.episode))
            }
            _ => None,
        }
    }

    /// Hand back the slot of an abandoned trial from `episode`.
    fn release(&mut self, episode: u64) {
        if self.state == CircuitState::HalfOpen && self.episode == episode {
            self.trials = self.trials.saturating_sub(1);
        }
    }

    fn record(&mut self, policy: &BreakerPolicy, now: u64, success: bool, target: &str) {
        match (self.state, success) {
            (CircuitState::Closed, true) => self.failures = 0,
            (CircuitState::Closed, false) => {
                self.failures = self.failures.saturating_add(1);
                self.last_failure = Some(now);
                if self.failures >= policy.failure_threshold {
                    self.state = CircuitState::Open;
                    warn!(
                        target = %target,
                        failures = self.failures,
                        threshold = policy.failure_threshold,
                        "Circuit breaker opened"
                    );
                }
            }
            (CircuitState::HalfOpen, true) => {
                self.state = CircuitState::Closed;
                self.failures = 0;
                self.trials = 0;
                info!(target = %target, "Circuit breaker closed after successful trial");
            }
            (CircuitState::HalfOpen, false) => {
                self.state = CircuitState::Open;
                self.failures = self.failures.saturating_add(1);
                self.last_failure = Some(now);
                self.trials = 0;
                warn!(target = %target, "Circuit breaker reopened after failed trial");
            }
            // Late outcomes of calls admitted before the breaker opened.
            (CircuitState::Open, _) => {}
        }
    }

    fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            consecutive_failures: self.failures,
            last_failure_at: self.last_failure,
            half_open_trials: self.trials,
        }
    }
}

type Cell = Arc<Mutex<BreakerState>>;

/// Breakers keyed by downstream target.
///
/// Each target has its own lock; transitions for one target are serialized
/// while unrelated targets never contend.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Cell>,
    policy: BreakerPolicy,
    clock: SharedClock,
}

impl CircuitBreakerRegistry {
    pub fn new(policy: BreakerPolicy, clock: SharedClock) -> Self {
        Self {
            breakers: DashMap::new(),
            policy,
            clock,
        }
    }

    fn cell(&self, target: &str) -> Cell {
        if let Some(cell) = self.breakers.get(target) {
            return cell.clone();
        }
        self.breakers.entry(target.to_string()).or_default().clone()
    }

    /// Whether a call to `target` may proceed now.
    ///
    /// Admitting in HalfOpen consumes a trial slot.
    pub fn is_allowed(&self, target: &str) -> bool {
        let now = self.clock.now_millis();
        self.cell(target)
            .lock()
            .admit(&self.policy, now, target)
            .is_some()
    }

    /// Report how a call to `target` ended.
    pub fn record_outcome(&self, target: &str, success: bool) {
        let now = self.clock.now_millis();
        self.cell(target)
            .lock()
            .record(&self.policy, now, success, target);
    }

    /// Admit a call and hand back a permit that reports its outcome.
    pub fn acquire(&self, target: &str) -> GatewayResult<BreakerPermit> {
        let cell = self.cell(target);
        let now = self.clock.now_millis();
        let admitted = cell.lock().admit(&self.policy, now, target);
        match admitted {
            Some(admission) => Ok(BreakerPermit {
                target: target.to_string(),
                cell,
                policy: self.policy,
                clock: self.clock.clone(),
                admission,
                settled: false,
            }),
            None => Err(GatewayError::CircuitOpen(target.to_string())),
        }
    }

    /// Current view of `target`'s breaker; a never-used target reads as closed.
    pub fn snapshot(&self, target: &str) -> BreakerSnapshot {
        self.breakers
            .get(target)
            .map(|cell| cell.lock().snapshot())
            .unwrap_or_else(|| BreakerState::default().snapshot())
    }

    /// Snapshots of every tracked target, by name.
    pub fn snapshots(&self) -> BTreeMap<String, BreakerSnapshot> {
        self.breakers
            .iter()
            .map(|e| (e.key().clone(), e.value().lock().snapshot()))
            .collect()
    }

    /// The thresholds in force.
    pub fn policy(&self) -> BreakerPolicy {
        self.policy
    }
}

/// Admission to one downstream call.
///
/// Consumed by [`BreakerPermit::record`]. Dropping it unrecorded (the call was
/// cancelled) returns a half-open trial slot without counting an outcome, but
/// only to the half-open episode that granted it.
#[must_use = "record the call outcome on the permit"]
pub struct BreakerPermit {
    target: String,
    cell: Cell,
    policy: BreakerPolicy,
    clock: SharedClock,
    admission: Admission,
    settled: bool,
}

impl BreakerPermit {
    /// Report the outcome of the admitted call.
    pub fn record(mut self, success: bool) {
        let now = self.clock.now_millis();
        self.cell
            .lock()
            .record(&self.policy, now, success, &self.target);
        self.settled = true;
    }

    /// Whether this call was admitted as a half-open trial.
    pub fn is_trial(&self) -> bool {
        matches!(self.admission, Admission::Trial(_))
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if let (false, Admission::Trial(episode)) = (self.settled, self.admission) {
            self.cell.lock().release(episode);
        }
    }
}
