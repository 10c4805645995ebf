//! Circuit breaker (C2): per-agent failure tracking that stops dispatching
//! to an agent that is failing repeatedly, and probes it back in once a
//! cooldown elapses.
//!
//! State lives purely in memory (§3: breaker state is not a database type),
//! guarded by a single [`std::sync::Mutex`] rather than `parking_lot` to
//! stay on the teacher's dependency stack. Every transition that depends on
//! a prior read — in particular open-to-half-open — happens inside one lock
//! acquisition. A separate check-then-set sequence would let two callers
//! both observe "cooldown elapsed" and both decide to probe, which defeats
//! the point of a single half-open probe slot.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct BreakerEntry {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl Default for BreakerEntry {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

/// Decision returned by [`CircuitBreaker::allow_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Dispatch normally.
    Allowed,
    /// Dispatch as a single probe; a failure reopens immediately, a success closes.
    Probe,
    /// Do not dispatch to this agent.
    Denied,
}

pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    entries: Mutex<HashMap<Uuid, BreakerEntry>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Decide whether a request to `agent_id` may proceed, atomically
    /// performing the open -> half-open transition if the cooldown has
    /// elapsed. At most one caller observes `Probe` per cooldown window:
    /// the entry flips to `HalfOpen` under the same lock acquisition that
    /// decided to admit the probe, so a second concurrent caller sees
    /// `HalfOpen` already in place and is denied.
    pub fn allow_request(&self, agent_id: Uuid) -> Admission {
        let mut entries = self.entries.lock().expect("breaker mutex poisoned");
        let entry = entries.entry(agent_id).or_default();

        match entry.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::HalfOpen => Admission::Denied,
            BreakerState::Open => {
                let elapsed = entry.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.cooldown {
                    entry.state = BreakerState::HalfOpen;
                    Admission::Probe
                } else {
                    Admission::Denied
                }
            }
        }
    }

    /// Record a successful call. Closes the breaker and resets the failure
    /// count, whether it was closed, half-open, or (spuriously) open.
    pub fn record_success(&self, agent_id: Uuid) {
        let mut entries = self.entries.lock().expect("breaker mutex poisoned");
        let entry = entries.entry(agent_id).or_default();
        entry.state = BreakerState::Closed;
        entry.consecutive_failures = 0;
        entry.opened_at = None;
    }

    /// Record a failed call. Trips the breaker open once
    /// `consecutive_failures` reaches `failure_threshold`, or immediately if
    /// the failure was the probe call from a half-open state.
    pub fn record_failure(&self, agent_id: Uuid) {
        let mut entries = self.entries.lock().expect("breaker mutex poisoned");
        let entry = entries.entry(agent_id).or_default();

        if entry.state == BreakerState::HalfOpen {
            entry.state = BreakerState::Open;
            entry.opened_at = Some(Instant::now());
            return;
        }

        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= self.failure_threshold {
            entry.state = BreakerState::Open;
            entry.opened_at = Some(Instant::now());
        }
    }

    /// Current state for an agent, defaulting to `Closed` if never seen.
    pub fn state(&self, agent_id: Uuid) -> BreakerState {
        let entries = self.entries.lock().expect("breaker mutex poisoned");
        entries.get(&agent_id).map(|e| e.state).unwrap_or(BreakerState::Closed)
    }

    /// Drop entries for agents no longer in `live_ids`, so a deregistered
    /// agent's history does not linger forever.
    pub fn cleanup(&self, live_ids: &[Uuid]) {
        let mut entries = self.entries.lock().expect("breaker mutex poisoned");
        entries.retain(|id, _| live_ids.contains(id));
    }
}
