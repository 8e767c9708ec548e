//! Per-deployment health, latency and circuit breaker tracking.
//!
//! Every deployment has one [`HealthRecord`]: a small mutex-guarded breaker
//! state plus lock-free counters for in-flight requests and the HALF_OPEN
//! probe token. The mutex is never held across an `.await`.
//!
//! Circuit transitions:
//! - CLOSED → OPEN after `consecutive_failures` failures in a row, or when
//!   the rolling window holds at least `min_samples` outcomes and the failure
//!   rate exceeds `failure_rate_threshold`
//! - OPEN → HALF_OPEN once `cooldown` has elapsed (checked lazily)
//! - HALF_OPEN → CLOSED on the first success, → OPEN on any failure
//!
//! HALF_OPEN admits exactly one probe, arbitrated by compare-and-set on a
//! generational token. Only the admission holding the current generation may
//! release it, and the OPEN → HALF_OPEN promotion never touches it.

use crate::adapter::AdapterErrorKind;
use crate::core::config::CircuitBreakerConfig;
use crate::core::metrics::get_metrics;
use crate::services::routing_table::Deployment;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;
use utoipa::ToSchema;

const CIRCUIT_CLOSED: &str = "closed";
const CIRCUIT_OPEN: &str = "open";
const CIRCUIT_HALF_OPEN: &str = "half_open";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Closed => CIRCUIT_CLOSED,
            Self::Open => CIRCUIT_OPEN,
            Self::HalfOpen => CIRCUIT_HALF_OPEN,
        }
    }

    fn gauge_value(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Result of one attempt against a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(AdapterErrorKind),
}

impl Outcome {
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure(kind) => kind.as_str(),
        }
    }

    /// Caller faults say nothing about the deployment.
    fn is_neutral(&self) -> bool {
        matches!(self, Self::Failure(AdapterErrorKind::InvalidRequest))
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

#[derive(Debug)]
struct BreakerState {
    circuit: CircuitState,
    consecutive_failures: u32,
    /// `true` for success, newest at the back
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    last_latency_ms: Option<u64>,
    total_successes: u64,
    total_failures: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            circuit: CircuitState::Closed,
            consecutive_failures: 0,
            window: VecDeque::new(),
            opened_at: None,
            last_latency_ms: None,
            total_successes: 0,
            total_failures: 0,
        }
    }

    fn success_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 1.0;
        }
        let successes = self.window.iter().filter(|ok| **ok).count();
        successes as f64 / self.window.len() as f64
    }

    fn push(&mut self, ok: bool, window_size: usize) {
        while self.window.len() >= window_size.max(1) {
            self.window.pop_front();
        }
        self.window.push_back(ok);
    }
}

/// Mutable health state of one deployment.
#[derive(Debug)]
pub struct HealthRecord {
    deployment_id: String,
    state: Mutex<BreakerState>,
    in_flight: AtomicU32,
    /// `generation << 1 | taken`
    probe_token: AtomicU64,
}

impl HealthRecord {
    fn new(deployment_id: &str) -> Self {
        Self {
            deployment_id: deployment_id.to_string(),
            state: Mutex::new(BreakerState::new()),
            in_flight: AtomicU32::new(0),
            probe_token: AtomicU64::new(0),
        }
    }

    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    fn probe_in_flight(&self) -> bool {
        self.probe_token.load(Ordering::Acquire) & 1 == 1
    }

    /// Take the probe token. Returns the generation now held by the caller.
    fn claim_probe(&self) -> Option<u64> {
        let mut current = self.probe_token.load(Ordering::Acquire);
        loop {
            if current & 1 == 1 {
                return None;
            }
            let generation = (current >> 1).wrapping_add(1);
            match self.probe_token.compare_exchange_weak(
                current,
                generation << 1 | 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(generation),
                Err(actual) => current = actual,
            }
        }
    }

    /// Release the token if `generation` still holds it.
    fn release_probe(&self, generation: u64) {
        let _ = self.probe_token.compare_exchange(
            generation << 1 | 1,
            generation << 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lazily move OPEN → HALF_OPEN. Returns `true` if the state changed.
    fn promote_if_cooled(
        &self,
        state: &mut BreakerState,
        config: &CircuitBreakerConfig,
        now: Instant,
    ) -> bool {
        if state.circuit != CircuitState::Open {
            return false;
        }
        let cooled = state
            .opened_at
            .map(|opened_at| now.saturating_duration_since(opened_at) >= config.cooldown())
            .unwrap_or(true);
        if cooled {
            state.circuit = CircuitState::HalfOpen;
        }
        cooled
    }

    fn apply(
        &self,
        outcome: Outcome,
        latency_ms: u64,
        config: &CircuitBreakerConfig,
    ) -> Option<CircuitState> {
        let mut state = self.lock();
        state.last_latency_ms = Some(latency_ms);

        if outcome.is_neutral() {
            return None;
        }

        let before = state.circuit;
        match outcome {
            Outcome::Success => {
                state.total_successes += 1;
                state.consecutive_failures = 0;
                state.push(true, config.window_size);
                if state.circuit == CircuitState::HalfOpen {
                    state.circuit = CircuitState::Closed;
                    state.opened_at = None;
                    state.window.clear();
                }
            }
            Outcome::Failure(_) => {
                state.total_failures += 1;
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                state.push(false, config.window_size);

                let trip = match state.circuit {
                    CircuitState::HalfOpen => true,
                    CircuitState::Closed => {
                        state.consecutive_failures >= config.consecutive_failures
                            || (state.window.len() >= config.min_samples
                                && 1.0 - state.success_rate() > config.failure_rate_threshold)
                    }
                    CircuitState::Open => false,
                };
                if trip {
                    state.circuit = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                }
            }
        }

        let after = state.circuit;
        (before != after).then_some(after)
    }

    fn snapshot(&self, config: &CircuitBreakerConfig) -> DeploymentHealth {
        let mut state = self.lock();
        self.promote_if_cooled(&mut state, config, Instant::now());
        DeploymentHealth {
            deployment_id: self.deployment_id.clone(),
            circuit_state: state.circuit.as_label().to_string(),
            consecutive_failures: state.consecutive_failures,
            success_rate: state.success_rate(),
            window_len: state.window.len(),
            last_latency_ms: state.last_latency_ms,
            in_flight: self.in_flight(),
            probe_in_flight: self.probe_in_flight(),
            total_successes: state.total_successes,
            total_failures: state.total_failures,
        }
    }
}

/// Point-in-time view of a deployment's health.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DeploymentHealth {
    pub deployment_id: String,
    pub circuit_state: String,
    pub consecutive_failures: u32,
    pub success_rate: f64,
    pub window_len: usize,
    pub last_latency_ms: Option<u64>,
    pub in_flight: u32,
    pub probe_in_flight: bool,
    pub total_successes: u64,
    pub total_failures: u64,
}

/// A reserved in-flight slot (and possibly the HALF_OPEN probe token) for
/// one attempt. The slot is released on drop; the probe token is released
/// once an outcome is recorded or on drop.
#[must_use = "dropping an admission releases its slot immediately"]
pub struct Admission {
    record: Arc<HealthRecord>,
    tracker: Arc<HealthTrackerInner>,
    probe: Option<u64>,
    recorded: bool,
}

impl Admission {
    pub fn deployment_id(&self) -> &str {
        &self.record.deployment_id
    }

    /// Whether this attempt is the HALF_OPEN probe.
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }

    /// Report the outcome of the attempt this admission covers.
    pub fn record(&mut self, outcome: Outcome, latency_ms: u64) {
        self.tracker.apply(&self.record, outcome, latency_ms);
        if let Some(generation) = self.probe {
            self.record.release_probe(generation);
        }
        self.recorded = true;
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.record.in_flight.fetch_sub(1, Ordering::AcqRel);
        if let Some(generation) = self.probe.filter(|_| !self.recorded) {
            self.record.release_probe(generation);
        }
    }
}

impl fmt::Debug for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Admission")
            .field("deployment_id", &self.record.deployment_id)
            .field("probe", &self.is_probe())
            .field("recorded", &self.recorded)
            .finish()
    }
}

struct HealthTrackerInner {
    config: ArcSwap<CircuitBreakerConfig>,
    records: DashMap<String, Arc<HealthRecord>>,
}

impl HealthTrackerInner {
    fn apply(&self, record: &HealthRecord, outcome: Outcome, latency_ms: u64) {
        let config = self.config.load();
        if let Some(new_state) = record.apply(outcome, latency_ms, &config) {
            log_transition(&record.deployment_id, new_state, outcome);
            publish_state(&record.deployment_id, new_state);
        }
    }
}

/// Owner of every [`HealthRecord`].
#[derive(Clone)]
pub struct HealthTracker {
    inner: Arc<HealthTrackerInner>,
}

impl HealthTracker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(HealthTrackerInner {
                config: ArcSwap::from_pointee(config),
                records: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> Arc<CircuitBreakerConfig> {
        self.inner.config.load_full()
    }

    pub fn set_config(&self, config: CircuitBreakerConfig) {
        self.inner.config.store(Arc::new(config));
    }

    /// Create a record for `deployment_id` if none exists.
    pub fn register(&self, deployment_id: &str) -> Arc<HealthRecord> {
        self.inner
            .records
            .entry(deployment_id.to_string())
            .or_insert_with(|| {
                publish_state(deployment_id, CircuitState::Closed);
                Arc::new(HealthRecord::new(deployment_id))
            })
            .clone()
    }

    /// Keep records for `deployment_ids`, create missing ones and drop the rest.
    pub fn sync<'a>(&self, deployment_ids: impl IntoIterator<Item = &'a str>) {
        let desired: HashSet<&str> = deployment_ids.into_iter().collect();
        for id in &desired {
            self.register(id);
        }
        self.inner
            .records
            .retain(|id, _| desired.contains(id.as_str()));
    }

    pub fn contains(&self, deployment_id: &str) -> bool {
        self.inner.records.contains_key(deployment_id)
    }

    /// Report an outcome without an admission guard.
    pub fn record(&self, deployment_id: &str, outcome: Outcome, latency_ms: u64) {
        let record = self.register(deployment_id);
        self.inner.apply(&record, outcome, latency_ms);
    }

    /// Whether the deployment may receive traffic right now.
    pub fn is_eligible(&self, deployment_id: &str) -> bool {
        let Some(record) = self.get(deployment_id) else {
            return true;
        };
        let config = self.inner.config.load();
        let (circuit, promoted) = {
            let mut state = record.lock();
            let promoted = record.promote_if_cooled(&mut state, &config, Instant::now());
            (state.circuit, promoted)
        };
        if promoted {
            log_half_open(deployment_id);
            publish_state(deployment_id, CircuitState::HalfOpen);
        }

        match circuit {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !record.probe_in_flight(),
            CircuitState::Open => false,
        }
    }

    /// Reserve a slot for one attempt against `deployment`.
    ///
    /// Returns `None` when the circuit is open, the HALF_OPEN probe is
    /// already taken, or the concurrency cap is reached.
    pub fn try_admit(&self, deployment: &Deployment) -> Option<Admission> {
        let record = self.register(&deployment.id);
        let config = self.inner.config.load();

        let (circuit, promoted) = {
            let mut state = record.lock();
            let promoted = record.promote_if_cooled(&mut state, &config, Instant::now());
            (state.circuit, promoted)
        };
        if promoted {
            log_half_open(&deployment.id);
            publish_state(&deployment.id, CircuitState::HalfOpen);
        }

        let probe = match circuit {
            CircuitState::Open => return None,
            CircuitState::HalfOpen => Some(record.claim_probe()?),
            CircuitState::Closed => None,
        };

        let reserved = match deployment.max_concurrent_requests {
            Some(cap) => record
                .in_flight
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < cap).then_some(n + 1)
                })
                .is_ok(),
            None => {
                record.in_flight.fetch_add(1, Ordering::AcqRel);
                true
            }
        };

        if !reserved {
            if let Some(generation) = probe {
                record.release_probe(generation);
            }
            return None;
        }

        if probe.is_some() {
            tracing::info!(deployment = %deployment.id, "Admitted half-open probe");
        }

        Some(Admission {
            record,
            tracker: self.inner.clone(),
            probe,
            recorded: false,
        })
    }

    /// Recent success rate (1.0 for an empty window or unknown deployment).
    pub fn success_rate(&self, deployment_id: &str) -> f64 {
        self.get(deployment_id)
            .map(|record| record.lock().success_rate())
            .unwrap_or(1.0)
    }

    pub fn in_flight(&self, deployment_id: &str) -> u32 {
        self.get(deployment_id)
            .map(|record| record.in_flight())
            .unwrap_or(0)
    }

    pub fn circuit_state(&self, deployment_id: &str) -> Option<CircuitState> {
        let record = self.get(deployment_id)?;
        let config = self.inner.config.load();
        let mut state = record.lock();
        record.promote_if_cooled(&mut state, &config, Instant::now());
        Some(state.circuit)
    }

    /// Health of every registered deployment, sorted by id.
    pub fn snapshot(&self) -> Vec<DeploymentHealth> {
        let config = self.inner.config.load();
        let records: Vec<Arc<HealthRecord>> = self
            .inner
            .records
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut snapshot: Vec<DeploymentHealth> =
            records.iter().map(|r| r.snapshot(&config)).collect();
        snapshot.sort_by(|a, b| a.deployment_id.cmp(&b.deployment_id));
        snapshot
    }

    fn get(&self, deployment_id: &str) -> Option<Arc<HealthRecord>> {
        self.inner
            .records
            .get(deployment_id)
            .map(|entry| entry.value().clone())
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

fn log_transition(deployment_id: &str, new_state: CircuitState, outcome: Outcome) {
    match new_state {
        CircuitState::Open => tracing::warn!(
            deployment = deployment_id,
            outcome = %outcome,
            "Circuit opened"
        ),
        CircuitState::Closed => {
            tracing::info!(deployment = deployment_id, "Circuit closed after successful probe")
        }
        CircuitState::HalfOpen => log_half_open(deployment_id),
    }
}

fn log_half_open(deployment_id: &str) {
    tracing::info!(deployment = deployment_id, "Circuit half-open, awaiting probe");
}

fn publish_state(deployment_id: &str, state: CircuitState) {
    let metrics = get_metrics();
    metrics
        .circuit_state
        .with_label_values(&[deployment_id])
        .set(state.gauge_value());
    metrics
        .deployment_health
        .with_label_values(&[deployment_id])
        .set(if state == CircuitState::Open { 0.0 } else { 1.0 });
}
