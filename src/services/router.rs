//! Alias → deployment selection.
//!
//! Candidates are the alias's deployments that are not excluded, are
//! eligible according to the health tracker, sit under their concurrency cap
//! and have quota left. One is picked at random weighted by
//! `weight × recent success rate`; when every effective weight is zero the
//! survivors are served round-robin. A pick must then pass admission (probe
//! token, concurrency slot, rate-limit token) or it is dropped and the pick
//! repeats.

use crate::core::error::NoEligibleDeploymentError;
use crate::core::metrics::get_metrics;
use crate::core::rate_limiter::RateLimiter;
use crate::services::health_tracker::{Admission, HealthTracker};
use crate::services::routing_table::{Deployment, RoutingTable};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// External accounting signal consulted before selection.
pub trait QuotaSignal: Send + Sync {
    fn quota_available(&self, caller: Option<&str>, deployment: &Deployment) -> bool;
}

/// Quota signal that never limits anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

impl QuotaSignal for Unlimited {
    fn quota_available(&self, _caller: Option<&str>, _deployment: &Deployment) -> bool {
        true
    }
}

/// A chosen deployment together with its reserved slot.
#[derive(Debug)]
pub struct Selection {
    pub deployment: Arc<Deployment>,
    pub admission: Admission,
}

pub struct DeploymentRouter {
    table: ArcSwap<RoutingTable>,
    tracker: HealthTracker,
    rate_limiter: RateLimiter,
    quota: Arc<dyn QuotaSignal>,
    rng: Mutex<StdRng>,
    cursors: DashMap<String, AtomicUsize>,
}

impl DeploymentRouter {
    /// Build a router; `seed` fixes the weighted-selection sequence.
    pub fn new(table: RoutingTable, tracker: HealthTracker, seed: Option<u64>) -> Self {
        tracker.sync(table.deployments().map(|d| d.id.as_str()));
        let rate_limiter = RateLimiter::new();
        rate_limiter.sync(&table);

        Self {
            table: ArcSwap::from_pointee(table),
            tracker,
            rate_limiter,
            quota: Arc::new(Unlimited),
            rng: Mutex::new(make_rng(seed)),
            cursors: DashMap::new(),
        }
    }

    pub fn with_quota(mut self, quota: Arc<dyn QuotaSignal>) -> Self {
        self.quota = quota;
        self
    }

    pub fn table(&self) -> Arc<RoutingTable> {
        self.table.load_full()
    }

    pub fn tracker(&self) -> &HealthTracker {
        &self.tracker
    }

    /// Restart the random sequence (used for deterministic replays).
    pub fn reseed(&self, seed: u64) {
        let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
        *rng = StdRng::seed_from_u64(seed);
        self.cursors.clear();
    }

    /// Pick and admit a deployment for `alias`, skipping `exclude`.
    pub fn select(
        &self,
        alias: &str,
        exclude: &HashSet<String>,
        caller: Option<&str>,
    ) -> Result<Selection, NoEligibleDeploymentError> {
        let no_eligible = || NoEligibleDeploymentError {
            alias: alias.to_string(),
        };

        let table = self.table.load();
        let model = table.alias(alias).ok_or_else(no_eligible)?;

        let mut candidates: Vec<(Arc<Deployment>, f64)> = model
            .deployments
            .iter()
            .filter(|d| !exclude.contains(&d.id))
            .filter(|d| self.tracker.is_eligible(&d.id))
            .filter(|d| {
                d.max_concurrent_requests
                    .map_or(true, |cap| self.tracker.in_flight(&d.id) < cap)
            })
            .filter(|d| self.quota.quota_available(caller, d))
            .map(|d| {
                let effective = d.weight * self.tracker.success_rate(&d.id);
                get_metrics()
                    .effective_weight
                    .with_label_values(&[d.id.as_str()])
                    .set(effective);
                (d.clone(), effective)
            })
            .collect();

        while !candidates.is_empty() {
            let index = self.pick(alias, &candidates);
            let deployment = candidates[index].0.clone();

            if let Some(admission) = self.admit_unchecked(&deployment) {
                tracing::debug!(
                    alias = alias,
                    deployment = %deployment.id,
                    candidates = candidates.len(),
                    probe = admission.is_probe(),
                    "Selected deployment"
                );
                return Ok(Selection {
                    deployment,
                    admission,
                });
            }

            candidates.remove(index);
        }

        Err(no_eligible())
    }

    /// Re-admit an already chosen deployment (same-deployment retry).
    pub fn admit(&self, deployment: &Deployment, caller: Option<&str>) -> Option<Admission> {
        if !self.quota.quota_available(caller, deployment) {
            return None;
        }
        self.admit_unchecked(deployment)
    }

    /// Atomically replace the routing table and resync health and rate limits.
    pub fn reload(&self, table: RoutingTable) {
        self.tracker
            .sync(table.deployments().map(|d| d.id.as_str()));
        self.rate_limiter.sync(&table);
        self.cursors.retain(|alias, _| table.contains(alias));

        tracing::info!(
            aliases = table.aliases().len(),
            deployments = table.deployments().count(),
            "Routing table reloaded"
        );
        self.table.store(Arc::new(table));
    }

    fn admit_unchecked(&self, deployment: &Deployment) -> Option<Admission> {
        let admission = self.tracker.try_admit(deployment)?;
        if !self.rate_limiter.try_acquire(&deployment.id) {
            return None;
        }
        Some(admission)
    }

    fn pick(&self, alias: &str, candidates: &[(Arc<Deployment>, f64)]) -> usize {
        if candidates.len() == 1 {
            return 0;
        }

        let weights = candidates.iter().map(|(_, w)| w.max(0.0));
        if let Ok(index) = WeightedIndex::new(weights) {
            let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
            return index.sample(&mut *rng);
        }

        // every effective weight is zero: round-robin over survivors
        let cursor = self
            .cursors
            .entry(alias.to_string())
            .or_insert_with(|| AtomicUsize::new(0));
        cursor.fetch_add(1, Ordering::Relaxed) % candidates.len()
    }
}

fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}
