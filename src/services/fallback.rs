//! Retry and fallback engine.
//!
//! Drives one [`RoutedRequest`] through the attempt state machine:
//!
//! ```text
//! ATTEMPTING ──ok──────────────────────────────▶ SUCCEEDED
//!     │ retryable, retries left ──▶ RETRY_SAME ──▶ ATTEMPTING
//!     │ otherwise ────────────────▶ RETRY_OTHER ─▶ ATTEMPTING
//!     └ no candidate / budget / deadline / cancel ▶ EXHAUSTED
//! ```
//!
//! Every outcome is handed to the health tracker (through the attempt's
//! [`Admission`]) before the next routing decision is made.

use crate::adapter::{
    AdapterError, AdapterErrorKind, CanonicalRequest, CanonicalResponse, ChunkStream,
    ProviderAdapter, Usage,
};
use crate::core::config::RoutingPolicyConfig;
use crate::core::error::RoutingExhaustedError;
use crate::core::error_types::ExhaustionReason;
use crate::core::logging::DEPLOYMENT_CONTEXT;
use crate::core::metrics::get_metrics;
use crate::services::health_tracker::{Admission, Outcome};
use crate::services::routed_request::{AttemptRecord, RoutedRequest};
use crate::services::router::{DeploymentRouter, Selection};
use crate::services::routing_table::Deployment;
use arc_swap::ArcSwap;
use futures::StreamExt;
use rand::Rng;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::Instrument;

/// Engine states, used for transition logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Attempting,
    RetrySame,
    RetryOther,
    Exhausted,
    Succeeded,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attempting => "ATTEMPTING",
            Self::RetrySame => "RETRY_SAME",
            Self::RetryOther => "RETRY_OTHER",
            Self::Exhausted => "EXHAUSTED",
            Self::Succeeded => "SUCCEEDED",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved retry, backoff and timeout settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries_per_deployment: u32,
    pub max_total_attempts: Option<u32>,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub jitter: bool,
    pub attempt_timeout: Duration,
    pub request_timeout: Duration,
}

impl From<&RoutingPolicyConfig> for RetryPolicy {
    fn from(config: &RoutingPolicyConfig) -> Self {
        Self {
            max_retries_per_deployment: config.max_retries_per_deployment,
            max_total_attempts: config.max_total_attempts,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            jitter: config.jitter,
            attempt_timeout: Duration::from_secs(config.attempt_timeout_secs),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RoutingPolicyConfig::default())
    }
}

impl RetryPolicy {
    /// Total attempts allowed for an alias with `deployments` deployments.
    pub fn attempt_budget(&self, deployments: usize) -> usize {
        match self.max_total_attempts {
            Some(limit) => limit as usize,
            None => deployments.saturating_mul(self.max_retries_per_deployment as usize + 1),
        }
    }

    /// Delay before same-deployment retry number `retry` (0-based).
    ///
    /// `min(base × 2^retry, max)`, raised towards a server-provided
    /// `Retry-After` (never beyond `max`), plus uniform jitter in `[0, base]`.
    pub fn backoff_delay(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let exponential = self
            .backoff_base
            .saturating_mul(1u32 << retry.min(20))
            .min(self.backoff_max);

        let delay = match retry_after {
            Some(hint) => exponential.max(hint.min(self.backoff_max)),
            None => exponential,
        };

        let base_ms = self.backoff_base.as_millis() as u64;
        if self.jitter && base_ms > 0 {
            delay + Duration::from_millis(rand::thread_rng().gen_range(0..=base_ms))
        } else {
            delay
        }
    }
}

/// Body of a successful routed call.
pub enum Payload {
    Complete(CanonicalResponse),
    /// Open upstream stream; holds the deployment's in-flight slot until it
    /// ends or is dropped.
    Stream(ChunkStream),
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete(response) => f.debug_tuple("Complete").field(response).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Debug)]
pub struct RoutedResponse {
    pub request_id: String,
    pub alias: String,
    /// Deployment that produced the payload
    pub deployment: Arc<Deployment>,
    pub payload: Payload,
    /// Every attempt, the successful one last
    pub attempts: Vec<AttemptRecord>,
}

enum AttemptResult {
    Done(Payload),
    Failed(AdapterError),
    /// Attempt cut short because the request deadline arrived first
    DeadlineReached,
    Cancelled,
}

pub struct FallbackEngine {
    router: Arc<DeploymentRouter>,
    adapter: Arc<dyn ProviderAdapter>,
    policy: ArcSwap<RetryPolicy>,
}

impl FallbackEngine {
    pub fn new(
        router: Arc<DeploymentRouter>,
        adapter: Arc<dyn ProviderAdapter>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            router,
            adapter,
            policy: ArcSwap::from_pointee(policy),
        }
    }

    pub fn router(&self) -> &Arc<DeploymentRouter> {
        &self.router
    }

    pub fn policy(&self) -> Arc<RetryPolicy> {
        self.policy.load_full()
    }

    pub fn set_policy(&self, policy: RetryPolicy) {
        self.policy.store(Arc::new(policy));
    }

    /// Route `routed` until it succeeds or nothing is left to try.
    pub async fn execute(
        &self,
        routed: RoutedRequest,
    ) -> Result<RoutedResponse, RoutingExhaustedError> {
        let RoutedRequest {
            request_id,
            alias,
            request,
            caller,
            mut attempts,
            cancel,
        } = routed;

        let policy = self.policy.load_full();
        let deadline = Instant::now() + policy.request_timeout;
        let deployments = self
            .router
            .table()
            .alias(&alias)
            .map_or(0, |model| model.deployments.len());
        let budget = policy.attempt_budget(deployments);

        let exhausted = |reason: ExhaustionReason, attempts: Vec<AttemptRecord>| {
            get_metrics()
                .exhaustions
                .with_label_values(&[alias.as_str(), reason.as_str()])
                .inc();
            tracing::warn!(
                request_id = %request_id,
                alias = %alias,
                reason = %reason,
                attempts = attempts.len(),
                state = %EngineState::Exhausted,
                "Routing exhausted"
            );
            RoutingExhaustedError {
                alias: alias.clone(),
                reason,
                attempts,
            }
        };

        let mut exclude: HashSet<String> = HashSet::new();
        let mut state = EngineState::Attempting;
        let mut same: Option<(Arc<Deployment>, u32)> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(exhausted(ExhaustionReason::Cancelled, attempts));
            }
            if attempts.len() >= budget {
                return Err(exhausted(ExhaustionReason::AttemptBudget, attempts));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(exhausted(ExhaustionReason::DeadlineExceeded, attempts));
            }

            let (deployment, mut admission, retries) = match (state, same.take()) {
                (EngineState::RetrySame, Some((deployment, retries))) => {
                    match self.router.admit(&deployment, caller.as_deref()) {
                        Some(admission) => (deployment, admission, retries),
                        None => {
                            tracing::debug!(
                                request_id = %request_id,
                                deployment = %deployment.id,
                                "Deployment no longer admissible, trying another"
                            );
                            self.exclude(&alias, &deployment, &mut exclude);
                            state = EngineState::RetryOther;
                            continue;
                        }
                    }
                }
                _ => match self.router.select(&alias, &exclude, caller.as_deref()) {
                    Ok(Selection {
                        deployment,
                        admission,
                    }) => (deployment, admission, 0),
                    Err(_) => {
                        return Err(exhausted(ExhaustionReason::NoEligibleDeployment, attempts))
                    }
                },
            };
            tracing::trace!(
                request_id = %request_id,
                deployment = %deployment.id,
                from = %state,
                state = %EngineState::Attempting,
                "Dispatching attempt"
            );

            let attempt_timeout = policy.attempt_timeout.min(deadline - now);
            let cut_by_deadline = attempt_timeout < policy.attempt_timeout;
            let started = Instant::now();

            let call = DEPLOYMENT_CONTEXT.scope(
                deployment.id.clone(),
                self.call(&deployment, &request)
                    .instrument(crate::deployment_span!("upstream_attempt", deployment.id)),
            );
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => AttemptResult::Cancelled,
                outcome = tokio::time::timeout(attempt_timeout, call) => match outcome {
                    Ok(Ok(payload)) => AttemptResult::Done(payload),
                    Ok(Err(err)) => AttemptResult::Failed(err),
                    Err(_) if cut_by_deadline => AttemptResult::DeadlineReached,
                    Err(_) => AttemptResult::Failed(AdapterError::timeout(attempt_timeout)),
                },
            };
            let latency_ms = started.elapsed().as_millis() as u64;

            match result {
                AttemptResult::Cancelled => {
                    tracing::info!(
                        request_id = %request_id,
                        deployment = %deployment.id,
                        "Client went away, aborting attempt"
                    );
                    drop(admission);
                    return Err(exhausted(ExhaustionReason::Cancelled, attempts));
                }
                AttemptResult::DeadlineReached => {
                    // not the deployment's fault: history only, no tracker update
                    attempts.push(AttemptRecord::new(
                        deployment.id.as_str(),
                        Outcome::Failure(AdapterErrorKind::Timeout),
                        latency_ms,
                    ));
                    drop(admission);
                    return Err(exhausted(ExhaustionReason::DeadlineExceeded, attempts));
                }
                AttemptResult::Done(payload) => {
                    admission.record(Outcome::Success, latency_ms);
                    self.observe(&alias, &deployment, Outcome::Success, latency_ms);
                    attempts.push(AttemptRecord::new(
                        deployment.id.as_str(),
                        Outcome::Success,
                        latency_ms,
                    ));

                    tracing::info!(
                        request_id = %request_id,
                        alias = %alias,
                        deployment = %deployment.id,
                        attempts = attempts.len(),
                        latency_ms = latency_ms,
                        state = %EngineState::Succeeded,
                        "Request routed"
                    );

                    let payload = match payload {
                        Payload::Complete(response) => {
                            if let Some(usage) = &response.usage {
                                record_usage(&alias, &deployment.id, usage);
                            }
                            drop(admission);
                            Payload::Complete(response)
                        }
                        Payload::Stream(stream) => Payload::Stream(track_stream(
                            stream,
                            admission,
                            alias.clone(),
                            deployment.id.clone(),
                            started,
                        )),
                    };

                    return Ok(RoutedResponse {
                        request_id,
                        alias,
                        deployment,
                        payload,
                        attempts,
                    });
                }
                AttemptResult::Failed(err) => {
                    let outcome = Outcome::Failure(err.kind);
                    admission.record(outcome, latency_ms);
                    drop(admission);
                    self.observe(&alias, &deployment, outcome, latency_ms);
                    attempts.push(AttemptRecord::new(deployment.id.as_str(), outcome, latency_ms));

                    tracing::warn!(
                        request_id = %request_id,
                        deployment = %deployment.id,
                        kind = %err.kind,
                        status = ?err.status,
                        retry = retries,
                        error = %err.message,
                        "Upstream attempt failed"
                    );

                    if err.kind.is_retryable() && retries < policy.max_retries_per_deployment {
                        if attempts.len() >= budget {
                            return Err(exhausted(ExhaustionReason::AttemptBudget, attempts));
                        }
                        let delay = policy.backoff_delay(retries, err.retry_after);
                        if Instant::now() + delay >= deadline {
                            return Err(exhausted(ExhaustionReason::DeadlineExceeded, attempts));
                        }
                        tracing::debug!(
                            request_id = %request_id,
                            deployment = %deployment.id,
                            delay_ms = delay.as_millis() as u64,
                            state = %EngineState::RetrySame,
                            "Backing off before retry"
                        );
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                return Err(exhausted(ExhaustionReason::Cancelled, attempts));
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                        same = Some((deployment, retries + 1));
                        state = EngineState::RetrySame;
                    } else {
                        self.exclude(&alias, &deployment, &mut exclude);
                        state = EngineState::RetryOther;
                    }
                }
            }
        }
    }

    async fn call(
        &self,
        deployment: &Deployment,
        request: &CanonicalRequest,
    ) -> Result<Payload, AdapterError> {
        if request.stream {
            self.adapter
                .invoke_stream(deployment, request)
                .await
                .map(Payload::Stream)
        } else {
            self.adapter
                .invoke(deployment, request)
                .await
                .map(Payload::Complete)
        }
    }

    fn exclude(&self, alias: &str, deployment: &Deployment, exclude: &mut HashSet<String>) {
        exclude.insert(deployment.id.clone());
        get_metrics()
            .fallbacks
            .with_label_values(&[alias, deployment.id.as_str()])
            .inc();
        tracing::debug!(
            alias = alias,
            deployment = %deployment.id,
            excluded = exclude.len(),
            state = %EngineState::RetryOther,
            "Excluding deployment for this request"
        );
    }

    fn observe(&self, alias: &str, deployment: &Deployment, outcome: Outcome, latency_ms: u64) {
        let metrics = get_metrics();
        metrics
            .attempts
            .with_label_values(&[alias, deployment.id.as_str(), outcome.as_label()])
            .inc();
        metrics
            .deployment_latency
            .with_label_values(&[deployment.id.as_str()])
            .observe(latency_ms as f64 / 1000.0);
    }
}

fn record_usage(alias: &str, deployment_id: &str, usage: &Usage) {
    let metrics = get_metrics();
    metrics
        .token_usage
        .with_label_values(&[alias, deployment_id, "prompt"])
        .inc_by(usage.prompt_tokens as u64);
    metrics
        .token_usage
        .with_label_values(&[alias, deployment_id, "completion"])
        .inc_by(usage.completion_tokens as u64);
    metrics
        .token_usage
        .with_label_values(&[alias, deployment_id, "total"])
        .inc_by(usage.total_tokens as u64);
}

/// Keep the admission alive for the life of the stream and report a
/// mid-stream failure to the tracker.
fn track_stream(
    upstream: ChunkStream,
    admission: Admission,
    alias: String,
    deployment_id: String,
    started: Instant,
) -> ChunkStream {
    Box::pin(async_stream::stream! {
        let mut admission = admission;
        let mut upstream = upstream;
        while let Some(item) = upstream.next().await {
            match item {
                Ok(chunk) => {
                    if let Some(usage) = &chunk.usage {
                        record_usage(&alias, &deployment_id, usage);
                    }
                    yield Ok(chunk);
                }
                Err(err) => {
                    admission.record(
                        Outcome::Failure(err.kind),
                        started.elapsed().as_millis() as u64,
                    );
                    tracing::warn!(
                        alias = %alias,
                        deployment = %deployment_id,
                        kind = %err.kind,
                        "Upstream stream failed mid-response"
                    );
                    yield Err(err);
                    break;
                }
            }
        }
        drop(admission);
    })
}
