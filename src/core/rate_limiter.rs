//! Per-deployment rate limiting.
//!
//! Each deployment with a configured `rate_limit` gets its own token bucket
//! via the governor crate. Deployments without one are never limited.

use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use nonzero_ext::nonzero;
use std::collections::HashSet;
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::core::config::RateLimitConfig;
use crate::services::routing_table::RoutingTable;

type RateLimiterInstance = Arc<GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

struct Bucket {
    config: RateLimitConfig,
    limiter: RateLimiterInstance,
}

/// Token buckets keyed by deployment id.
pub struct RateLimiter {
    limiters: DashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            limiters: DashMap::new(),
        }
    }

    /// Register (or replace) the bucket for a deployment.
    pub fn register(&self, deployment_id: &str, config: &RateLimitConfig) {
        let quota = Quota::per_second(
            NonZeroU32::new(config.requests_per_second).unwrap_or(nonzero!(1u32)),
        )
        .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(nonzero!(10u32)));

        let limiter = Arc::new(GovernorRateLimiter::direct(quota));
        self.limiters.insert(
            deployment_id.to_string(),
            Bucket {
                config: config.clone(),
                limiter,
            },
        );
    }

    /// Take one token for `deployment_id`. Returns `false` when the bucket is empty.
    pub fn try_acquire(&self, deployment_id: &str) -> bool {
        match self.limiters.get(deployment_id) {
            Some(bucket) => {
                let allowed = bucket.limiter.check().is_ok();
                if !allowed {
                    tracing::debug!(deployment = deployment_id, "Deployment rate limit reached");
                }
                allowed
            }
            None => true,
        }
    }

    /// Rebuild buckets from a routing table: new or changed limits get a
    /// fresh bucket, unchanged ones keep their tokens and stale ones are removed.
    pub fn sync(&self, table: &RoutingTable) {
        let mut desired: HashSet<&str> = HashSet::new();

        for deployment in table.deployments() {
            if let Some(ref limit) = deployment.rate_limit {
                desired.insert(deployment.id.as_str());
                let unchanged = self
                    .limiters
                    .get(&deployment.id)
                    .is_some_and(|bucket| bucket.config == *limit);
                if !unchanged {
                    self.register(&deployment.id, limit);
                }
            }
        }

        let stale: Vec<String> = self
            .limiters
            .iter()
            .filter(|entry| !desired.contains(entry.key().as_str()))
            .map(|entry| entry.key().clone())
            .collect();

        for key in &stale {
            self.limiters.remove(key);
        }

        if !stale.is_empty() {
            tracing::info!(removed_count = stale.len(), "Removed stale rate limit entries");
        }
    }

    pub fn is_limited(&self, deployment_id: &str) -> bool {
        self.limiters.contains_key(deployment_id)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::AppConfig;

    #[test]
    fn test_allows_within_limit() {
        let limiter = RateLimiter::new();
        let config = RateLimitConfig {
            requests_per_second: 10,
            burst_size: 3,
        };
        limiter.register("a/0", &config);

        assert!(limiter.try_acquire("a/0"));
        assert!(limiter.try_acquire("a/0"));
        assert!(limiter.try_acquire("a/0"));
        assert!(!limiter.try_acquire("a/0"));
    }

    #[test]
    fn test_unregistered_deployment_unlimited() {
        let limiter = RateLimiter::new();
        for _ in 0..100 {
            assert!(limiter.try_acquire("free/0"));
        }
    }

    #[test]
    fn test_zero_values_fall_back_to_defaults() {
        let limiter = RateLimiter::new();
        let config = RateLimitConfig {
            requests_per_second: 0,
            burst_size: 0,
        };
        limiter.register("z/0", &config);
        assert!(limiter.try_acquire("z/0"));
    }

    #[test]
    fn test_sync_from_table() {
        let yaml = r#"
model_list:
  - model_name: gpt-4
    deployments:
      - provider: openai
        api_base: http://a
        api_key: key-a
        model: m
        rate_limit:
          requests_per_second: 1
          burst_size: 1
      - provider: openai
        api_base: http://b
        api_key: key-b
        model: m
"#;
        let config = AppConfig::from_yaml_str(yaml).unwrap();
        let table = RoutingTable::from_config(&config);

        let limiter = RateLimiter::new();
        limiter.register("removed/0", &RateLimitConfig {
            requests_per_second: 1,
            burst_size: 1,
        });
        limiter.sync(&table);

        assert!(limiter.is_limited("gpt-4/0"));
        assert!(!limiter.is_limited("gpt-4/1"));
        assert!(!limiter.is_limited("removed/0"));
    }

    #[test]
    fn test_sync_keeps_unchanged_buckets_drained() {
        let yaml = |rps: u32| {
            format!(
                r#"
model_list:
  - model_name: gpt-4
    deployments:
      - provider: openai
        api_base: http://a
        api_key: key-a
        model: m
        rate_limit:
          requests_per_second: {}
          burst_size: 1
"#,
                rps
            )
        };
        let table = |rps: u32| {
            RoutingTable::from_config(&AppConfig::from_yaml_str(&yaml(rps)).unwrap())
        };

        let limiter = RateLimiter::new();
        limiter.sync(&table(1));
        assert!(limiter.try_acquire("gpt-4/0"));
        assert!(!limiter.try_acquire("gpt-4/0"));

        // same limit: the drained bucket survives the reload
        limiter.sync(&table(1));
        assert!(!limiter.try_acquire("gpt-4/0"));

        // changed limit: a fresh bucket
        limiter.sync(&table(2));
        assert!(limiter.try_acquire("gpt-4/0"));
    }
}
