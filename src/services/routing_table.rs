//! Immutable alias → deployment table built from configuration.

use crate::adapter::ProviderKind;
use crate::core::config::{deployment_id, AppConfig, Credential, RateLimitConfig};
use std::collections::HashMap;
use std::sync::Arc;

/// A provider + credential + upstream model combination that can serve an alias.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub id: String,
    pub alias: String,
    pub provider: ProviderKind,
    pub api_base: String,
    pub credential: Credential,
    /// Upstream model identifier
    pub model: String,
    pub weight: f64,
    pub max_concurrent_requests: Option<u32>,
    pub rate_limit: Option<RateLimitConfig>,
}

/// A logical model name and its deployments in preference order.
#[derive(Debug, Clone)]
pub struct ModelAlias {
    pub name: String,
    pub deployments: Vec<Arc<Deployment>>,
}

/// Snapshot of every configured alias.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    aliases: Vec<ModelAlias>,
    by_name: HashMap<String, usize>,
}

impl RoutingTable {
    pub fn from_config(config: &AppConfig) -> Self {
        let aliases = config
            .model_list
            .iter()
            .map(|alias| ModelAlias {
                name: alias.model_name.clone(),
                deployments: alias
                    .deployments
                    .iter()
                    .enumerate()
                    .map(|(index, d)| {
                        Arc::new(Deployment {
                            id: deployment_id(&alias.model_name, index, d),
                            alias: alias.model_name.clone(),
                            provider: d.provider,
                            api_base: d.api_base.clone(),
                            credential: d.api_key.clone(),
                            model: d.model.clone(),
                            weight: d.weight,
                            max_concurrent_requests: d.max_concurrent_requests,
                            rate_limit: d.rate_limit.clone(),
                        })
                    })
                    .collect(),
            })
            .collect();
        Self::new(aliases)
    }

    pub fn new(aliases: Vec<ModelAlias>) -> Self {
        let by_name = aliases
            .iter()
            .enumerate()
            .map(|(index, alias)| (alias.name.clone(), index))
            .collect();
        Self { aliases, by_name }
    }

    pub fn alias(&self, name: &str) -> Option<&ModelAlias> {
        self.by_name.get(name).map(|&index| &self.aliases[index])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn aliases(&self) -> &[ModelAlias] {
        &self.aliases
    }

    pub fn deployments(&self) -> impl Iterator<Item = &Arc<Deployment>> {
        self.aliases.iter().flat_map(|alias| alias.deployments.iter())
    }
}
