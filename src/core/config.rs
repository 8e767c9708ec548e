//! Configuration management for the routing proxy.
//!
//! Configuration is loaded once from a YAML file, with `${VAR}` /
//! `${VAR:-default}` expansion and a handful of environment overrides.
//! Deployment credentials may reference the environment with the
//! `os.environ/NAME` form; they are resolved at load time and never printed.

use crate::adapter::ProviderKind;
use anyhow::{bail, Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::time::Duration;

lazy_static! {
    static ref ENV_VAR_PATTERN: Regex =
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-?([^}]*))?\}").unwrap();
}

const ENV_REFERENCE_PREFIX: &str = "os.environ/";

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration (host, port)
    #[serde(default)]
    pub server: ServerConfig,

    /// Whether to verify SSL certificates for upstream requests
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,

    /// Logical model aliases and the deployments that serve them
    pub model_list: Vec<ModelAliasConfig>,

    /// Retry, fallback and timeout policy
    #[serde(default)]
    pub routing: RoutingPolicyConfig,

    /// Per-deployment circuit breaker policy
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

/// Server-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// A logical model name mapped to an ordered list of deployments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelAliasConfig {
    /// Alias exposed to callers (e.g. "gpt-4")
    pub model_name: String,

    /// Deployments in default preference order
    pub deployments: Vec<DeploymentConfig>,
}

/// One provider + credential + upstream model combination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Stable identifier; defaults to `{alias}/{index}`
    #[serde(default)]
    pub id: Option<String>,

    /// Wire format / provider family
    pub provider: ProviderKind,

    /// Base URL for the provider's API
    pub api_base: String,

    /// API key or `os.environ/NAME` reference
    pub api_key: Credential,

    /// Upstream model identifier
    pub model: String,

    /// Relative selection weight (0 disables weighted picks for this deployment)
    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Maximum number of concurrent in-flight requests
    #[serde(default)]
    pub max_concurrent_requests: Option<u32>,

    /// Optional token-bucket rate limit
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

/// Token-bucket rate limit for a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum requests per second
    pub requests_per_second: u32,

    /// Maximum burst size (allows temporary spikes)
    #[serde(default = "default_burst")]
    pub burst_size: u32,
}

/// Retry, fallback and timeout policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingPolicyConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries_per_deployment: u32,

    /// Global attempt budget; defaults to deployments × (retries + 1)
    #[serde(default)]
    pub max_total_attempts: Option<u32>,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_true")]
    pub jitter: bool,

    /// Timeout for a single upstream call
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,

    /// Wall-clock budget for all attempts of one request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Fixed seed for weighted selection (deterministic replay)
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for RoutingPolicyConfig {
    fn default() -> Self {
        Self {
            max_retries_per_deployment: default_max_retries(),
            max_total_attempts: None,
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter: true,
            attempt_timeout_secs: default_attempt_timeout(),
            request_timeout_secs: default_request_timeout(),
            seed: None,
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_consecutive_failures")]
    pub consecutive_failures: u32,

    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,

    #[serde(default = "default_window_size")]
    pub window_size: usize,

    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            consecutive_failures: default_consecutive_failures(),
            failure_rate_threshold: default_failure_rate_threshold(),
            window_size: default_window_size(),
            min_samples: default_min_samples(),
            cooldown_secs: default_cooldown(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Upstream API credential.
///
/// The value is only reachable through [`Credential::expose`]; `Debug`,
/// `Display` and `Serialize` all print a mask.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Resolve a raw config value, following `os.environ/NAME` references.
    pub fn resolve(raw: &str) -> std::result::Result<Self, String> {
        match raw.strip_prefix(ENV_REFERENCE_PREFIX) {
            Some(var) => std::env::var(var).map(Self).map_err(|_| {
                format!("environment variable {} referenced by api_key is not set", var)
            }),
            None => Ok(Self(raw.to_string())),
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Replace any occurrence of the secret in `text` with a mask.
    pub fn redact(&self, text: &str) -> String {
        if self.0.len() < 4 {
            return text.to_string();
        }
        text.replace(&self.0, "***")
    }
}

impl TryFrom<String> for Credential {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::resolve(&value)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl Serialize for Credential {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str("***")
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    18000
}

fn default_weight() -> f64 {
    1.0
}

fn default_burst() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

fn default_verify_ssl() -> bool {
    true
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_base_ms() -> u64 {
    250
}

fn default_backoff_max_ms() -> u64 {
    8_000
}

fn default_attempt_timeout() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    300
}

fn default_consecutive_failures() -> u32 {
    5
}

fn default_failure_rate_threshold() -> f64 {
    0.5
}

fn default_window_size() -> usize {
    20
}

fn default_min_samples() -> usize {
    10
}

fn default_cooldown() -> u64 {
    30
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use llm_router::core::config::AppConfig;
    ///
    /// let config = AppConfig::load("config.yaml").expect("Failed to load config");
    /// ```
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let mut config = Self::from_yaml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from YAML text after environment expansion.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: AppConfig = serde_yaml::from_str(&expanded)?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("HOST") {
            self.server.host = host;
        }

        if let Ok(port_str) = std::env::var("PORT") {
            if let Ok(port) = port_str.parse::<u16>() {
                self.server.port = port;
            }
        }

        if let Ok(verify_ssl_str) = std::env::var("VERIFY_SSL") {
            self.verify_ssl = str_to_bool(&verify_ssl_str);
        }

        if let Ok(timeout_str) = std::env::var("REQUEST_TIMEOUT_SECS") {
            if let Ok(timeout) = timeout_str.parse::<u64>() {
                self.routing.request_timeout_secs = timeout;
            }
        }
    }

    /// Check structural invariants of the model list and policies.
    pub fn validate(&self) -> Result<()> {
        if self.model_list.is_empty() {
            bail!("model_list must contain at least one alias");
        }

        let mut aliases = HashSet::new();
        let mut ids = HashSet::new();
        for alias in &self.model_list {
            if alias.model_name.trim().is_empty() {
                bail!("model_name must not be empty");
            }
            if !aliases.insert(alias.model_name.as_str()) {
                bail!("duplicate model_name: {}", alias.model_name);
            }
            if alias.deployments.is_empty() {
                bail!("alias {} has no deployments", alias.model_name);
            }
            for (index, deployment) in alias.deployments.iter().enumerate() {
                let id = deployment_id(&alias.model_name, index, deployment);
                if !ids.insert(id.clone()) {
                    bail!("duplicate deployment id: {}", id);
                }
                if deployment.api_base.trim().is_empty() {
                    bail!("deployment {} has an empty api_base", id);
                }
                if deployment.model.trim().is_empty() {
                    bail!("deployment {} has an empty model", id);
                }
                if !deployment.weight.is_finite() || deployment.weight < 0.0 {
                    bail!("deployment {} has an invalid weight", id);
                }
            }
        }

        let breaker = &self.circuit_breaker;
        if breaker.consecutive_failures == 0 {
            bail!("circuit_breaker.consecutive_failures must be at least 1");
        }
        if breaker.window_size == 0 {
            bail!("circuit_breaker.window_size must be at least 1");
        }
        if !(breaker.failure_rate_threshold > 0.0 && breaker.failure_rate_threshold <= 1.0) {
            bail!("circuit_breaker.failure_rate_threshold must be in (0, 1]");
        }
        if self.routing.backoff_max_ms < self.routing.backoff_base_ms {
            bail!("routing.backoff_max_ms must be >= routing.backoff_base_ms");
        }

        Ok(())
    }
}

/// Identifier of the `index`-th deployment of `alias`.
pub fn deployment_id(alias: &str, index: usize, deployment: &DeploymentConfig) -> String {
    deployment
        .id
        .clone()
        .unwrap_or_else(|| format!("{}/{}", alias, index))
}

/// Expand environment variables in configuration content.
///
/// Supports patterns: ${VAR}, ${VAR:-default}, ${VAR:default}
fn expand_env_vars(content: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default_value.to_string())
        })
        .to_string()
}

/// Convert string to boolean.
///
/// Accepts: "true", "1", "yes", "on" (case-insensitive)
pub(crate) fn str_to_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MINIMAL: &str = r#"
model_list:
  - model_name: gpt-4
    deployments:
      - provider: openai
        api_base: http://localhost:8000
        api_key: sk-test-key
        model: gpt-4-0613
"#;

    #[test]
    fn test_expand_env_vars() {
        unsafe {
            std::env::set_var("LLM_ROUTER_TEST_VAR", "test_value");
        }
        let output = expand_env_vars("api_key: ${LLM_ROUTER_TEST_VAR}");
        assert_eq!(output, "api_key: test_value");
        unsafe {
            std::env::remove_var("LLM_ROUTER_TEST_VAR");
        }
    }

    #[test]
    fn test_expand_env_vars_with_default() {
        unsafe {
            std::env::remove_var("LLM_ROUTER_MISSING");
        }
        assert_eq!(
            expand_env_vars("port: ${LLM_ROUTER_MISSING:-9000}"),
            "port: 9000"
        );
        assert_eq!(
            expand_env_vars("port: ${LLM_ROUTER_MISSING:9001}"),
            "port: 9001"
        );
        assert_eq!(expand_env_vars("key: ${LLM_ROUTER_MISSING:-}"), "key: ");
    }

    #[test]
    fn test_str_to_bool() {
        assert!(str_to_bool("true"));
        assert!(str_to_bool("YES"));
        assert!(str_to_bool("1"));
        assert!(str_to_bool("On"));
        assert!(!str_to_bool("false"));
        assert!(!str_to_bool("0"));
        assert!(!str_to_bool(""));
    }

    #[test]
    fn test_defaults_applied() {
        let config = AppConfig::from_yaml_str(MINIMAL).unwrap();
        assert_eq!(config.server.port, 18000);
        assert_eq!(config.routing.max_retries_per_deployment, 2);
        assert_eq!(config.routing.max_total_attempts, None);
        assert_eq!(config.circuit_breaker.consecutive_failures, 5);
        assert_eq!(config.circuit_breaker.cooldown(), Duration::from_secs(30));

        let deployment = &config.model_list[0].deployments[0];
        assert_eq!(deployment.weight, 1.0);
        assert_eq!(deployment.provider, ProviderKind::OpenAi);
        assert!(deployment.max_concurrent_requests.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_credential_env_reference() {
        unsafe {
            std::env::set_var("LLM_ROUTER_TEST_KEY", "sk-from-env");
        }
        let yaml = MINIMAL.replace("sk-test-key", "os.environ/LLM_ROUTER_TEST_KEY");
        let config = AppConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(
            config.model_list[0].deployments[0].api_key.expose(),
            "sk-from-env"
        );
        unsafe {
            std::env::remove_var("LLM_ROUTER_TEST_KEY");
        }
    }

    #[test]
    fn test_credential_missing_env_reference_fails() {
        unsafe {
            std::env::remove_var("LLM_ROUTER_ABSENT_KEY");
        }
        let yaml = MINIMAL.replace("sk-test-key", "os.environ/LLM_ROUTER_ABSENT_KEY");
        let err = AppConfig::from_yaml_str(&yaml).unwrap_err();
        assert!(format!("{:#}", err).contains("LLM_ROUTER_ABSENT_KEY"));
    }

    #[test]
    fn test_credential_never_printed() {
        let config = AppConfig::from_yaml_str(MINIMAL).unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("sk-test-key"));

        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(!yaml.contains("sk-test-key"));
        assert!(yaml.contains("***"));
    }

    #[test]
    fn test_credential_redact() {
        let credential = Credential::new("sk-secret-123");
        assert_eq!(
            credential.redact("Incorrect API key provided: sk-secret-123"),
            "Incorrect API key provided: ***"
        );
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let yaml = r#"
model_list:
  - model_name: gpt-4
    deployments:
      - id: shared
        provider: openai
        api_base: http://a
        api_key: k1
        model: m
      - id: shared
        provider: anthropic
        api_base: http://b
        api_key: k2
        model: m
"#;
        let config = AppConfig::from_yaml_str(yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate deployment id"));
    }

    #[test]
    fn test_validate_rejects_empty_alias() {
        let yaml = r#"
model_list:
  - model_name: gpt-4
    deployments: []
"#;
        let config = AppConfig::from_yaml_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_negative_weight() {
        let yaml = MINIMAL.replace("model: gpt-4-0613", "model: gpt-4-0613\n        weight: -1");
        let config = AppConfig::from_yaml_str(&yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let yaml = MINIMAL.replace("provider: openai", "provider: carrier-pigeon");
        assert!(AppConfig::from_yaml_str(&yaml).is_err());
    }

    #[test]
    #[serial]
    fn test_load_config_from_file_with_overrides() {
        unsafe {
            std::env::set_var("PORT", "9999");
            std::env::remove_var("HOST");
            std::env::remove_var("VERIFY_SSL");
            std::env::remove_var("REQUEST_TIMEOUT_SECS");
        }

        let mut temp_file = NamedTempFile::new().unwrap();
        let content = r#"
server:
  host: 127.0.0.1
  port: 8080
verify_ssl: false
routing:
  max_retries_per_deployment: 1
  backoff_base_ms: 10
  backoff_max_ms: 100
  seed: 7
circuit_breaker:
  consecutive_failures: 3
  cooldown_secs: 5
model_list:
  - model_name: claude
    deployments:
      - id: anthropic-primary
        provider: anthropic
        api_base: https://api.anthropic.com
        api_key: sk-ant
        model: claude-3-5-sonnet
        weight: 3
        max_concurrent_requests: 8
        rate_limit:
          requests_per_second: 5
"#;
        temp_file.write_all(content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = AppConfig::load(temp_file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9999);
        assert!(!config.verify_ssl);
        assert_eq!(config.routing.seed, Some(7));
        assert_eq!(config.circuit_breaker.consecutive_failures, 3);

        let deployment = &config.model_list[0].deployments[0];
        assert_eq!(deployment.provider, ProviderKind::Anthropic);
        assert_eq!(deployment.weight, 3.0);
        assert_eq!(deployment.max_concurrent_requests, Some(8));
        let rate_limit = deployment.rate_limit.as_ref().unwrap();
        assert_eq!(rate_limit.requests_per_second, 5);
        assert_eq!(rate_limit.burst_size, 10);

        unsafe {
            std::env::remove_var("PORT");
        }
    }

    #[test]
    fn test_load_config_missing_file() {
        assert!(AppConfig::load("nonexistent_file.yaml").is_err());
    }

    #[test]
    fn test_deployment_id_default() {
        let config = AppConfig::from_yaml_str(MINIMAL).unwrap();
        let deployment = &config.model_list[0].deployments[0];
        assert_eq!(deployment_id("gpt-4", 0, deployment), "gpt-4/0");
    }
}
