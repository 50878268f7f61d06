use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Result;
use crate::limit::{Limit, Unit};
use crate::metrics::Scope;

/// Rate limit configuration for a domain, as loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub domain: String,
    pub descriptors: Vec<RateLimitDescriptorConfig>,
}

/// A rate limit descriptor that can match requests, possibly nested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitDescriptorConfig {
    pub key: String,
    pub value: Option<String>,
    pub rate_limit: Option<RateLimitSpec>,
    pub descriptors: Option<Vec<RateLimitDescriptorConfig>>,
}

/// Rate limit specification as loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSpec {
    pub requests_per_unit: u32,
    pub unit: Unit,
    pub name: Option<String>,
}

/// A compiled configuration for one domain: a flat identifier-path → Limit
/// map for fast lookup at request time, with each `Limit`'s stats already
/// registered against the service's metrics scope.
#[derive(Debug)]
pub struct CompiledRateLimitConfig {
    domain: String,
    limits: HashMap<String, Limit>,
}

impl CompiledRateLimitConfig {
    /// Compile a configuration for efficient runtime lookups, registering
    /// each limit's counters against `scope` as it's discovered.
    pub fn compile(config: RateLimitConfig, scope: &Scope) -> Result<Self> {
        let mut limits = HashMap::new();
        for descriptor in &config.descriptors {
            Self::compile_descriptor(&config.domain, descriptor, &mut vec![], &mut limits, scope);
        }
        Ok(Self {
            domain: config.domain,
            limits,
        })
    }

    fn compile_descriptor(
        domain: &str,
        descriptor: &RateLimitDescriptorConfig,
        path: &mut Vec<String>,
        limits: &mut HashMap<String, Limit>,
        scope: &Scope,
    ) {
        let key_value = match &descriptor.value {
            Some(value) => format!("{}_{}", descriptor.key, value),
            None => descriptor.key.clone(),
        };
        path.push(key_value);

        if let Some(rate_limit) = &descriptor.rate_limit {
            let path_key = path.join(":");
            let identifier = rate_limit
                .name
                .clone()
                .unwrap_or_else(|| format!("{}.{}", domain, path.join(".")));
            limits.insert(
                path_key,
                Limit::new(rate_limit.requests_per_unit, rate_limit.unit, identifier, scope),
            );
        }

        if let Some(nested) = &descriptor.descriptors {
            for child in nested {
                Self::compile_descriptor(domain, child, path, limits, scope);
            }
        }

        path.pop();
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Find a limit for a full descriptor, trying the most specific
    /// prefix first and falling back to shorter prefixes, matching the
    /// nested-descriptor matching rules of the original rate limit
    /// service.
    pub fn find_limit(&self, descriptor: &[(&str, &str)]) -> Option<&Limit> {
        for i in (1..=descriptor.len()).rev() {
            let path = descriptor[..i]
                .iter()
                .map(|(key, value)| {
                    if value.is_empty() {
                        key.to_string()
                    } else {
                        format!("{}_{}", key, value)
                    }
                })
                .collect::<Vec<_>>()
                .join(":");
            if let Some(limit) = self.limits.get(&path) {
                return Some(limit);
            }
        }
        None
    }
}

/// Load configuration from a YAML string.
pub fn load_config_from_yaml(yaml: &str) -> Result<RateLimitConfig> {
    serde_yaml::from_str(yaml)
        .map_err(|e| crate::error::RateLimitError::Config(format!("failed to parse YAML: {e}")))
}

/// Load configuration from a YAML file.
pub fn load_config_from_file(path: &str) -> Result<RateLimitConfig> {
    let content = std::fs::read_to_string(path)?;
    load_config_from_yaml(&content)
}
