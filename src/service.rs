use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::CompiledRateLimitConfig;
use crate::engine::{Code, DescriptorStatus, RateLimitRequest, RateLimiter};
use crate::error::{RateLimitError, Result};
use crate::limit::Limit;
use crate::metrics::Metrics;

/// The overall verdict for a request: OVER_LIMIT if any descriptor came
/// back over limit, else OK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverallCode {
    Ok,
    OverLimit,
}

#[derive(Debug, Clone)]
pub struct RateLimitResponse {
    pub overall_code: OverallCode,
    pub statuses: Vec<DescriptorStatus>,
}

/// Coordinates domain configuration lookup with the decision engine. This
/// is the seam the gRPC transport calls into; it owns no rate-limiting
/// logic of its own beyond resolving each descriptor to a `Limit` before
/// handing the batch to the engine, per the decision API's contract that
/// `limits.len() == request.descriptors.len()`.
pub struct RateLimitService {
    configs: RwLock<HashMap<String, CompiledRateLimitConfig>>,
    engine: Arc<dyn RateLimiter>,
    metrics: Arc<Metrics>,
}

impl RateLimitService {
    pub fn new(engine: Arc<dyn RateLimiter>, metrics: Arc<Metrics>) -> Self {
        Self {
            configs: RwLock::new(HashMap::new()),
            engine,
            metrics,
        }
    }

    pub async fn add_config(&self, config: CompiledRateLimitConfig) {
        let domain = config.domain().to_string();
        self.configs.write().await.insert(domain, config);
        self.metrics.record_config_load_success();
    }

    pub async fn remove_config(&self, domain: &str) {
        self.configs.write().await.remove(domain);
    }

    pub async fn should_rate_limit(&self, request: &RateLimitRequest) -> Result<RateLimitResponse> {
        if request.domain.is_empty() {
            return Err(RateLimitError::Service(
                "rate limit domain must not be empty".to_string(),
            ));
        }
        if request.descriptors.is_empty() {
            return Err(RateLimitError::Service(
                "rate limit descriptor list must not be empty".to_string(),
            ));
        }

        let timer = self.metrics.start_request_timer();
        self.metrics.record_request(&request.domain);

        let configs = self.configs.read().await;
        let config = configs
            .get(&request.domain)
            .ok_or_else(|| RateLimitError::DomainNotFound(request.domain.clone()))?;

        let limits: Vec<Option<Limit>> = request
            .descriptors
            .iter()
            .map(|descriptor| {
                let pairs: Vec<(&str, &str)> = descriptor
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str()))
                    .collect();
                config.find_limit(&pairs).cloned()
            })
            .collect();
        drop(configs);

        let statuses = self.engine.do_limit(request, &limits).await?;
        drop(timer);

        let overall_code = if statuses.iter().any(|s| s.code == Code::OverLimit) {
            OverallCode::OverLimit
        } else {
            OverallCode::Ok
        };

        Ok(RateLimitResponse {
            overall_code,
            statuses,
        })
    }
}
