use std::sync::Arc;

use crate::backend::Pool;
use crate::error::{RateLimitError, Result};
use crate::jitter::JitterSource;
use crate::limit::{Limit, Unit, NEAR_LIMIT_RATIO};
use crate::metrics::Metrics;
use crate::near_cache::LocalCache;
use crate::time_source::TimeSource;

/// An ordered sequence of `(key, value)` pairs identifying what is being
/// rate-limited. Order is semantically significant — a descriptor's
/// identity (and hence its backend key) is derived from it verbatim.
pub type Descriptor = Vec<(String, String)>;

#[derive(Debug, Clone)]
pub struct RateLimitRequest {
    pub domain: String,
    pub descriptors: Vec<Descriptor>,
    pub hits_addend: u32,
}

impl RateLimitRequest {
    /// `hits_addend` defaults to 1 when the caller omits it; this
    /// constructor models "omitted", distinct from an explicit 0 (which
    /// the engine still honors: commands are still issued, every
    /// contribution is zero).
    pub fn new(domain: impl Into<String>, descriptors: Vec<Descriptor>) -> Self {
        Self {
            domain: domain.into(),
            descriptors,
            hits_addend: 1,
        }
    }

    pub fn with_hits_addend(mut self, hits_addend: u32) -> Self {
        self.hits_addend = hits_addend;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Ok,
    OverLimit,
}

#[derive(Debug, Clone)]
pub struct DescriptorStatus {
    pub code: Code,
    pub current_limit: Option<Limit>,
    pub limit_remaining: u32,
}

impl DescriptorStatus {
    fn ok(limit: Option<Limit>, remaining: u32) -> Self {
        Self {
            code: Code::Ok,
            current_limit: limit,
            limit_remaining: remaining,
        }
    }

    fn over_limit(limit: Option<Limit>) -> Self {
        Self {
            code: Code::OverLimit,
            current_limit: limit,
            limit_remaining: 0,
        }
    }
}

/// Anything the service layer can hand the transport: either the real
/// decision engine or the no-op fallback (§4.7) used when no backend pool
/// is configured.
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    async fn do_limit(
        &self,
        request: &RateLimitRequest,
        limits: &[Option<Limit>],
    ) -> Result<Vec<DescriptorStatus>>;
}

/// Always answers OK with 1000 remaining, no time, no backend, no stats.
/// Selected at construction when no backend pool is configured.
pub struct NoopEngine;

#[async_trait::async_trait]
impl RateLimiter for NoopEngine {
    async fn do_limit(
        &self,
        request: &RateLimitRequest,
        _limits: &[Option<Limit>],
    ) -> Result<Vec<DescriptorStatus>> {
        Ok(request
            .descriptors
            .iter()
            .map(|_| DescriptorStatus::ok(None, 1000))
            .collect())
    }
}

/// Configuration options the decision engine consumes at construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub expiration_jitter_max_seconds: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            expiration_jitter_max_seconds: 0,
        }
    }
}

/// The rate-limit decision core: key derivation, bucket math, pipelined
/// INCRBY+EXPIRE fan-out, reply correlation, verdict synthesis, stats
/// bump and near-cache maintenance, per spec.
pub struct DecisionEngine {
    primary: Arc<dyn Pool>,
    per_second: Option<Arc<dyn Pool>>,
    near_cache: Arc<dyn LocalCache>,
    time_source: Arc<dyn TimeSource>,
    jitter_source: Arc<dyn JitterSource>,
    config: EngineConfig,
    metrics: Option<Arc<Metrics>>,
}

/// Bookkeeping for a descriptor slot that needs a backend round-trip.
struct PendingSlot {
    index: usize,
    key: String,
    bucket_start: i64,
    expire_seconds: i64,
}

impl DecisionEngine {
    pub fn new(
        primary: Arc<dyn Pool>,
        per_second: Option<Arc<dyn Pool>>,
        near_cache: Arc<dyn LocalCache>,
        time_source: Arc<dyn TimeSource>,
        jitter_source: Arc<dyn JitterSource>,
        config: EngineConfig,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            primary,
            per_second,
            near_cache,
            time_source,
            jitter_source,
            config,
            metrics,
        }
    }

    fn bucket_start(now: i64, unit: Unit) -> i64 {
        let window = unit.seconds();
        (now / window) * window
    }

    fn cache_key(domain: &str, identifier: &str, bucket_start: i64) -> String {
        format!("{domain}_{identifier}_{bucket_start}")
    }

    fn jitter_seconds(&self) -> i64 {
        if self.config.expiration_jitter_max_seconds <= 0 {
            return 0;
        }
        self.jitter_source.next().rem_euclid(self.config.expiration_jitter_max_seconds)
    }

}

#[async_trait::async_trait]
impl RateLimiter for DecisionEngine {
    async fn do_limit(
        &self,
        request: &RateLimitRequest,
        limits: &[Option<Limit>],
    ) -> Result<Vec<DescriptorStatus>> {
        if limits.len() != request.descriptors.len() {
            return Err(RateLimitError::PreconditionViolation(format!(
                "limits.len() ({}) != descriptors.len() ({})",
                limits.len(),
                request.descriptors.len()
            )));
        }

        let now = self.time_source.unix_now();
        let addend = request.hits_addend as i64;
        let mut results: Vec<Option<DescriptorStatus>> = vec![None; limits.len()];
        let mut pending: Vec<PendingSlot> = Vec::new();

        // Phase 1 — prepare & near-cache probe.
        for (i, limit) in limits.iter().enumerate() {
            let Some(limit) = limit else {
                results[i] = Some(DescriptorStatus::ok(None, 0));
                continue;
            };

            let bucket_start = Self::bucket_start(now, limit.unit);
            let key = Self::cache_key(&request.domain, &limit.identifier, bucket_start);

            if self.near_cache.get(&key, now) {
                if let Some(metrics) = &self.metrics {
                    metrics.record_near_cache_hit();
                }
                limit.stats.add_total_hits(addend as u64);
                limit.stats.add_over_limit(addend as u64);
                limit.stats.add_over_limit_with_local_cache(addend as u64);
                results[i] = Some(DescriptorStatus::over_limit(Some(limit.clone())));
                continue;
            }
            if let Some(metrics) = &self.metrics {
                metrics.record_near_cache_miss();
            }

            let jitter = self.jitter_seconds();
            pending.push(PendingSlot {
                index: i,
                key,
                bucket_start,
                expire_seconds: limit.unit.seconds() + jitter,
            });
        }

        // Phase 2 — pipelined fan-out, partitioned by backend.
        let mut per_second_slots = Vec::new();
        let mut primary_slots = Vec::new();
        for slot in pending {
            let limit = limits[slot.index].as_ref().unwrap();
            if self.per_second.is_some() && limit.unit.is_per_second() {
                per_second_slots.push(slot);
            } else {
                primary_slots.push(slot);
            }
        }

        let mut new_values: std::collections::HashMap<usize, i64> = std::collections::HashMap::new();
        if !per_second_slots.is_empty() {
            let pool = self.per_second.clone().unwrap();
            self.run_pipeline(pool, &per_second_slots, addend, &mut new_values)
                .await?;
        }
        if !primary_slots.is_empty() {
            self.run_pipeline(self.primary.clone(), &primary_slots, addend, &mut new_values)
                .await?;
        }

        // Phase 3 — classify & score.
        for slot in per_second_slots.into_iter().chain(primary_slots.into_iter()) {
            let limit = limits[slot.index].as_ref().unwrap();
            let new_value = *new_values.get(&slot.index).expect("every pending slot got a reply");
            let threshold = limit.requests_per_unit as i64;
            let prev_value = new_value - addend;

            limit.stats.add_total_hits(addend as u64);

            let over = (new_value - threshold).max(0).min(addend);
            if over > 0 {
                limit.stats.add_over_limit(over as u64);
                let bucket_end = slot.bucket_start + limit.unit.seconds();
                self.near_cache.set(&slot.key, bucket_end);
            }

            let near_threshold = limit.near_limit_threshold(NEAR_LIMIT_RATIO) as i64;
            let near_floor = prev_value.max(near_threshold);
            let near_contribution = (new_value - near_floor).max(0).min((addend - over).max(0));
            if near_contribution > 0 {
                limit.stats.add_near_limit(near_contribution as u64);
            }

            let remaining = (threshold - new_value).max(0) as u32;
            results[slot.index] = Some(if new_value > threshold {
                DescriptorStatus::over_limit(Some(limit.clone()))
            } else {
                DescriptorStatus::ok(Some(limit.clone()), remaining)
            });
        }

        Ok(results
            .into_iter()
            .map(|r| r.expect("every slot is finalized by phase 1 or phase 3"))
            .collect())
    }
}

impl DecisionEngine {
    async fn run_pipeline(
        &self,
        pool: Arc<dyn Pool>,
        slots: &[PendingSlot],
        addend: i64,
        out: &mut std::collections::HashMap<usize, i64>,
    ) -> Result<()> {
        let mut conn = pool.get().await?;

        for slot in slots {
            conn.pipe_append("INCRBY", &[slot.key.clone(), addend.to_string()]);
            conn.pipe_append("EXPIRE", &[slot.key.clone(), slot.expire_seconds.to_string()]);
        }

        for slot in slots {
            let incr_reply = conn.pipe_response().await?;
            let new_value = incr_reply.as_int()?;
            let _expire_reply = conn.pipe_response().await?;
            out.insert(slot.index, new_value);
        }

        Ok(())
    }
}
