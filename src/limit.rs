use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::metrics::Scope;

/// Time units a rate limit's threshold can be expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    Second,
    Minute,
    Hour,
    Day,
}

impl Unit {
    /// Bucket width in seconds.
    pub fn seconds(self) -> i64 {
        match self {
            Unit::Second => 1,
            Unit::Minute => 60,
            Unit::Hour => 3600,
            Unit::Day => 86400,
        }
    }

    pub fn is_per_second(self) -> bool {
        matches!(self, Unit::Second)
    }
}

/// Four monotonically increasing counters tracked per configured limit, for
/// observability. All updates are atomic; readers are the metrics flush
/// path, never the decision path itself.
#[derive(Debug)]
pub struct LimitStats {
    pub total_hits: AtomicU64,
    pub over_limit: AtomicU64,
    pub near_limit: AtomicU64,
    pub over_limit_with_local_cache: AtomicU64,
}

impl Default for LimitStats {
    fn default() -> Self {
        Self {
            total_hits: AtomicU64::new(0),
            over_limit: AtomicU64::new(0),
            near_limit: AtomicU64::new(0),
            over_limit_with_local_cache: AtomicU64::new(0),
        }
    }
}

impl LimitStats {

    pub fn add_total_hits(&self, n: u64) {
        self.total_hits.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_over_limit(&self, n: u64) {
        self.over_limit.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_near_limit(&self, n: u64) {
        self.near_limit.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_over_limit_with_local_cache(&self, n: u64) {
        self.over_limit_with_local_cache
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LimitStatsSnapshot {
        LimitStatsSnapshot {
            total_hits: self.total_hits.load(Ordering::Relaxed),
            over_limit: self.over_limit.load(Ordering::Relaxed),
            near_limit: self.near_limit.load(Ordering::Relaxed),
            over_limit_with_local_cache: self.over_limit_with_local_cache.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitStatsSnapshot {
    pub total_hits: u64,
    pub over_limit: u64,
    pub near_limit: u64,
    pub over_limit_with_local_cache: u64,
}

/// A resolved, per-descriptor-slot rate limit: a threshold, the window it
/// applies over, the stable identifier used to build backend keys, and its
/// observability counters. Stats persist for the lifetime of the config
/// version that created this `Limit`.
#[derive(Debug, Clone)]
pub struct Limit {
    pub requests_per_unit: u32,
    pub unit: Unit,
    pub identifier: String,
    pub stats: Arc<LimitStats>,
}

impl Limit {
    /// Construct a limit and register its four counters under a scope
    /// derived from `identifier`.
    pub fn new(requests_per_unit: u32, unit: Unit, identifier: String, scope: &Scope) -> Self {
        let stats = Arc::new(LimitStats::default());
        scope.register_limit(&identifier, &stats);
        Self {
            requests_per_unit,
            unit,
            identifier,
            stats,
        }
    }

    /// `ceil(0.8 * requests_per_unit)` — the near-limit band is
    /// `(near_limit_threshold, requests_per_unit]`.
    pub fn near_limit_threshold(&self, ratio: f64) -> u64 {
        ((self.requests_per_unit as f64) * ratio).ceil() as u64
    }
}

pub const NEAR_LIMIT_RATIO: f64 = 0.8;
