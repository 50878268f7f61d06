use prometheus::{
    Counter, CounterVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry,
};
use std::sync::{Arc, Mutex};

use crate::limit::LimitStats;

/// A named registrar for per-limit and per-pool counters, the way the
/// decision engine's stats requirement calls for: the engine receives a
/// scope-like object at construction, never a process-global registry.
#[derive(Clone)]
pub struct Scope {
    registry: Arc<Registry>,
    prefix: String,
    limit_totals: CounterVec,
    limit_overs: CounterVec,
    limit_nears: CounterVec,
    limit_local_cache_overs: CounterVec,
    tracked: Arc<Mutex<Vec<(String, Arc<LimitStats>)>>>,
}

impl Scope {
    pub fn new(registry: Arc<Registry>, prefix: &str) -> prometheus::Result<Self> {
        let limit_totals = CounterVec::new(
            Opts::new("ratelimit_total_hits", "Total hits seen for a limit"),
            &["limit"],
        )?;
        let limit_overs = CounterVec::new(
            Opts::new("ratelimit_over_limit", "Hits that exceeded a limit"),
            &["limit"],
        )?;
        let limit_nears = CounterVec::new(
            Opts::new("ratelimit_near_limit", "Hits inside a limit's near-limit band"),
            &["limit"],
        )?;
        let limit_local_cache_overs = CounterVec::new(
            Opts::new(
                "ratelimit_over_limit_with_local_cache",
                "Hits rejected by the local near-cache without a backend call",
            ),
            &["limit"],
        )?;

        registry.register(Box::new(limit_totals.clone()))?;
        registry.register(Box::new(limit_overs.clone()))?;
        registry.register(Box::new(limit_nears.clone()))?;
        registry.register(Box::new(limit_local_cache_overs.clone()))?;

        Ok(Self {
            registry,
            prefix: prefix.to_string(),
            limit_totals,
            limit_overs,
            limit_nears,
            limit_local_cache_overs,
            tracked: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Registers a limit's stats for inclusion in the next `flush`.
    pub fn register_limit(&self, identifier: &str, stats: &Arc<LimitStats>) {
        self.tracked
            .lock()
            .unwrap()
            .push((identifier.to_string(), stats.clone()));
    }

    /// Pushes every tracked limit's current counter values into the
    /// prometheus vectors. Called from the metrics HTTP handler just
    /// before `registry().gather()`, since `LimitStats` is plain atomic
    /// state updated directly by the decision engine rather than
    /// prometheus counters themselves (the hot path never touches the
    /// registry).
    pub fn flush(&self) {
        for (identifier, stats) in self.tracked.lock().unwrap().iter() {
            let label = format!("{}.{}", self.prefix, identifier);
            let snap = stats.snapshot();
            set_counter(&self.limit_totals.with_label_values(&[&label]), snap.total_hits);
            set_counter(&self.limit_overs.with_label_values(&[&label]), snap.over_limit);
            set_counter(&self.limit_nears.with_label_values(&[&label]), snap.near_limit);
            set_counter(
                &self.limit_local_cache_overs.with_label_values(&[&label]),
                snap.over_limit_with_local_cache,
            );
        }
    }

    pub fn gauge(&self, name: &str) -> IntGauge {
        let gauge = IntGauge::with_opts(Opts::new(format!("ratelimit_{}", name), format!("{} gauge", name)))
            .expect("static metric options are always valid");
        // A second pool registering the same gauge name (primary and
        // per-second) would conflict; keep the first registration.
        let _ = self.registry.register(Box::new(gauge.clone()));
        gauge
    }

    pub fn counter(&self, name: &str) -> IntCounter {
        let counter =
            IntCounter::with_opts(Opts::new(format!("ratelimit_{}", name), format!("{} counter", name)))
                .expect("static metric options are always valid");
        let _ = self.registry.register(Box::new(counter.clone()));
        counter
    }
}

/// `Counter`'s API only grows; reporting a `LimitStats` snapshot (an
/// externally-owned absolute value) means advancing the prometheus
/// counter by the delta since the last flush.
fn set_counter(counter: &Counter, value: u64) {
    let current = counter.get();
    let target = value as f64;
    if target > current {
        counter.inc_by(target - current);
    }
}

/// Process-wide service metrics: request volume, durations, config load
/// outcomes, near-cache hit/miss. Mirrors the teacher's `Metrics` struct.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    total_requests: IntCounterVec,
    config_load_success: IntCounter,
    config_load_error: IntCounter,
    request_duration: Histogram,
    near_cache_hits: IntCounter,
    near_cache_misses: IntCounter,
}

impl Metrics {
    pub fn new(registry: Arc<Registry>) -> prometheus::Result<Self> {
        let total_requests = IntCounterVec::new(
            Opts::new("ratelimit_requests_total", "Total do_limit invocations"),
            &["domain"],
        )?;
        let config_load_success = IntCounter::new(
            "ratelimit_config_load_success",
            "Number of successful configuration loads",
        )?;
        let config_load_error = IntCounter::new(
            "ratelimit_config_load_error",
            "Number of failed configuration loads",
        )?;
        let request_duration = Histogram::with_opts(HistogramOpts::new(
            "ratelimit_request_duration_seconds",
            "Duration of do_limit calls",
        ))?;
        let near_cache_hits = IntCounter::new("ratelimit_near_cache_hits", "Local near-cache hits")?;
        let near_cache_misses =
            IntCounter::new("ratelimit_near_cache_misses", "Local near-cache misses")?;

        registry.register(Box::new(total_requests.clone()))?;
        registry.register(Box::new(config_load_success.clone()))?;
        registry.register(Box::new(config_load_error.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(near_cache_hits.clone()))?;
        registry.register(Box::new(near_cache_misses.clone()))?;

        Ok(Self {
            registry,
            total_requests,
            config_load_success,
            config_load_error,
            request_duration,
            near_cache_hits,
            near_cache_misses,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_request(&self, domain: &str) {
        self.total_requests.with_label_values(&[domain]).inc();
    }

    pub fn record_config_load_success(&self) {
        self.config_load_success.inc();
    }

    pub fn record_config_load_error(&self) {
        self.config_load_error.inc();
    }

    pub fn record_near_cache_hit(&self) {
        self.near_cache_hits.inc();
    }

    pub fn record_near_cache_miss(&self) {
        self.near_cache_misses.inc();
    }

    pub fn start_request_timer(&self) -> prometheus::HistogramTimer {
        self.request_duration.start_timer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_flush_reports_monotonic_counters() {
        let registry = Arc::new(Registry::new());
        let scope = Scope::new(registry.clone(), "test").unwrap();
        let stats = Arc::new(LimitStats::default());
        scope.register_limit("domain.key", &stats);
        stats.add_total_hits(3);
        scope.flush();

        let families = registry.gather();
        let total = families
            .iter()
            .find(|f| f.get_name() == "ratelimit_total_hits")
            .expect("metric registered");
        assert_eq!(total.get_metric()[0].get_counter().get_value(), 3.0);
    }

    #[test]
    fn metrics_gather_includes_registered_families() {
        let registry = Arc::new(Registry::new());
        let metrics = Metrics::new(registry.clone()).unwrap();
        metrics.record_request("test");
        metrics.record_config_load_success();

        let families = registry.gather();
        assert!(families.iter().any(|f| f.get_name() == "ratelimit_requests_total"));
    }
}
