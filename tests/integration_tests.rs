use std::sync::Arc;

use prometheus::Registry;

use rust_ratelimit::backend::test_support::MockPool;
use rust_ratelimit::config::{CompiledRateLimitConfig, RateLimitConfig, RateLimitDescriptorConfig, RateLimitSpec};
use rust_ratelimit::engine::{Code, DecisionEngine, EngineConfig, NoopEngine, RateLimitRequest, RateLimiter};
use rust_ratelimit::error::RateLimitError;
use rust_ratelimit::jitter::test_support::FixedJitter;
use rust_ratelimit::limit::{Limit, Unit};
use rust_ratelimit::metrics::Scope;
use rust_ratelimit::near_cache::{LocalCache, MokaLocalCache};
use rust_ratelimit::time_source::test_support::FixedTimeSource;

fn scope() -> Scope {
    Scope::new(Arc::new(Registry::new()), "test").unwrap()
}

fn make_limit(requests_per_unit: u32, unit: Unit, identifier: &str, scope: &Scope) -> Limit {
    Limit::new(requests_per_unit, unit, identifier.to_string(), scope)
}

struct Harness {
    engine: DecisionEngine,
    pool: Arc<MockPool>,
    cache: Arc<MokaLocalCache>,
    now: Arc<FixedTimeSource>,
}

fn harness(jitter_max: i64, jitter_value: i64) -> Harness {
    let pool = Arc::new(MockPool::new(false));
    let cache = Arc::new(MokaLocalCache::new(1000));
    let now = Arc::new(FixedTimeSource::new(0));
    let engine = DecisionEngine::new(
        pool.clone(),
        None,
        cache.clone(),
        now.clone(),
        Arc::new(FixedJitter::new(jitter_value)),
        EngineConfig {
            expiration_jitter_max_seconds: jitter_max,
        },
        None,
    );
    Harness {
        engine,
        pool,
        cache,
        now,
    }
}

#[tokio::test]
async fn scenario_1_single_second_descriptor_under_limit() {
    let h = harness(0, 0);
    h.now.set(1234);
    let scope = scope();
    let limit = make_limit(10, Unit::Second, "scenario1", &scope);
    h.pool.seed("test_scenario1_1234", 4);

    let request = RateLimitRequest::new("test", vec![vec![("key".into(), "value".into())]]);
    let statuses = h
        .engine
        .do_limit(&request, &[Some(limit.clone())])
        .await
        .unwrap();

    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].code, Code::Ok);
    assert_eq!(statuses[0].limit_remaining, 5);
    let snap = limit.stats.snapshot();
    assert_eq!(snap.total_hits, 1);
    assert_eq!(snap.over_limit, 0);
    assert_eq!(snap.near_limit, 0);
}

#[tokio::test]
async fn scenario_2_nil_limit_alongside_over_limit_descriptor() {
    let h = harness(0, 0);
    h.now.set(1234);
    let scope = scope();
    let limit = make_limit(10, Unit::Minute, "scenario2", &scope);
    h.pool.seed("test_scenario2_1200", 10);

    let request = RateLimitRequest::new(
        "test",
        vec![
            vec![("a".into(), "b".into())],
            vec![("c".into(), "d".into())],
        ],
    );
    let statuses = h
        .engine
        .do_limit(&request, &[None, Some(limit.clone())])
        .await
        .unwrap();

    assert_eq!(statuses[0].code, Code::Ok);
    assert!(statuses[0].current_limit.is_none());
    assert_eq!(statuses[0].limit_remaining, 0);

    assert_eq!(statuses[1].code, Code::OverLimit);
    assert_eq!(statuses[1].limit_remaining, 0);

    let snap = limit.stats.snapshot();
    assert_eq!(snap.total_hits, 1);
    assert_eq!(snap.over_limit, 1);
    assert_eq!(snap.near_limit, 0);

    // No command issued for the nil-limit slot.
    assert_eq!(h.pool.commands_issued().len(), 2);
}

#[tokio::test]
async fn scenario_3_and_4_near_limit_then_over_limit_then_near_cache_hit() {
    let h = harness(0, 0);
    h.now.set(1_000_000);
    let scope = scope();
    let limit = make_limit(15, Unit::Hour, "scenario3", &scope);
    let key = "test_scenario3_997200";

    h.pool.seed(key, 10);
    let request = RateLimitRequest::new("test", vec![vec![("k".into(), "v".into())]]);
    let status = h
        .engine
        .do_limit(&request, &[Some(limit.clone())])
        .await
        .unwrap();
    assert_eq!(status[0].code, Code::Ok);
    assert_eq!(status[0].limit_remaining, 4);
    assert_eq!(limit.stats.snapshot().near_limit, 0);

    h.pool.seed(key, 12);
    let status = h
        .engine
        .do_limit(&request, &[Some(limit.clone())])
        .await
        .unwrap();
    assert_eq!(status[0].code, Code::Ok);
    assert_eq!(status[0].limit_remaining, 2);
    assert_eq!(limit.stats.snapshot().near_limit, 1);

    h.pool.seed(key, 15);
    let status = h
        .engine
        .do_limit(&request, &[Some(limit.clone())])
        .await
        .unwrap();
    assert_eq!(status[0].code, Code::OverLimit);
    assert_eq!(status[0].limit_remaining, 0);
    assert_eq!(limit.stats.snapshot().over_limit, 1);
    assert_eq!(limit.stats.snapshot().near_limit, 1);
    assert!(h.cache.get(key, 1_000_000));

    // Scenario 4: near-cache hit short-circuits the backend entirely.
    let commands_before = h.pool.commands_issued().len();
    let status = h
        .engine
        .do_limit(&request, &[Some(limit.clone())])
        .await
        .unwrap();
    assert_eq!(status[0].code, Code::OverLimit);
    assert_eq!(h.pool.commands_issued().len(), commands_before);
    assert_eq!(limit.stats.snapshot().over_limit_with_local_cache, 1);
}

#[tokio::test]
async fn scenario_5_addend_entirely_in_near_band() {
    let h = harness(0, 0);
    h.now.set(1234);
    let scope = scope();
    let limit = make_limit(20, Unit::Second, "scenario5", &scope);
    h.pool.seed("test_scenario5_1234", 19 - 3);

    let request =
        RateLimitRequest::new("test", vec![vec![("k".into(), "v".into())]]).with_hits_addend(3);
    let status = h
        .engine
        .do_limit(&request, &[Some(limit.clone())])
        .await
        .unwrap();
    assert_eq!(status[0].code, Code::Ok);
    assert_eq!(status[0].limit_remaining, 1);
    let snap = limit.stats.snapshot();
    assert_eq!(snap.near_limit, 3);
    assert_eq!(snap.over_limit, 0);
}

#[tokio::test]
async fn scenario_6_addend_split_between_near_and_over() {
    let h = harness(0, 0);
    h.now.set(1234);
    let scope = scope();
    let limit = make_limit(20, Unit::Second, "scenario6", &scope);
    h.pool.seed("test_scenario6_1234", 22 - 3);

    let request =
        RateLimitRequest::new("test", vec![vec![("k".into(), "v".into())]]).with_hits_addend(3);
    let status = h
        .engine
        .do_limit(&request, &[Some(limit.clone())])
        .await
        .unwrap();
    assert_eq!(status[0].code, Code::OverLimit);
    assert_eq!(status[0].limit_remaining, 0);
    let snap = limit.stats.snapshot();
    assert_eq!(snap.over_limit, 2);
    assert_eq!(snap.near_limit, 1);
}

#[tokio::test]
async fn scenario_7_jitter_extends_expiry() {
    let h = harness(3600, 100);
    h.now.set(0);
    let scope = scope();
    let limit = make_limit(10, Unit::Second, "scenario7", &scope);

    let request = RateLimitRequest::new("test", vec![vec![("k".into(), "v".into())]]);
    h.engine.do_limit(&request, &[Some(limit)]).await.unwrap();

    let commands = h.pool.commands_issued();
    let expire = commands
        .iter()
        .find(|(cmd, _)| cmd == "EXPIRE")
        .expect("an EXPIRE command was issued");
    assert_eq!(expire.1[1], "101");
}

#[tokio::test]
async fn key_derivation_law_matches_bucket_boundaries() {
    let cases = [
        (Unit::Second, 1234i64, "_1234"),
        (Unit::Minute, 1234i64, "_1200"),
        (Unit::Hour, 1_000_000i64, "_997200"),
        (Unit::Day, 1_000_000i64, "_950400"),
    ];

    for (unit, now, suffix) in cases {
        let h = harness(0, 0);
        h.now.set(now);
        let scope = scope();
        let limit = make_limit(1000, unit, "lawtest", &scope);
        let request = RateLimitRequest::new("domain", vec![vec![("k".into(), "v".into())]]);
        h.engine.do_limit(&request, &[Some(limit)]).await.unwrap();

        let commands = h.pool.commands_issued();
        let incrby = commands.iter().find(|(cmd, _)| cmd == "INCRBY").unwrap();
        assert!(
            incrby.1[0].ends_with(suffix),
            "key {} should end with {}",
            incrby.1[0],
            suffix
        );
    }
}

#[tokio::test]
async fn precondition_violation_on_length_mismatch() {
    let h = harness(0, 0);
    let request = RateLimitRequest::new("d", vec![vec![("k".into(), "v".into())]]);
    let err = h.engine.do_limit(&request, &[]).await.unwrap_err();
    assert!(matches!(err, RateLimitError::PreconditionViolation(_)));
}

#[tokio::test]
async fn noop_engine_answers_ok_for_every_descriptor() {
    let engine = NoopEngine;
    let request = RateLimitRequest::new(
        "d",
        vec![
            vec![("a".into(), "b".into())],
            vec![("c".into(), "d".into())],
        ],
    );
    let statuses = engine.do_limit(&request, &[None, None]).await.unwrap();
    assert_eq!(statuses.len(), 2);
    for status in statuses {
        assert_eq!(status.code, Code::Ok);
        assert_eq!(status.limit_remaining, 1000);
    }
}

#[tokio::test]
async fn config_compiles_and_resolves_through_the_full_stack() {
    let raw = RateLimitConfig {
        domain: "messaging".to_string(),
        descriptors: vec![RateLimitDescriptorConfig {
            key: "to_number".to_string(),
            value: None,
            rate_limit: Some(RateLimitSpec {
                requests_per_unit: 100,
                unit: Unit::Day,
                name: None,
            }),
            descriptors: None,
        }],
    };

    let scope = scope();
    let compiled = CompiledRateLimitConfig::compile(raw, &scope).unwrap();
    let limit = compiled
        .find_limit(&[("to_number", "")])
        .expect("matches the value-less descriptor");
    assert_eq!(limit.requests_per_unit, 100);

    let h = harness(0, 0);
    h.now.set(1_000_000);
    h.pool.seed("messaging_messaging.to_number_950400", 1);
    let request = RateLimitRequest::new("messaging", vec![vec![("to_number".into(), "555".into())]]);
    let statuses = h
        .engine
        .do_limit(&request, &[Some(limit.clone())])
        .await
        .unwrap();
    assert_eq!(statuses[0].code, Code::Ok);
}
