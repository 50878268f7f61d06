use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Router};
use prometheus::{Registry, TextEncoder};
use tokio::net::TcpListener;
use tonic::transport::Server;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rust_ratelimit::backend::{Pool, RedisConfig, RedisPool};
use rust_ratelimit::config::{load_config_from_file, CompiledRateLimitConfig};
use rust_ratelimit::engine::{DecisionEngine, EngineConfig, NoopEngine, RateLimiter};
use rust_ratelimit::error::RateLimitError;
use rust_ratelimit::jitter::RandJitter;
use rust_ratelimit::metrics::{Metrics, Scope};
use rust_ratelimit::near_cache::MokaLocalCache;
use rust_ratelimit::proto::{
    self, DescriptorStatus as WireDescriptorStatus, RateLimit as WireRateLimit,
    RateLimitRequest as WireRateLimitRequest, RateLimitResponse as WireRateLimitResponse,
    RateLimitUnit, ResponseCode,
};
use rust_ratelimit::service::{OverallCode, RateLimitService};
use rust_ratelimit::time_source::SystemTimeSource;

#[derive(Clone)]
struct AppState {
    service: Arc<RateLimitService>,
    metrics: Arc<Metrics>,
    scope: Arc<Scope>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rust_ratelimit=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting rate limit service");

    let registry = Arc::new(Registry::new());
    let scope = Arc::new(Scope::new(registry.clone(), "ratelimit").context("registering metrics scope")?);
    let metrics = Arc::new(Metrics::new(registry).context("registering service metrics")?);

    let engine = build_engine(&scope).await?;
    let service = Arc::new(RateLimitService::new(engine, metrics.clone()));

    if let Ok(config_path) = std::env::var("CONFIG_PATH") {
        load_and_add_config(&service, &scope, &config_path).await?;
    }

    let state = AppState {
        service: service.clone(),
        metrics,
        scope,
    };

    let http_addr: SocketAddr = std::env::var("HTTP_PORT")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse()
        .context("parsing HTTP_PORT")?;
    let grpc_addr: SocketAddr = std::env::var("GRPC_PORT")
        .unwrap_or_else(|_| "0.0.0.0:8081".to_string())
        .parse()
        .context("parsing GRPC_PORT")?;

    let http_server = start_http_server(state, http_addr);
    let grpc_server = start_grpc_server(service, grpc_addr);

    info!(%http_addr, "http server listening");
    info!(%grpc_addr, "grpc server listening");

    tokio::select! {
        result = http_server => {
            if let Err(e) = result {
                warn!("http server error: {e}");
            }
        }
        result = grpc_server => {
            if let Err(e) = result {
                warn!("grpc server error: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
    }

    Ok(())
}

/// Builds the decision engine from environment configuration, falling back
/// to the no-op engine when no primary backend URL is set — matching the
/// standalone mode used in development and in tests that don't need a
/// live counter store.
async fn build_engine(scope: &Arc<Scope>) -> Result<Arc<dyn RateLimiter>> {
    let Ok(redis_url) = std::env::var("REDIS_URL") else {
        warn!("REDIS_URL not set, running with the no-op engine");
        return Ok(Arc::new(NoopEngine));
    };

    let primary_config = RedisConfig {
        url: redis_url,
        ..Default::default()
    };
    let primary: Arc<dyn Pool> = Arc::new(
        RedisPool::connect(primary_config, false, scope)
            .await
            .context("connecting to primary redis backend")?,
    );

    let per_second: Option<Arc<dyn Pool>> = match std::env::var("REDIS_PERSECOND_URL") {
        Ok(url) if std::env::var("USE_PER_SECOND_BACKEND").map(|v| v == "true").unwrap_or(true) => {
            let config = RedisConfig {
                url,
                ..Default::default()
            };
            let pool = RedisPool::connect(config, true, scope)
                .await
                .context("connecting to per-second redis backend")?;
            Some(Arc::new(pool))
        }
        _ => None,
    };

    let local_cache_size: u64 = std::env::var("LOCAL_CACHE_SIZE_BYTES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1000);

    let jitter_max: i64 = std::env::var("EXPIRATION_JITTER_MAX_SECONDS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let engine = DecisionEngine::new(
        primary,
        per_second,
        Arc::new(MokaLocalCache::new(local_cache_size)),
        Arc::new(SystemTimeSource),
        Arc::new(RandJitter),
        EngineConfig {
            expiration_jitter_max_seconds: jitter_max,
        },
        None,
    );

    Ok(Arc::new(engine))
}

async fn load_and_add_config(
    service: &Arc<RateLimitService>,
    scope: &Arc<Scope>,
    config_path: &str,
) -> Result<()> {
    info!(%config_path, "loading configuration");
    let raw = load_config_from_file(config_path).context("reading configuration file")?;
    let compiled = CompiledRateLimitConfig::compile(raw, scope).context("compiling configuration")?;
    service.add_config(compiled).await;
    Ok(())
}

async fn start_http_server(state: AppState, addr: SocketAddr) -> Result<()> {
    let app = Router::new()
        .route("/healthcheck", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}

async fn metrics_handler(State(state): State<AppState>) -> String {
    state.scope.flush();
    let encoder = TextEncoder::new();
    let families = state.metrics.registry().gather();
    encoder.encode_to_string(&families).unwrap_or_default()
}

async fn start_grpc_server(service: Arc<RateLimitService>, addr: SocketAddr) -> Result<()> {
    let grpc_service = RateLimitGrpcService { service };
    Server::builder()
        .add_service(proto::RateLimitServiceServer::new(grpc_service))
        .serve(addr)
        .await?;
    Ok(())
}

struct RateLimitGrpcService {
    service: Arc<RateLimitService>,
}

#[tonic::async_trait]
impl proto::RateLimitService for RateLimitGrpcService {
    async fn should_rate_limit(
        &self,
        request: tonic::Request<WireRateLimitRequest>,
    ) -> std::result::Result<tonic::Response<WireRateLimitResponse>, tonic::Status> {
        let req = request.into_inner();

        let descriptors = req
            .descriptors
            .into_iter()
            .map(|d| {
                d.entries
                    .into_iter()
                    .map(|e| (e.key, e.value))
                    .collect::<Vec<_>>()
            })
            .collect();

        // The wire format can't distinguish "omitted" from an explicit
        // zero in a proto3 scalar field; zero is treated as "use the
        // default of one", matching Envoy's own rate limit protocol.
        let hits_addend = if req.hits_addend == 0 { 1 } else { req.hits_addend };

        let internal_request = rust_ratelimit::engine::RateLimitRequest::new(req.domain, descriptors)
            .with_hits_addend(hits_addend);

        match self.service.should_rate_limit(&internal_request).await {
            Ok(response) => {
                let overall_code = match response.overall_code {
                    OverallCode::Ok => ResponseCode::Ok as i32,
                    OverallCode::OverLimit => ResponseCode::OverLimit as i32,
                };
                let statuses = response
                    .statuses
                    .into_iter()
                    .map(|status| WireDescriptorStatus {
                        code: match status.code {
                            rust_ratelimit::engine::Code::Ok => ResponseCode::Ok as i32,
                            rust_ratelimit::engine::Code::OverLimit => ResponseCode::OverLimit as i32,
                        },
                        current_limit: status.current_limit.map(|limit| WireRateLimit {
                            requests_per_unit: limit.requests_per_unit,
                            unit: match limit.unit {
                                rust_ratelimit::limit::Unit::Second => RateLimitUnit::Second as i32,
                                rust_ratelimit::limit::Unit::Minute => RateLimitUnit::Minute as i32,
                                rust_ratelimit::limit::Unit::Hour => RateLimitUnit::Hour as i32,
                                rust_ratelimit::limit::Unit::Day => RateLimitUnit::Day as i32,
                            },
                        }),
                        limit_remaining: status.limit_remaining,
                    })
                    .collect();
                Ok(tonic::Response::new(WireRateLimitResponse {
                    overall_code,
                    statuses,
                }))
            }
            Err(e) => Err(to_status(e)),
        }
    }
}

fn to_status(err: RateLimitError) -> tonic::Status {
    match &err {
        RateLimitError::DomainNotFound(domain) => {
            return tonic::Status::not_found(format!("domain not found: {domain}"));
        }
        RateLimitError::Service(msg) | RateLimitError::InvalidDescriptor(msg) => {
            return tonic::Status::invalid_argument(msg.clone());
        }
        _ => {}
    }

    // Everything else funnels through the taxonomy's fatal/non-fatal split:
    // BackendFailure, PreconditionViolation and ResponseDecode are fatal to
    // the request and map to the transport's generic "try again elsewhere"
    // status; anything not in that set is an internal defect.
    if err.is_request_fatal() {
        tonic::Status::unavailable(err.to_string())
    } else {
        tonic::Status::internal(err.to_string())
    }
}
