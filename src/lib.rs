//! Rate limit decision core.
//!
//! A Rust implementation of a generic, Envoy-compatible rate limit service:
//! domain-scoped, descriptor-matched, backed by a pipelined counter store
//! with a local near-cache to absorb hot over-limit keys.

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod jitter;
pub mod limit;
pub mod metrics;
pub mod near_cache;
pub mod proto;
pub mod service;
pub mod time_source;

pub use config::{CompiledRateLimitConfig, RateLimitConfig};
pub use engine::{DecisionEngine, NoopEngine, RateLimitRequest, RateLimiter};
pub use error::{RateLimitError, Result};
pub use service::RateLimitService;
