//! Generated wire types and gRPC service scaffolding for the rate limit
//! protocol, compiled from `proto/ratelimit.proto` at build time.

pub mod generated {
    tonic::include_proto!("ratelimit.v1");
}

pub use generated::{
    rate_limit_service_server::{RateLimitService, RateLimitServiceServer},
    DescriptorStatus, RateLimit, RateLimitDescriptor, RateLimitDescriptorEntry, RateLimitRequest,
    RateLimitResponse, RateLimitUnit, ResponseCode,
};
