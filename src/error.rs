use thiserror::Error;

/// Result type for rate limit operations
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Errors that can occur in the rate limit service
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Service error: {0}")]
    Service(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Domain not found: {0}")]
    DomainNotFound(String),

    /// A caller violated the `limits.len() == descriptors.len()` contract.
    #[error("Precondition violation: {0}")]
    PreconditionViolation(String),

    /// A backend reply could not be interpreted as an integer counter.
    #[error("Could not decode backend response: {0}")]
    ResponseDecode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),
}

impl RateLimitError {
    /// True for errors that the decision path treats as fatal to the
    /// current request (spec §7: BackendFailure / PreconditionViolation /
    /// ResponseDecode never produce a partial result).
    pub fn is_request_fatal(&self) -> bool {
        matches!(
            self,
            RateLimitError::Redis(_)
                | RateLimitError::PreconditionViolation(_)
                | RateLimitError::ResponseDecode(_)
        )
    }
}
