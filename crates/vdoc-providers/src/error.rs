//! Provider error types and retryable/fatal classification.

use thiserror::Error;

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors from external capability calls.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Call timed out after {0}ms")]
    Timeout(u64),

    #[error("Provider rate limited: {0}")]
    RateLimited(String),

    #[error("Provider overloaded: {0}")]
    Overloaded(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Provider {0} is unavailable (cooling down)")]
    Unavailable(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Provider {provider} failed: {message}")]
    Call { provider: String, message: String },

    #[error("All providers failed: {}", .0.join("; "))]
    AllProvidersFailed(Vec<String>),

    #[error("No providers configured")]
    NoProviders,
}

impl ProviderError {
    /// Whether the call may succeed on retry. Timeouts, rate limits,
    /// overload and network failures are transient; bad credentials and
    /// invalid input are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::RateLimited(_)
                | Self::Overloaded(_)
                | Self::Network(_)
                | Self::Unavailable(_)
        )
    }

    /// Whether this error should abort the call immediately.
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ProviderError::Timeout(5000).is_retryable());
        assert!(ProviderError::RateLimited("429".into()).is_retryable());
        assert!(ProviderError::Network("reset".into()).is_retryable());
        assert!(ProviderError::Auth("bad key".into()).is_fatal());
        assert!(ProviderError::InvalidInput("not an image".into()).is_fatal());
    }
}
