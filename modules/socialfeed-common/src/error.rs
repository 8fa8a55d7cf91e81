use std::time::Duration;

use socialfeed_http::TransportError;
use thiserror::Error;

use crate::types::Provider;

pub type Result<T> = std::result::Result<T, FeedError>;

/// Everything that can go wrong while aggregating a feed.
///
/// `Clone` so one in-flight result can be handed to every waiter.
#[derive(Debug, Clone, Error)]
pub enum FeedError {
    #[error("{provider} credentials incomplete, missing: {}", missing.join(", "))]
    ConfigIncomplete {
        provider: Provider,
        missing: Vec<&'static str>,
    },

    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    #[error("Token refresh failed: {0}")]
    TokenRefresh(String),

    #[error("{provider} rate limited")]
    RateLimited {
        provider: Provider,
        retry_after: Option<Duration>,
    },

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Upstream error (status {status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("Config store error: {0}")]
    Store(String),
}

impl FeedError {
    /// Recoverable errors degrade a fetch to an empty (or stale) result.
    /// The rest abort the call.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            FeedError::ConfigIncomplete { .. } | FeedError::Store(_)
        )
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FeedError::RateLimited { .. })
    }
}

impl From<TransportError> for FeedError {
    fn from(err: TransportError) -> Self {
        FeedError::Transient(err.to_string())
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::MalformedResponse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_and_store_errors_are_fatal() {
        let incomplete = FeedError::ConfigIncomplete {
            provider: Provider::Facebook,
            missing: vec!["app_id", "page_name"],
        };
        assert!(!incomplete.is_recoverable());
        assert_eq!(
            incomplete.to_string(),
            "facebook credentials incomplete, missing: app_id, page_name"
        );
        assert!(!FeedError::Store("disk full".into()).is_recoverable());
    }

    #[test]
    fn provider_failures_are_recoverable() {
        let limited = FeedError::RateLimited {
            provider: Provider::Twitter,
            retry_after: Some(Duration::from_secs(60)),
        };
        assert!(limited.is_recoverable());
        assert!(limited.is_rate_limited());
        assert!(FeedError::Transient("timeout".into()).is_recoverable());
        assert!(FeedError::TokenExchange("no page".into()).is_recoverable());
    }

    #[test]
    fn timeouts_map_to_transient() {
        let err: FeedError = TransportError::Timeout("10s elapsed".into()).into();
        assert!(matches!(err, FeedError::Transient(_)));
    }
}
