use std::time::Duration;

/// Typed error hierarchy for enrichment backend operations.
/// Classifies errors as fatal (don't retry) or retryable. Callers of the
/// coordinator never see these — every operation degrades to a fallback.
#[derive(Clone, Debug, thiserror::Error)]
pub enum EnrichError {
    // Fatal — don't retry
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unusable response: {0}")]
    UnusableResponse(String),

    // Retryable
    #[error("model warming up")]
    ModelLoading { retry_after: Option<Duration> },
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("backend error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("network error: {0}")]
    NetworkError(String),

    // Operational
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl EnrichError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ModelLoading { .. }
                | Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::NetworkError(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed(_) | Self::InvalidRequest(_) | Self::UnusableResponse(_)
        )
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        match self {
            Self::ModelLoading { retry_after } | Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::UnusableResponse(_) => "unusable_response",
            Self::ModelLoading { .. } => "model_loading",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::NetworkError(_) => "network_error",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    /// 503 means the hosted model is still loading and is worth retrying.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            400 => Self::InvalidRequest(body),
            429 => Self::RateLimited { retry_after: None },
            503 => Self::ModelLoading { retry_after: None },
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(EnrichError::ModelLoading { retry_after: None }.is_retryable());
        assert!(EnrichError::RateLimited { retry_after: None }.is_retryable());
        assert!(EnrichError::ServerError { status: 500, body: "err".into() }.is_retryable());
        assert!(EnrichError::NetworkError("tcp".into()).is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(EnrichError::AuthenticationFailed("bad key".into()).is_fatal());
        assert!(EnrichError::InvalidRequest("bad".into()).is_fatal());
        assert!(EnrichError::UnusableResponse("empty".into()).is_fatal());
    }

    #[test]
    fn timeout_neither_retryable_nor_fatal() {
        let timeout = EnrichError::Timeout(Duration::from_secs(30));
        assert!(!timeout.is_retryable());
        assert!(!timeout.is_fatal());
    }

    #[test]
    fn suggested_delay_for_transient_variants() {
        let ml = EnrichError::ModelLoading {
            retry_after: Some(Duration::from_secs(10)),
        };
        assert_eq!(ml.suggested_delay(), Some(Duration::from_secs(10)));

        let se = EnrichError::ServerError { status: 500, body: "err".into() };
        assert_eq!(se.suggested_delay(), None);
    }

    #[test]
    fn from_status_mapping() {
        assert!(EnrichError::from_status(401, "unauthorized".into()).is_fatal());
        assert!(EnrichError::from_status(400, "bad request".into()).is_fatal());
        assert!(EnrichError::from_status(429, "rate limited".into()).is_retryable());
        assert!(matches!(
            EnrichError::from_status(503, "loading".into()),
            EnrichError::ModelLoading { .. }
        ));
        assert!(EnrichError::from_status(500, "internal".into()).is_retryable());
        assert!(EnrichError::from_status(502, "bad gateway".into()).is_retryable());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(EnrichError::ModelLoading { retry_after: None }.error_kind(), "model_loading");
        assert_eq!(
            EnrichError::Timeout(Duration::from_secs(1)).error_kind(),
            "timeout"
        );
    }
}
