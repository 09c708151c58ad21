use std::fmt;

use axum::http::StatusCode;

/// How an upstream failure should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    RateLimited,
    Transient,
    Fatal,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::RateLimited | FailureKind::Transient)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Transient => "transient",
            FailureKind::Fatal => "fatal",
        }
    }

    /// Classify a status code returned by the blob store.
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            // 509 is the non-standard "Bandwidth Limit Exceeded"
            429 | 509 => FailureKind::RateLimited,
            408 | 500 | 502 | 503 | 504 => FailureKind::Transient,
            _ => FailureKind::Fatal,
        }
    }

    /// Classify a free-form error message, for collaborators that only report text.
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        const RATE_LIMITED: [&str; 4] = [
            "rate limit",
            "bandwidth limit exceeded",
            "too many requests",
            "429",
        ];
        const TRANSIENT: [&str; 7] = [
            "econnreset",
            "epipe",
            "etimedout",
            "network",
            "invalid response",
            "connection reset",
            "timed out",
        ];

        if RATE_LIMITED.iter().any(|p| lower.contains(p)) {
            FailureKind::RateLimited
        } else if TRANSIENT.iter().any(|p| lower.contains(p)) {
            FailureKind::Transient
        } else {
            FailureKind::Fatal
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure reported by the remote store, classified once where the call was made.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} upstream failure: {message}")]
pub struct UpstreamError {
    pub kind: FailureKind,
    pub message: String,
}

impl UpstreamError {
    pub fn new<S: Into<String>>(kind: FailureKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rate_limited<S: Into<String>>(message: S) -> Self {
        Self::new(FailureKind::RateLimited, message)
    }

    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    pub fn fatal<S: Into<String>>(message: S) -> Self {
        Self::new(FailureKind::Fatal, message)
    }

    pub fn from_status(status: StatusCode, context: &str) -> Self {
        Self::new(
            FailureKind::from_status(status),
            format!("{context}: upstream returned {status}"),
        )
    }

    pub fn from_message<S: Into<String>>(message: S) -> Self {
        let message = message.into();
        Self::new(FailureKind::from_message(&message), message)
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::new(FailureKind::from_status(status), err.to_string());
        }
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            return Self::transient(err.to_string());
        }
        Self::from_message(err.to_string())
    }
}

/// Outcome of a failed [`crate::fetcher::ResilientFetcher::open`] call.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The caller went away; nothing should be written back.
    #[error("fetch cancelled")]
    Cancelled,

    #[error("upstream failed after {attempts} attempt(s): {source}")]
    Upstream {
        attempts: u32,
        #[source]
        source: UpstreamError,
    },
}

impl FetchError {
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            FetchError::Cancelled => None,
            FetchError::Upstream { source, .. } => Some(source.kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(FailureKind::from_status(StatusCode::TOO_MANY_REQUESTS), FailureKind::RateLimited);
        assert_eq!(
            FailureKind::from_status(StatusCode::from_u16(509).unwrap()),
            FailureKind::RateLimited
        );
        assert_eq!(FailureKind::from_status(StatusCode::SERVICE_UNAVAILABLE), FailureKind::Transient);
        assert_eq!(FailureKind::from_status(StatusCode::GATEWAY_TIMEOUT), FailureKind::Transient);
        assert_eq!(FailureKind::from_status(StatusCode::UNAUTHORIZED), FailureKind::Fatal);
        assert_eq!(FailureKind::from_status(StatusCode::PAYMENT_REQUIRED), FailureKind::Fatal);
    }

    #[test]
    fn test_message_classification() {
        assert_eq!(FailureKind::from_message("Bandwidth limit exceeded"), FailureKind::RateLimited);
        assert_eq!(FailureKind::from_message("HTTP 429 from store"), FailureKind::RateLimited);
        assert_eq!(FailureKind::from_message("read ECONNRESET"), FailureKind::Transient);
        assert_eq!(FailureKind::from_message("Invalid response from API"), FailureKind::Transient);
        assert_eq!(FailureKind::from_message("EBLOCKED: account suspended"), FailureKind::Fatal);
    }

    #[test]
    fn test_retryable() {
        assert!(FailureKind::RateLimited.is_retryable());
        assert!(FailureKind::Transient.is_retryable());
        assert!(!FailureKind::Fatal.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = FetchError::Upstream {
            attempts: 4,
            source: UpstreamError::rate_limited("slow down"),
        };
        assert_eq!(
            err.to_string(),
            "upstream failed after 4 attempt(s): rate_limited upstream failure: slow down"
        );
        assert_eq!(err.kind(), Some(FailureKind::RateLimited));
        assert_eq!(FetchError::Cancelled.kind(), None);
    }
}
