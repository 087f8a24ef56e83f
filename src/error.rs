use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Categorizes errors for handler decision-making.
///
/// This is a lightweight, cloneable representation of the error type
/// that callers can match on without holding the full error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// WebSocket protocol error
    WebSocket,
    /// Connection failed (timeout, refused, DNS, TLS)
    ConnectionFailed,
    /// HTTP transport error
    Http,
    /// Payload could not be encoded or decoded
    Json,
    /// The API answered with a non-success status
    Request,
    /// A rate-limit bucket had no remaining quota
    BucketExhausted,
    /// The request pipeline timed out
    Timeout,
    /// Shard identity outside of its valid range
    InvalidShard,
    /// Invalid configuration
    Config,
    /// Cluster is shutting down
    ShuttingDown,
    /// Other error
    Other,
}

/// Errors that can occur in gateway-cluster
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection could not be established
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON encode/decode error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The API rejected the request
    #[error(transparent)]
    Request(#[from] RequestError),

    /// Rate-limit bucket exhausted after all retries
    #[error(transparent)]
    BucketExhausted(#[from] BucketExhausted),

    /// Request did not complete within the configured timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// A 2xx response had no body where one was required
    #[error("Expected a response body but the API returned none")]
    EmptyResponse,

    /// Shard index is not within `[0, total)`
    #[error("Invalid shard {index} of {total}")]
    InvalidShard { index: u32, total: u32 },

    /// Snapshot does not hold each shard of its layout exactly once
    #[error("Snapshot with {shards} entries does not describe a {total}-shard layout")]
    InvalidSnapshot { shards: usize, total: u32 },

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Cluster is shutting down
    #[error("Cluster is shutting down")]
    ShuttingDown,

    /// Cluster was started twice
    #[error("Cluster is already running")]
    AlreadyRunning,
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WebSocket(_) => ErrorKind::WebSocket,
            Error::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            Error::Http(_) => ErrorKind::Http,
            Error::Json(_) | Error::EmptyResponse => ErrorKind::Json,
            Error::Request(_) => ErrorKind::Request,
            Error::BucketExhausted(_) => ErrorKind::BucketExhausted,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::InvalidShard { .. } | Error::InvalidSnapshot { .. } => ErrorKind::InvalidShard,
            Error::Config(_) => ErrorKind::Config,
            Error::ShuttingDown => ErrorKind::ShuttingDown,
            Error::AlreadyRunning => ErrorKind::Other,
        }
    }

    /// Returns the typed API error if this is a rejected request.
    pub fn as_request_error(&self) -> Option<&RequestError> {
        match self {
            Error::Request(e) => Some(e),
            _ => None,
        }
    }
}

/// Error body returned by the API: `{code, message, errors?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: u64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<serde_json::Value>,
}

/// Status-code family of a rejected request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    TooManyRequests,
    Unknown,
}

impl RequestErrorKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => Self::BadRequest,
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            409 => Self::Conflict,
            429 => Self::TooManyRequests,
            _ => Self::Unknown,
        }
    }
}

/// A non-success API response.
///
/// Carries the HTTP status, the raw body, and the parsed [`ApiError`]
/// when the body was a well-formed error document.
#[derive(Debug, Clone)]
pub struct RequestError {
    pub kind: RequestErrorKind,
    pub status: u16,
    pub body: String,
    pub api_error: Option<ApiError>,
}

impl RequestError {
    pub fn new(status: u16, body: String) -> Self {
        let api_error = if body.trim().is_empty() {
            None
        } else {
            serde_json::from_str::<ApiError>(&body).ok()
        };

        Self {
            kind: RequestErrorKind::from_status(status),
            status,
            body,
            api_error,
        }
    }

    /// Remote error code, if the body parsed
    pub fn code(&self) -> Option<u64> {
        self.api_error.as_ref().map(|e| e.code)
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.api_error {
            Some(api) => {
                write!(
                    f,
                    "{:?} ({}): {} (code {})",
                    self.kind, self.status, api.message, api.code
                )?;
                if let Some(errors) = &api.errors {
                    write!(f, ": {}", errors)?;
                }
                Ok(())
            }
            None => write!(f, "{:?} ({}): {}", self.kind, self.status, self.body),
        }
    }
}

impl std::error::Error for RequestError {}

/// A rate-limit bucket (or the global limit) has no quota left.
///
/// Retryable: waiting `retry_after` is expected to free up quota.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Rate limit bucket {bucket}/{major} exhausted, retry after {retry_after:?}")]
pub struct BucketExhausted {
    pub bucket: String,
    pub major: u64,
    pub retry_after: Duration,
    pub global: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_error_parses_api_body() {
        let err = RequestError::new(
            403,
            r#"{"code":50013,"message":"Missing Permissions"}"#.to_string(),
        );

        assert_eq!(err.kind, RequestErrorKind::Forbidden);
        assert_eq!(err.code(), Some(50013));
        assert_eq!(
            err.to_string(),
            "Forbidden (403): Missing Permissions (code 50013)"
        );
    }

    #[test]
    fn test_request_error_keeps_raw_body() {
        let err = RequestError::new(502, "<html>bad gateway</html>".to_string());

        assert_eq!(err.kind, RequestErrorKind::Unknown);
        assert!(err.api_error.is_none());
        assert_eq!(err.body, "<html>bad gateway</html>");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(RequestErrorKind::from_status(400), RequestErrorKind::BadRequest);
        assert_eq!(RequestErrorKind::from_status(401), RequestErrorKind::Unauthorized);
        assert_eq!(RequestErrorKind::from_status(404), RequestErrorKind::NotFound);
        assert_eq!(RequestErrorKind::from_status(409), RequestErrorKind::Conflict);
        assert_eq!(RequestErrorKind::from_status(429), RequestErrorKind::TooManyRequests);
        assert_eq!(RequestErrorKind::from_status(500), RequestErrorKind::Unknown);
    }

    #[test]
    fn test_error_kind() {
        let err: Error = BucketExhausted {
            bucket: "abc".to_string(),
            major: 1,
            retry_after: Duration::from_millis(250),
            global: false,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::BucketExhausted);
        assert_eq!(Error::Timeout(Duration::from_secs(10)).kind(), ErrorKind::Timeout);
    }
}
