use serde_json::Value;
use thiserror::Error;

/// Maximum length for error response bodies carried in error messages.
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Normalized error surface of the core.
///
/// Every failure leaving the crate is one of these variants, so callers
/// never branch on transport-specific error shapes. Payloads are plain
/// strings and JSON values, which keeps the type `Clone` - one outcome can
/// be delivered to every waiter of a shared operation.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// No usable credential for the active session.
    #[error("not authenticated")]
    NotAuthenticated,

    /// The refresh call was rejected or exhausted its retries. Terminal
    /// for the session; never retried automatically.
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    /// Timeout or connection failure - retry-eligible.
    #[error("network error: {0}")]
    NetworkTransient(String),

    /// HTTP 429 - retry-eligible with backoff.
    #[error("rate limited - please wait before retrying")]
    RateLimited,

    /// HTTP 5xx - retry-eligible.
    #[error("server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    /// 4xx other than 401/429 - surfaced unchanged with field detail when
    /// the backend provides it.
    #[error("{message}")]
    Validation {
        message: String,
        details: Option<Value>,
    },

    /// A 2xx whose body could not be understood.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session switch failed: {0}")]
    SwitchFailed(String),

    /// Failure in the persistent key/value partitions.
    #[error("storage error: {0}")]
    Storage(String),
}

impl ApiError {
    /// Truncate a response body to avoid carrying excessive data around.
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            format!(
                "{}... (truncated, {} total bytes)",
                &body[..MAX_ERROR_BODY_LENGTH],
                body.len()
            )
        }
    }

    /// Classify an HTTP failure status. 401 is normally intercepted by the
    /// dispatcher before this is reached.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 => ApiError::NotAuthenticated,
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError {
                status,
                message: Self::truncate_body(body),
            },
            _ => Self::validation_from_body(status, body),
        }
    }

    /// Build a `Validation` error, extracting `{message, errors}` when the
    /// backend sent a structured body.
    fn validation_from_body(status: u16, body: &str) -> Self {
        #[derive(serde::Deserialize)]
        struct ErrorBody {
            #[serde(default)]
            message: Option<String>,
            #[serde(default, alias = "details")]
            errors: Option<Value>,
        }

        if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
            if parsed.message.is_some() || parsed.errors.is_some() {
                return ApiError::Validation {
                    message: parsed
                        .message
                        .unwrap_or_else(|| format!("request rejected with status {status}")),
                    details: parsed.errors,
                };
            }
        }
        ApiError::Validation {
            message: format!("status {}: {}", status, Self::truncate_body(body)),
            details: None,
        }
    }

    /// Stable machine-readable class, for callers that branch on kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::NotAuthenticated => "not_authenticated",
            ApiError::RefreshFailed(_) => "refresh_failed",
            ApiError::NetworkTransient(_) => "network_transient",
            ApiError::RateLimited => "rate_limited",
            ApiError::ServerError { .. } => "server_error",
            ApiError::Validation { .. } => "validation",
            ApiError::InvalidResponse(_) => "invalid_response",
            ApiError::SessionNotFound(_) => "session_not_found",
            ApiError::SwitchFailed(_) => "switch_failed",
            ApiError::Storage(_) => "storage",
        }
    }

    /// Whether the dispatcher may retry this failure with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::NetworkTransient(_) | ApiError::RateLimited | ApiError::ServerError { .. }
        )
    }

    /// Normalize a storage-layer failure.
    pub(crate) fn storage(err: anyhow::Error) -> Self {
        ApiError::Storage(format!("{err:#}"))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::NetworkTransient(err.to_string())
    }
}
