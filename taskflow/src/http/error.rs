//! Error taxonomy surfaced to callers of the REST layer.

use taskflow_proto::model::ErrorBody;

/// Errors returned by [`HttpClient`](super::HttpClient) and everything
/// built on it.
///
/// Transport and auth failures are resolved centrally by the client;
/// validation failures travel back to the mutation that caused them.
/// Clonable so one load outcome can be handed to every coalesced waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// The access token was rejected and could not be refreshed. The
    /// session has been cleared.
    #[error("session expired, log in again")]
    SessionExpired,

    /// The server answered 401 and there was no session to refresh.
    #[error("not authenticated")]
    Unauthorized,

    /// A 4xx other than 401: the request itself was rejected.
    #[error("request rejected ({status}): {}", body.message)]
    Validation {
        /// HTTP status.
        status: u16,
        /// Parsed error envelope, including field errors when present.
        body: ErrorBody,
    },

    /// A 5xx from the server.
    #[error("server error ({status}): {message}")]
    Server {
        /// HTTP status.
        status: u16,
        /// Server-provided message, if any.
        message: String,
    },

    /// The request never completed.
    #[error("network failure: {message}")]
    Network {
        /// Transport error text.
        message: String,
        /// Whether the failure was a timeout.
        timeout: bool,
    },

    /// The response body did not have the expected shape.
    #[error("unexpected response: {0}")]
    Decode(String),

    /// The caller stopped waiting.
    #[error("request cancelled")]
    Cancelled,

    /// Refused client-side: the current user may not perform this change.
    #[error("not permitted: {0}")]
    Forbidden(String),

    /// Refused client-side: the target is in a state that forbids the action.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl ApiError {
    /// Whether retrying the same request later could succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Server { .. })
    }

    /// Whether the user has to log in again.
    #[must_use]
    pub const fn requires_login(&self) -> bool {
        matches!(self, Self::SessionExpired | Self::Unauthorized)
    }

    /// Field-level validation message, if the server sent one.
    #[must_use]
    pub fn field_error(&self, field: &str) -> Option<&str> {
        match self {
            Self::Validation { body, .. } => body.field_error(field),
            _ => None,
        }
    }

    /// Map a non-success, non-401 status and its body.
    pub(crate) fn from_status(status: u16, body: &[u8]) -> Self {
        let parsed = ErrorBody::from_bytes(body);
        if status >= 500 {
            Self::Server {
                status,
                message: parsed.message,
            }
        } else {
            Self::Validation {
                status,
                body: parsed,
            }
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return Self::Decode(e.to_string());
        }
        Self::Network {
            timeout: e.is_timeout(),
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}
