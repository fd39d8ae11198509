use thiserror::Error;

/// Message used for 4xx responses without a `detail` field.
const DEFAULT_CLIENT_MESSAGE: &str = "Request failed";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Session expired. Please sign in again.")]
    SessionExpired { status: u16 },

    #[error("{message}")]
    Client { status: u16, message: String },

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Request timed out. Please try again.")]
    Timeout,

    #[error("Network error. Please check your connection.")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Pull the human-readable `detail` field out of a JSON error body.
    fn detail(body: &str) -> Option<String> {
        let value: serde_json::Value = serde_json::from_str(body).ok()?;
        match value.get("detail")? {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) if s.is_empty() => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let code = status.as_u16();
        match code {
            401 | 403 => ApiError::SessionExpired { status: code },
            500..=599 => ApiError::Server {
                status: code,
                message: Self::detail(body).unwrap_or_else(|| Self::truncate_body(body)),
            },
            _ => ApiError::Client {
                status: code,
                message: Self::detail(body).unwrap_or_else(|| DEFAULT_CLIENT_MESSAGE.to_string()),
            },
        }
    }

    /// Status code reported to callers. Timeouts report 408 and transport
    /// failures without a response report 0.
    pub fn status(&self) -> u16 {
        match self {
            ApiError::SessionExpired { status }
            | ApiError::Client { status, .. }
            | ApiError::Server { status, .. } => *status,
            ApiError::Timeout => 408,
            ApiError::Network(_) | ApiError::InvalidResponse(_) => 0,
        }
    }

    /// 401/403: the session is no longer valid.
    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::SessionExpired { .. })
    }

    /// Whether the transport may retry the request that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::Server { .. } | ApiError::Timeout | ApiError::Network(_)
        )
    }
}
