use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Status reported when no response reached us (unreachable host, timeout).
/// Never a real HTTP status, so it cannot be confused with an auth failure.
pub const NETWORK_ERROR_STATUS: u16 = 0;

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub enum ErrorKind {
    /// No response: connectivity or timeout.
    Network,
    /// 401 that may still be fixed by a refresh.
    Unauthorized,
    /// 401 that survived refresh-and-retry, or the refresh itself failed.
    /// The session has been cleared.
    UnauthorizedTerminal,
    /// 4xx carrying field-level detail.
    Validation,
    /// Any other non-2xx.
    #[default]
    Server,
}

/// The one error shape callers of the API ever see.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[error("{title} ({status}): {details}")]
pub struct ApiError {
    #[serde(skip)]
    pub kind: ErrorKind,
    pub title: String,
    pub details: String,
    pub status: u16,
    /// Field-level validation detail, when the server supplied it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// Error body as the server sends it.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    title: String,
    #[serde(alias = "detail")]
    details: String,
    status: Option<u16>,
    error: Option<Value>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, title: impl Into<String>, details: impl Into<String>, status: u16) -> Self {
        Self {
            kind,
            title: title.into(),
            details: details.into(),
            status,
            error: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        let message = message.into();
        let details = if message.is_empty() {
            "Request failed. Check your connection.".to_string()
        } else {
            message
        };
        Self::new(ErrorKind::Network, "Network Error", details, NETWORK_ERROR_STATUS)
    }

    pub fn no_refresh_token() -> Self {
        Self::new(
            ErrorKind::Unauthorized,
            "Unauthorized",
            "No refresh token available. Please sign in again.",
            StatusCode::UNAUTHORIZED.as_u16(),
        )
    }

    pub fn session_expired() -> Self {
        Self::new(
            ErrorKind::UnauthorizedTerminal,
            "Unauthorized",
            "Session expired. Please sign in again.",
            StatusCode::UNAUTHORIZED.as_u16(),
        )
    }

    /// Bad request body on our side; nothing was sent.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, "Invalid Request", message, StatusCode::BAD_REQUEST.as_u16())
    }

    /// A 2xx whose body could not be decoded into the expected type.
    pub fn invalid_response(status: StatusCode, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Server, "Invalid Response", message, status.as_u16())
    }

    /// Normalize a non-2xx response. Server-formatted bodies are kept as-is;
    /// anything else becomes a generic error with the (truncated) body.
    pub fn from_response(status: StatusCode, body: &str) -> Self {
        let status_code = status.as_u16();
        match serde_json::from_str::<ErrorBody>(body) {
            Ok(parsed) => {
                let status_code = parsed.status.unwrap_or(status_code);
                Self {
                    kind: Self::classify(status_code, parsed.error.is_some()),
                    title: parsed.title,
                    details: parsed.details,
                    status: status_code,
                    error: parsed.error,
                }
            }
            Err(_) => {
                let details = if body.trim().is_empty() {
                    status
                        .canonical_reason()
                        .unwrap_or("Request failed.")
                        .to_string()
                } else {
                    Self::truncate_body(body)
                };
                Self::new(Self::classify(status_code, false), "Error", details, status_code)
            }
        }
    }

    fn classify(status: u16, has_detail: bool) -> ErrorKind {
        match status {
            401 => ErrorKind::Unauthorized,
            400..=499 if has_detail => ErrorKind::Validation,
            _ => ErrorKind::Server,
        }
    }

    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    /// Mark this error as a terminal authentication failure.
    pub fn into_terminal(self) -> Self {
        Self {
            kind: ErrorKind::UnauthorizedTerminal,
            status: StatusCode::UNAUTHORIZED.as_u16(),
            ..self
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self.kind, ErrorKind::Unauthorized | ErrorKind::UnauthorizedTerminal)
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == ErrorKind::UnauthorizedTerminal
    }

    pub fn is_network(&self) -> bool {
        self.kind == ErrorKind::Network
    }

    /// Decode the field-level detail into a caller-chosen type.
    pub fn error_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.error
            .as_ref()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

// ============================================================================
// Tests
// ============================================================================
