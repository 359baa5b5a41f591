use serde::Deserialize;
use thiserror::Error;

use crate::auth::RenewalError;

/// `errorCode` the backend returns when the access token has expired
pub const TOKEN_EXPIRED_CODE: &str = "TOKEN_EXPIRED";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Access token expired: {message}")]
    TokenExpired { message: String },

    #[error("Unauthorized: {message}")]
    Unauthorized { code: Option<String>, message: String },

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Request rejected with status {status}: {message}")]
    Rejected {
        status: u16,
        code: Option<String>,
        message: String,
        details: Vec<String>,
    },

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Token renewal failed: {0}")]
    Renewal(#[from] RenewalError),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Error body shape used by the backend. Older endpoints only send `error`.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(rename = "errorCode", default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub details: Vec<String>,
}

impl ErrorBody {
    pub(crate) fn parse(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_default()
    }

    /// Machine-readable code, from `errorCode` or the legacy `error` field
    pub(crate) fn code(&self) -> Option<&str> {
        self.error_code.as_deref().or(self.error.as_deref())
    }

    fn human_message(&self) -> Option<String> {
        self.message
            .clone()
            .filter(|m| !m.is_empty())
            .or_else(|| self.error.clone())
    }
}

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    pub(crate) fn truncate_body(body: &str) -> String {
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

    pub fn from_status(status: u16, body: &str) -> Self {
        let parsed = ErrorBody::parse(body);
        let code = parsed.code().map(str::to_string);
        let message = parsed
            .human_message()
            .unwrap_or_else(|| Self::truncate_body(body));

        match status {
            401 if code.as_deref() == Some(TOKEN_EXPIRED_CODE) => ApiError::TokenExpired { message },
            401 => ApiError::Unauthorized { code, message },
            403 => ApiError::AccessDenied(message),
            404 => ApiError::NotFound(message),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(message),
            _ => ApiError::Rejected {
                status,
                code,
                message,
                details: parsed.details,
            },
        }
    }

    pub fn is_token_expired(&self) -> bool {
        matches!(self, ApiError::TokenExpired { .. })
    }

    /// Backend `errorCode`, when the response carried one
    pub fn code(&self) -> Option<&str> {
        match self {
            ApiError::TokenExpired { .. } => Some(TOKEN_EXPIRED_CODE),
            ApiError::Unauthorized { code, .. } | ApiError::Rejected { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Validation details attached to a rejected request
    pub fn details(&self) -> &[String] {
        match self {
            ApiError::Rejected { details, .. } => details,
            _ => &[],
        }
    }

    pub fn is_validation_error(&self) -> bool {
        matches!(self.code(), Some("VALIDATION_ERROR") | Some("VALIDATION_FAILED"))
    }

    /// Message suitable for a toast: backend message when present, otherwise a default per status
    pub fn display_message(&self) -> String {
        match self {
            ApiError::Rejected { message, details, .. } if self.is_validation_error() && !details.is_empty() => {
                format!("{}: {}", message, details.join(", "))
            }
            ApiError::TokenExpired { .. } => "Your session has expired. Please log in again.".to_string(),
            ApiError::Unauthorized { message, .. }
            | ApiError::AccessDenied(message)
            | ApiError::NotFound(message)
            | ApiError::ServerError(message)
            | ApiError::Rejected { message, .. }
                if !message.is_empty() =>
            {
                message.clone()
            }
            ApiError::NetworkError(_) => "Please check your network connection.".to_string(),
            other => match other.status() {
                Some(status) => default_message(status).to_string(),
                None => other.to_string(),
            },
        }
    }

    /// HTTP status this error was built from, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::TokenExpired { .. } | ApiError::Unauthorized { .. } => Some(401),
            ApiError::AccessDenied(_) => Some(403),
            ApiError::NotFound(_) => Some(404),
            ApiError::RateLimited => Some(429),
            ApiError::ServerError(_) => Some(500),
            ApiError::Rejected { status, .. } => Some(*status),
            ApiError::NetworkError(e) => e.status().map(|s| s.as_u16()),
            ApiError::InvalidResponse(_) | ApiError::Renewal(_) => None,
        }
    }
}

fn default_message(status: u16) -> &'static str {
    match status {
        400 => "Please check your input.",
        401 => "Authentication is required.",
        403 => "You do not have permission.",
        404 => "The requested resource was not found.",
        409 => "The data conflicts with an existing record.",
        422 => "The request could not be processed.",
        429 => "Too many requests. Please try again shortly.",
        500..=599 => "A server error occurred. Please try again shortly.",
        _ => "An error occurred.",
    }
}
