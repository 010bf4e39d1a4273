use std::time::Duration;

use thiserror::Error;

use crate::models::RemoteRecord;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized - token may be expired")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    /// The record changed since the version the request was based on.
    #[error("Version conflict")]
    Conflict { current: Option<Box<RemoteRecord>> },

    /// A create with this client id was already accepted.
    #[error("Already created as {}", .0.id)]
    AlreadyExists(Box<RemoteRecord>),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("API host unreachable")]
    Unreachable,

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl RemoteError {
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

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => RemoteError::Unauthorized,
            403 => RemoteError::AccessDenied(truncated),
            404 => RemoteError::NotFound(truncated),
            // Conflict answers carry the current envelope when the server has one
            409 | 412 => RemoteError::Conflict {
                current: serde_json::from_str::<RemoteRecord>(body).ok().map(Box::new),
            },
            429 => RemoteError::RateLimited,
            500..=599 => RemoteError::ServerError(truncated),
            400..=499 => RemoteError::Rejected(format!("Status {}: {}", status, truncated)),
            _ => RemoteError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// Worth retrying later: the request may succeed unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::NetworkError(_)
                | RemoteError::Unreachable
                | RemoteError::Timeout(_)
                | RemoteError::ServerError(_)
                | RemoteError::RateLimited
        )
    }
}
