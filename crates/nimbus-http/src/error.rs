//! Normalized API errors.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Error returned by every failed request.
///
/// Non-2xx responses, transport failures and undecodable bodies all end up
/// here so callers only ever match on one shape.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ApiError {
    /// Human readable message.
    pub message: String,
    /// Machine readable code, e.g. `NOT_FOUND` or `NETWORK_ERROR`.
    pub code: String,
    /// HTTP status, absent when no response arrived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Extra detail sent by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ApiError {
    /// Create an error with no status or details.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
            status_code: None,
            details: None,
        }
    }

    /// Build an error from a non-2xx response.
    ///
    /// JSON bodies of the form `{message, code, details}` are honored; an
    /// `error` field is accepted in place of `message`. Missing parts fall
    /// back to the status line.
    pub fn from_response(status: u16, status_text: &str, body: &str) -> Self {
        let parsed = serde_json::from_str::<Value>(body).ok();
        let field = |name: &str| {
            parsed
                .as_ref()
                .and_then(|value| value.get(name))
                .and_then(Value::as_str)
                .map(str::to_owned)
        };

        let message = field("message")
            .or_else(|| field("error"))
            .filter(|message| !message.is_empty())
            .or_else(|| {
                let text = body.trim();
                (parsed.is_none() && !text.is_empty()).then(|| text.to_owned())
            })
            .unwrap_or_else(|| format!("Request failed with status {status} {status_text}"));

        Self {
            message,
            code: field("code").unwrap_or_else(|| status_code_name(status).to_owned()),
            status_code: Some(status),
            details: parsed.as_ref().and_then(|value| value.get("details")).cloned(),
        }
    }

    /// Check if the error came from a server response.
    #[must_use]
    pub fn is_http(&self) -> bool {
        self.status_code.is_some()
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        let code = if err.is_timeout() {
            "TIMEOUT"
        } else if err.is_builder() {
            "INVALID_REQUEST"
        } else if err.is_decode() {
            "INVALID_RESPONSE"
        } else {
            "NETWORK_ERROR"
        };
        Self {
            message: err.to_string(),
            code: code.to_owned(),
            status_code: err.status().map(|status| status.as_u16()),
            details: None,
        }
    }
}

fn status_code_name(status: u16) -> &'static str {
    match status {
        400 => "BAD_REQUEST",
        401 => "UNAUTHORIZED",
        403 => "FORBIDDEN",
        404 => "NOT_FOUND",
        409 => "CONFLICT",
        422 => "UNPROCESSABLE_ENTITY",
        429 => "RATE_LIMITED",
        500..=599 => "SERVER_ERROR",
        _ => "HTTP_ERROR",
    }
}
