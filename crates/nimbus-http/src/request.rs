//! Per-request options.

use std::time::Duration;

/// Extra headers, query parameters and timeout for a single request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestConfig {
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    /// Overrides the client timeout.
    pub timeout: Option<Duration>,
}

impl RequestConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
