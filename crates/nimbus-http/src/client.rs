//! HTTP client.

use crate::error::ApiError;
use crate::request::RequestConfig;
use reqwest::{Method, Response, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Header carrying the project API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Timeout applied when a request does not set its own.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Status line and headers of a successful response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub status: u16,
    pub status_text: String,
    /// Header names are lowercase; repeated headers keep the last value.
    pub headers: HashMap<String, String>,
}

/// A decoded successful response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub data: T,
    pub meta: ResponseMeta,
}

/// JSON client bound to one base URL and API key.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct HttpClient {
    base_url: String,
    /// `base_url` with a trailing slash, so relative paths extend it.
    base: Url,
    api_key: String,
    http: reqwest::Client,
}

impl HttpClient {
    /// Create a client with the default timeout.
    ///
    /// # Errors
    ///
    /// Fails on an empty API key, a base URL that is not http(s), or if the
    /// underlying client cannot be built.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, ApiError> {
        Self::with_timeout(base_url, api_key, DEFAULT_TIMEOUT)
    }

    /// Create a client with a custom default timeout.
    ///
    /// # Errors
    ///
    /// See [`HttpClient::new`].
    pub fn with_timeout(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let base = parse_base_url(&base_url.into())?;
        let base_url = base.as_str().trim_end_matches('/').to_string();

        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ApiError::new("INVALID_CONFIG", "API key is required"));
        }

        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url,
            base,
            api_key,
            http,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Absolute URL for an API path.
    ///
    /// Absolute http(s) URLs are used as they are.
    ///
    /// # Errors
    ///
    /// Fails if `path` is not a valid URL reference.
    pub fn url(&self, path: &str) -> Result<Url, ApiError> {
        join_url(&self.base, path)
    }

    /// # Errors
    ///
    /// Any non-2xx status, network failure or undecodable body.
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        config: Option<&RequestConfig>,
    ) -> Result<ApiResponse<T>, ApiError> {
        self.request(Method::GET, path, None, config).await
    }

    /// # Errors
    ///
    /// Any non-2xx status, network failure or undecodable body.
    pub async fn post<B, T>(
        &self,
        path: &str,
        body: Option<&B>,
        config: Option<&RequestConfig>,
    ) -> Result<ApiResponse<T>, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = to_body(body)?;
        self.request(Method::POST, path, body, config).await
    }

    /// # Errors
    ///
    /// Any non-2xx status, network failure or undecodable body.
    pub async fn put<B, T>(
        &self,
        path: &str,
        body: Option<&B>,
        config: Option<&RequestConfig>,
    ) -> Result<ApiResponse<T>, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = to_body(body)?;
        self.request(Method::PUT, path, body, config).await
    }

    /// # Errors
    ///
    /// Any non-2xx status, network failure or undecodable body.
    pub async fn patch<B, T>(
        &self,
        path: &str,
        body: Option<&B>,
        config: Option<&RequestConfig>,
    ) -> Result<ApiResponse<T>, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = to_body(body)?;
        self.request(Method::PATCH, path, body, config).await
    }

    /// # Errors
    ///
    /// Any non-2xx status, network failure or undecodable body.
    pub async fn delete<T: DeserializeOwned>(
        &self,
        path: &str,
        config: Option<&RequestConfig>,
    ) -> Result<ApiResponse<T>, ApiError> {
        self.request(Method::DELETE, path, None, config).await
    }

    /// Send a request and decode the JSON answer.
    ///
    /// An empty success body decodes as `null`, so `()` and `Option<_>`
    /// work as response types.
    ///
    /// # Errors
    ///
    /// Any non-2xx status, network failure or undecodable body.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        config: Option<&RequestConfig>,
    ) -> Result<ApiResponse<T>, ApiError> {
        let url = self.url(path)?;
        debug!(method = %method, url = %url, "HTTP request");

        let mut builder = self
            .http
            .request(method.clone(), url.clone())
            .header(API_KEY_HEADER, &self.api_key)
            .header(reqwest::header::ACCEPT, "application/json");

        if let Some(config) = config {
            for (name, value) in &config.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if !config.query.is_empty() {
                builder = builder.query(&config.query);
            }
            if let Some(timeout) = config.timeout {
                builder = builder.timeout(timeout);
            }
        }
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let response = builder.send().await.map_err(|err| {
            warn!(method = %method, url = %url, error = %err, "HTTP request failed");
            ApiError::from(err)
        })?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<ApiResponse<T>, ApiError> {
    let status = response.status();
    let meta = ResponseMeta {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_string(),
        headers: response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect(),
    };

    let text = response.text().await?;
    if !status.is_success() {
        let err = ApiError::from_response(meta.status, &meta.status_text, &text);
        debug!(status = meta.status, code = %err.code, "HTTP error response");
        return Err(err);
    }

    let data = if text.trim().is_empty() {
        serde_json::from_value(Value::Null)
    } else {
        serde_json::from_str(&text)
    }
    .map_err(|err| ApiError {
        status_code: Some(meta.status),
        ..ApiError::new("INVALID_RESPONSE", format!("Failed to decode response: {err}"))
    })?;

    Ok(ApiResponse { data, meta })
}

fn to_body<B: Serialize + ?Sized>(body: Option<&B>) -> Result<Option<Value>, ApiError> {
    body.map(serde_json::to_value)
        .transpose()
        .map_err(|err| ApiError::new("INVALID_REQUEST", format!("Failed to encode body: {err}")))
}

fn parse_base_url(base_url: &str) -> Result<Url, ApiError> {
    let invalid = |reason: String| ApiError::new("INVALID_CONFIG", reason);
    let mut url = Url::parse(base_url.trim())
        .map_err(|err| invalid(format!("invalid base URL {base_url:?}: {err}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("base URL must be http(s): {base_url}")));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid(format!("missing host in {base_url:?}")));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(invalid("base URL must not carry credentials".into()));
    }

    url.set_query(None);
    url.set_fragment(None);
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn join_url(base: &Url, path: &str) -> Result<Url, ApiError> {
    base.join(path.trim_start_matches('/')).map_err(|err| {
        ApiError::new("INVALID_REQUEST", format!("invalid request path {path:?}: {err}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        let base = parse_base_url("http://api/v1").unwrap();
        let join = |path: &str| join_url(&base, path).unwrap().to_string();
        assert_eq!(join("/tables"), "http://api/v1/tables");
        assert_eq!(join("tables?limit=5"), "http://api/v1/tables?limit=5");
        assert_eq!(join(""), "http://api/v1/");
        assert_eq!(join("https://other/x"), "https://other/x");
    }

    #[test]
    fn test_new_trims_base_url() {
        let client = HttpClient::new("http://localhost:3000/api/v1/?debug=1", "key").unwrap();
        assert_eq!(client.base_url(), "http://localhost:3000/api/v1");
        assert_eq!(
            client.url("/orders").unwrap().as_str(),
            "http://localhost:3000/api/v1/orders"
        );
        assert_eq!(client.api_key(), "key");
    }

    #[test]
    fn test_new_rejects_bad_config() {
        for base_url in [
            "ftp://x",
            "localhost:3000",
            "http://exa mple.com",
            "https://:443/v1",
            "https://user:pw@api.example.com",
        ] {
            let err = HttpClient::new(base_url, "key").unwrap_err();
            assert_eq!(err.code, "INVALID_CONFIG", "{base_url:?}");
            assert!(!err.message.contains("pw"));
        }
        assert_eq!(
            HttpClient::new("http://x", "  ").unwrap_err().code,
            "INVALID_CONFIG"
        );
    }
}
