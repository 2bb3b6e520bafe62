//! Realtime endpoint derivation.
//!
//! The realtime socket lives on the same host as the REST API. Its URL is
//! the API origin with the scheme switched to `ws`/`wss`, the realtime path
//! appended and the credentials carried as query parameters.

use nimbus_protocol::Version;
use url::Url;

use crate::error::RealtimeError;

fn invalid(message: String) -> RealtimeError {
    RealtimeError::InvalidConfig(message)
}

/// Derive the realtime endpoint from a REST base URL.
///
/// Any path, query or fragment on `base_url` is dropped.
///
/// # Errors
///
/// Returns [`RealtimeError::InvalidConfig`] if the URL does not parse, has
/// no recognised scheme or no host, or embeds credentials.
pub fn realtime_endpoint(base_url: &str, path: &str) -> Result<String, RealtimeError> {
    let mut url = Url::parse(base_url.trim())
        .map_err(|err| invalid(format!("invalid base URL {base_url:?}: {err}")))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(invalid(format!("unsupported scheme {other:?}"))),
    };
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid(format!("missing host in {base_url:?}")));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(invalid("base URL must not carry credentials".into()));
    }

    url.set_scheme(scheme)
        .map_err(|()| invalid(format!("cannot switch {base_url:?} to {scheme}")))?;
    let path = path.trim();
    if path.starts_with('/') {
        url.set_path(path);
    } else {
        url.set_path(&format!("/{path}"));
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.into())
}

/// Append the API key and protocol version to an endpoint.
///
/// # Errors
///
/// Returns [`RealtimeError::InvalidConfig`] if `endpoint` does not parse.
pub fn with_credentials(
    endpoint: &str,
    api_key: &str,
    version: Version,
) -> Result<String, RealtimeError> {
    let mut url = Url::parse(endpoint.trim())
        .map_err(|err| invalid(format!("invalid endpoint {endpoint:?}: {err}")))?;
    url.query_pairs_mut()
        .append_pair("apiKey", api_key)
        .append_pair("protocol", &version.to_string());
    Ok(url.into())
}
