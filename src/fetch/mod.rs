//! HTTP plumbing for the sensor API.

mod basic;
mod client;
pub mod auth;

pub use basic::BasicClient;
pub use client::HttpClient;

use reqwest::StatusCode;
use tracing::debug;

use crate::error::FetchError;

/// Maps a non-success HTTP status onto the retry taxonomy.
///
/// Rate limiting, request timeouts and server errors are transient;
/// everything else (bad key, bad request, unknown sensor) is fatal.
pub fn classify_status(status: StatusCode, body: &str) -> FetchError {
    let msg = format!("HTTP {}: {}", status, body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        FetchError::Transient(msg)
    } else {
        FetchError::Fatal(msg)
    }
}

fn classify_transport(e: reqwest::Error) -> FetchError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        FetchError::Transient(e.to_string())
    } else {
        FetchError::Fatal(e.to_string())
    }
}

/// GETs `url` and returns the body of a successful response.
pub async fn fetch_bytes<C: HttpClient>(client: &C, url: &str) -> Result<Vec<u8>, FetchError> {
    let url = url
        .parse()
        .map_err(|e| FetchError::Fatal(format!("invalid url '{url}': {e}")))?;
    let req = reqwest::Request::new(reqwest::Method::GET, url);

    let resp = client.execute(req).await.map_err(classify_transport)?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(classify_status(status, &body));
    }

    let bytes = resp.bytes().await.map_err(classify_transport)?;
    debug!(bytes = bytes.len(), "Response body received");
    Ok(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_and_server_errors_are_transient() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_retryable());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, "").is_retryable());
    }

    #[test]
    fn test_auth_errors_are_fatal() {
        let e = classify_status(StatusCode::FORBIDDEN, "{\"error\":\"ApiKeyInvalidError\"}\n");
        assert!(!e.is_retryable());
        assert!(e.to_string().contains("ApiKeyInvalidError"));
        assert!(!classify_status(StatusCode::BAD_REQUEST, "").is_retryable());
    }
}
