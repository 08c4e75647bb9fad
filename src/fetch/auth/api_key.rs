use crate::fetch::client::HttpClient;
use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue, InvalidHeaderName, InvalidHeaderValue};

/// An [`HttpClient`] wrapper that sends an API key in a request header.
///
/// The header is validated once at construction and marked sensitive so it
/// never shows up in debug output.
pub struct ApiKey<C> {
    inner: C,
    header_name: HeaderName,
    key: HeaderValue,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiKeyError {
    #[error("invalid header name: {0}")]
    Name(#[from] InvalidHeaderName),
    #[error("API key is not a valid header value: {0}")]
    Value(#[from] InvalidHeaderValue),
}

impl<C> ApiKey<C> {
    pub fn new(inner: C, header_name: &str, key: &str) -> Result<Self, ApiKeyError> {
        let header_name = HeaderName::from_bytes(header_name.as_bytes())?;
        let mut key = HeaderValue::from_str(key)?;
        key.set_sensitive(true);
        Ok(Self {
            inner,
            header_name,
            key,
        })
    }

    /// PurpleAir read keys travel in `X-API-Key`.
    pub fn purpleair(inner: C, key: &str) -> Result<Self, ApiKeyError> {
        Self::new(inner, "X-API-Key", key)
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for ApiKey<C> {
    async fn execute(&self, mut req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        req.headers_mut()
            .insert(self.header_name.clone(), self.key.clone());
        self.inner.execute(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;

    #[test]
    fn test_rejects_bad_header_value() {
        assert!(ApiKey::purpleair(Nothing, "line\nbreak").is_err());
        assert!(ApiKey::new(Nothing, "bad header", "k").is_err());
    }

    #[test]
    fn test_key_is_sensitive() {
        let client = ApiKey::purpleair(Nothing, "ABCD-1234").unwrap();
        assert!(client.key.is_sensitive());
        assert_eq!(client.header_name.as_str(), "x-api-key");
    }
}
