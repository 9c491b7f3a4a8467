//! Upstream certificate API client
//!
//! The coordinator talks to the upstream through [`CertificateSource`] so the
//! HTTP client can be swapped for an in-memory source in tests.
//!
//! # Security
//!
//! The shared secret is sent as a query parameter and is NEVER logged or
//! included in error messages.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::config::UpstreamConfig;
use crate::error::FetchError;
use crate::{Error, Result};

/// Something that can produce a certificate record for a control number
#[async_trait]
pub trait CertificateSource: Send + Sync + 'static {
    /// Fetch the record for `control_number`
    ///
    /// Implementations return [`FetchError::CertificateNotFound`] for an
    /// empty payload rather than an empty record.
    async fn fetch(&self, control_number: &str) -> std::result::Result<Value, FetchError>;
}

/// Reject payloads that carry no certificate data
///
/// # Errors
///
/// Returns [`FetchError::CertificateNotFound`] for `null`, empty objects,
/// empty arrays, empty strings and any non-object value.
pub fn ensure_record(
    control_number: &str,
    payload: Value,
) -> std::result::Result<Value, FetchError> {
    match payload {
        Value::Object(ref map) if !map.is_empty() => Ok(payload),
        _ => Err(FetchError::CertificateNotFound(control_number.to_string())),
    }
}

/// HTTP client for the upstream certificate API
pub struct HttpUpstream {
    client: Client,
    url: String,
    secret: String,
    timeout: Duration,
}

impl HttpUpstream {
    /// Create a client from configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("cert-proxy/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            secret: config.secret.clone(),
            timeout: config.timeout,
        })
    }

    /// Map a transport error without leaking the request URL (it carries the secret)
    fn map_error(&self, error: &reqwest::Error) -> FetchError {
        if error.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else if let Some(status) = error.status() {
            FetchError::Upstream(format!("status {status}"))
        } else if error.is_decode() {
            FetchError::Upstream("invalid JSON body".to_string())
        } else if error.is_connect() {
            FetchError::Upstream("connection failed".to_string())
        } else {
            FetchError::Upstream("request failed".to_string())
        }
    }
}

#[async_trait]
impl CertificateSource for HttpUpstream {
    async fn fetch(&self, control_number: &str) -> std::result::Result<Value, FetchError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("controlNumber", control_number), ("secret", self.secret.as_str())])
            .send()
            .await
            .map_err(|e| self.map_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            debug!(control_number, %status, "Upstream returned non-success status");
            return Err(FetchError::Upstream(format!("status {status}")));
        }

        let bytes = response.bytes().await.map_err(|e| self.map_error(&e))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(FetchError::CertificateNotFound(control_number.to_string()));
        }

        let payload: Value = serde_json::from_slice(&bytes)
            .map_err(|e| FetchError::Upstream(format!("invalid JSON body: {e}")))?;

        ensure_record(control_number, payload)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ensure_record_accepts_object() {
        let record = json!({"name": "Jane Doe", "id": "ABC123"});
        assert_eq!(ensure_record("ABC123", record.clone()), Ok(record));
    }

    #[test]
    fn test_ensure_record_rejects_empty_payloads() {
        for payload in [json!({}), json!(null), json!([]), json!(""), json!([1, 2])] {
            assert_eq!(
                ensure_record("ABC123", payload),
                Err(FetchError::CertificateNotFound("ABC123".to_string()))
            );
        }
    }

    #[test]
    fn test_http_upstream_builds_from_config() {
        let config = UpstreamConfig {
            url: "http://127.0.0.1:9/exec".to_string(),
            secret: "s3cret".to_string(),
            timeout: Duration::from_millis(250),
        };
        let upstream = HttpUpstream::new(&config).unwrap();
        assert_eq!(upstream.timeout, Duration::from_millis(250));
        assert_eq!(upstream.url, config.url);
    }

    #[tokio::test]
    async fn test_connection_failure_is_upstream_error() {
        // Bind then drop a listener to obtain a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let upstream = HttpUpstream::new(&UpstreamConfig {
            url: format!("http://{addr}/exec"),
            secret: "s3cret".to_string(),
            timeout: Duration::from_secs(2),
        })
        .unwrap();

        let err = upstream.fetch("ABC123").await.unwrap_err();
        assert!(matches!(err, FetchError::Upstream(_)));
        assert!(!err.to_string().contains("s3cret"));
    }
}
