// Backend Client — the outbound verification call
//
// The mixer talks to the backend only through `BackendClient`. The HTTP
// implementation posts the original identifier as `{"idval": ...}` and reads
// `{"result": bool}` back.

use crate::{Verification, VerifyError};
use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Client, Method, Request, Uri};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Connect timeout for new backend connections
const CONNECT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Idle pooled connections are kept this long
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("Invalid backend response: {0}")]
    InvalidResponse(String),
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),
}

impl From<BackendError> for VerifyError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unavailable(msg) | BackendError::InvalidUrl(msg) => {
                VerifyError::BackendUnavailable(msg)
            }
            BackendError::InvalidResponse(msg) => VerifyError::BackendInvalidResponse(msg),
        }
    }
}

/// Performs one verification against the remote backend.
///
/// Implementations are shared by every dispatch task and must tolerate
/// concurrent calls. The mixer enforces the per-call deadline.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn verify(&self, original_value: &str) -> Result<Verification, BackendError>;
}

#[derive(Serialize)]
struct BackendRequest<'a> {
    idval: &'a str,
}

#[derive(Deserialize)]
struct BackendResponse {
    #[serde(default)]
    result: bool,
}

/// Decode a backend response body. A missing `result` reads as `false`.
pub fn parse_backend_response(body: &[u8]) -> Result<Verification, BackendError> {
    let response: BackendResponse = serde_json::from_slice(body)
        .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
    Ok(Verification::new(response.result))
}

/// Pooled HTTP client for a plain-HTTP backend
pub struct HttpBackendClient {
    client: Client<HttpConnector>,
    url: Uri,
}

impl HttpBackendClient {
    pub fn new(url: &str) -> Result<Self, BackendError> {
        let url: Uri = url
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| BackendError::InvalidUrl(e.to_string()))?;
        if url.scheme_str() != Some("http") || url.host().is_none() {
            return Err(BackendError::InvalidUrl(format!(
                "expected http://host[:port]/path, got {}",
                url
            )));
        }

        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_keepalive(Some(Duration::from_secs(60)));
        connector.set_connect_timeout(Some(CONNECT_TIMEOUT));

        let client = Client::builder()
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build(connector);

        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Uri {
        &self.url
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn verify(&self, original_value: &str) -> Result<Verification, BackendError> {
        let body = serde_json::to_vec(&BackendRequest {
            idval: original_value,
        })
        .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let request = Request::builder()
            .method(Method::POST)
            .uri(self.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let status = response.status();
        let body_bytes = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        if !status.is_success() {
            return Err(BackendError::Unavailable(format!(
                "backend returned status {}",
                status
            )));
        }

        parse_backend_response(&body_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate;

    #[test]
    fn test_parse_result_true() {
        let parsed = parse_backend_response(br#"{"result": true, "verified": true}"#).unwrap();
        assert!(parsed.result);
    }

    #[test]
    fn test_parse_missing_result_is_false() {
        let parsed = parse_backend_response(br#"{"timestamp": 1700000000}"#).unwrap();
        assert!(!parsed.result);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_backend_response(b"<html>oops</html>"),
            Err(BackendError::InvalidResponse(_))
        ));
        assert!(matches!(
            parse_backend_response(br#"{"result": "yes"}"#),
            Err(BackendError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            VerifyError::from(BackendError::Unavailable("x".into())),
            VerifyError::BackendUnavailable(_)
        ));
        assert!(matches!(
            VerifyError::from(BackendError::InvalidResponse("x".into())),
            VerifyError::BackendInvalidResponse(_)
        ));
    }

    #[test]
    fn test_http_client_rejects_bad_urls() {
        assert!(HttpBackendClient::new("not a url").is_err());
        assert!(HttpBackendClient::new("https://backend.internal/verify").is_err());
        assert!(HttpBackendClient::new("/verify").is_err());
    }

    #[tokio::test]
    async fn test_http_client_accepts_plain_http() {
        let client = HttpBackendClient::new("http://localhost:9090/verify").unwrap();
        assert_eq!(client.url().path(), "/verify");
    }

    #[tokio::test]
    async fn test_mock_backend_receives_original_value() {
        let mut backend = MockBackendClient::new();
        backend
            .expect_verify()
            .with(predicate::function(|value: &str| value == "user123"))
            .times(1)
            .returning(|_| Ok(Verification::new(true)));

        let outcome = backend.verify("user123").await;
        assert_eq!(outcome, Ok(Verification::new(true)));
    }
}
