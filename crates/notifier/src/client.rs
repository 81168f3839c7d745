//! HTTP transport for webhook delivery.
//!
//! One POST per attempt with a hard timeout. Transport failures are returned as
//! [`TransportError`]; any HTTP response, 2xx or not, is a [`DeliveryResponse`]
//! and the executor decides what it means.

use std::time::{Duration, Instant};

use reqwest::Url;
use thiserror::Error;

/// Response bodies are only kept for error text, so reading stops here.
pub const MAX_RESPONSE_BODY_BYTES: usize = 1024;

pub fn default_user_agent() -> String {
    format!("Hookline-Webhooks/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid endpoint URL: {0}")]
    InvalidUrl(String),

    #[error("request timed out after {0}ms")]
    Timeout(u128),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),
}

/// A fully prepared outbound request.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    pub status_code: u16,
    /// At most [`MAX_RESPONSE_BODY_BYTES`] of the body, lossily decoded.
    pub body: String,
    pub duration: Duration,
}

impl DeliveryResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Thin wrapper over a pooled `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl DeliveryClient {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| TransportError::Request(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn send(&self, request: OutboundRequest) -> Result<DeliveryResponse, TransportError> {
        let url = Url::parse(&request.url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }

        let started = Instant::now();
        let mut builder = self.client.post(url).body(request.body);
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }

        let mut response = builder.send().await.map_err(|e| self.classify(e))?;
        let status_code = response.status().as_u16();

        let mut body = Vec::new();
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let remaining = MAX_RESPONSE_BODY_BYTES - body.len();
                    body.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
                    if body.len() >= MAX_RESPONSE_BODY_BYTES {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // The status line already arrived; a broken body does not change the outcome
                    tracing::debug!(status = status_code, error = %e, "Failed to read response body");
                    break;
                }
            }
        }

        Ok(DeliveryResponse {
            status_code,
            body: String::from_utf8_lossy(&body).into_owned(),
            duration: started.elapsed(),
        })
    }

    fn classify(&self, error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout(self.timeout.as_millis())
        } else if error.is_connect() {
            TransportError::Connect(error.to_string())
        } else if error.is_builder() {
            TransportError::InvalidUrl(error.to_string())
        } else {
            TransportError::Request(error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{Mock, MockServer, ResponseTemplate, matchers};

    use super::*;

    fn client(timeout_ms: u64) -> DeliveryClient {
        DeliveryClient::new(Duration::from_millis(timeout_ms), &default_user_agent()).unwrap()
    }

    fn request(url: String) -> OutboundRequest {
        OutboundRequest {
            url,
            headers: vec![("Content-Type", "application/json".to_string())],
            body: br#"{"ok":true}"#.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_posts_body_and_headers() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/hook"))
            .and(matchers::header("content-type", "application/json"))
            .and(matchers::header("user-agent", default_user_agent().as_str()))
            .and(matchers::body_string(r#"{"ok":true}"#))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let response = client(2_000)
            .send(request(format!("{}/hook", server.uri())))
            .await
            .unwrap();
        assert_eq!(response.status_code, 204);
        assert!(response.is_success());
    }

    #[tokio::test]
    async fn test_non_2xx_is_a_response_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let response = client(2_000).send(request(server.uri())).await.unwrap();
        assert_eq!(response.status_code, 503);
        assert!(!response.is_success());
        assert_eq!(response.body, "maintenance");
    }

    #[tokio::test]
    async fn test_body_is_capped() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("e".repeat(10_000)))
            .mount(&server)
            .await;

        let response = client(2_000).send(request(server.uri())).await.unwrap();
        assert_eq!(response.body.len(), MAX_RESPONSE_BODY_BYTES);
    }

    #[tokio::test]
    async fn test_timeout() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let err = client(100).send(request(server.uri())).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(100)), "{err}");
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let err = client(100)
            .send(request("not a url".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidUrl(_)));

        let err = client(100)
            .send(request("ftp://files.example.com/hook".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // Bind then drop to get a port nothing listens on
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let err = client(2_000)
            .send(request(format!("http://127.0.0.1:{}/hook", port)))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)), "{err}");
    }
}
