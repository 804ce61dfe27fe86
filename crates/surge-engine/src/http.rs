//! HTTP transport used by virtual users.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use surge_core::HttpMethod;
use thiserror::Error;

/// A fully rendered request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// The request never produced a response (connect error, timeout, reset).
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Sends requests to the system under test.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends `request` and reads the whole response body.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// [`HttpClient`] backed by a pooled `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// # Errors
    ///
    /// Fails if the TLS backend cannot be initialised.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("surge/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

fn to_reqwest(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Head => reqwest::Method::HEAD,
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self
            .client
            .request(to_reqwest(request.method), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError(e.to_string()))?;

        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}

/// Joins a rendered step path onto the base URL. Absolute `http(s)` URLs
/// are used unchanged.
#[must_use]
pub fn resolve_url(base_url: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    if path.is_empty() {
        return base_url.to_string();
    }
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_resolve_url() {
        let base = "http://localhost:8080/api/v1";
        assert_eq!(resolve_url(base, "/hotels"), "http://localhost:8080/api/v1/hotels");
        assert_eq!(resolve_url(base, "hotels"), "http://localhost:8080/api/v1/hotels");
        assert_eq!(
            resolve_url("http://localhost:8080/api/v1/", "/hotels"),
            "http://localhost:8080/api/v1/hotels"
        );
        assert_eq!(
            resolve_url(base, "http://localhost:8080/health"),
            "http://localhost:8080/health"
        );
        assert_eq!(resolve_url(base, ""), base);
    }

    #[tokio::test]
    async fn test_reqwest_client_sends_headers_and_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .and(header("authorization", "Bearer abc"))
            .and(body_json(serde_json::json!({ "email": "a@b.c" })))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let client = ReqwestClient::new(Duration::from_secs(5)).unwrap();
        let response = client
            .send(HttpRequest {
                method: HttpMethod::Post,
                url: format!("{}/auth/login", server.uri()),
                headers: vec![("authorization".to_string(), "Bearer abc".to_string())],
                body: Some(serde_json::json!({ "email": "a@b.c" })),
            })
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"ok");
    }

    #[tokio::test]
    async fn test_reqwest_client_transport_error() {
        let client = ReqwestClient::new(Duration::from_millis(500)).unwrap();
        let result = client
            .send(HttpRequest {
                method: HttpMethod::Get,
                // Port 9 (discard) is essentially never listening locally.
                url: "http://127.0.0.1:9/hotels".to_string(),
                headers: Vec::new(),
                body: None,
            })
            .await;
        assert!(result.is_err());
    }
}
