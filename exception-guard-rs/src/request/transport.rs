//! HTTP transport seam of the request engine.
//!
//! The engine only sees [`Transport`]; [`ReqwestTransport`] is the production
//! implementation and tests substitute scripted transports.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{names, Exception};

/// HTTP method of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// One request handed to a transport
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    /// JSON body, if any
    pub body: Option<serde_json::Value>,
    /// Per-request deadline; the engine enforces it as well
    pub timeout: Duration,
}

/// A response with a decoded JSON body
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// `Null` for an empty body. Non-JSON error bodies are kept as a string.
    pub body: serde_json::Value,
}

impl TransportResponse {
    pub fn new(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body,
        }
    }

    pub fn with_header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// True for any 2xx status
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// True for 409 Conflict
    pub fn is_conflict(&self) -> bool {
        self.status == 409
    }
}

/// Why a transport call produced no response
#[derive(Debug, Clone, PartialEq)]
pub enum TransportFailure {
    /// The call may succeed if repeated
    Retryable(Exception),
    /// The request cannot be built; repeating it is pointless
    Terminal(Exception),
}

impl TransportFailure {
    pub fn exception(&self) -> &Exception {
        match self {
            TransportFailure::Retryable(exception) | TransportFailure::Terminal(exception) => exception,
        }
    }

    pub fn into_exception(self) -> Exception {
        match self {
            TransportFailure::Retryable(exception) | TransportFailure::Terminal(exception) => exception,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportFailure::Terminal(_))
    }
}

/// Sends one HTTP request
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> std::result::Result<TransportResponse, TransportFailure>;
}

/// [`Transport`] backed by a pooled `reqwest` client
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Builds a transport with a fresh client
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("exception-guard/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// Uses an existing client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> std::result::Result<TransportResponse, TransportFailure> {
        let url = reqwest::Url::parse(&request.url).map_err(|e| {
            TransportFailure::Terminal(Exception::new(
                names::TYPE_ERROR,
                format!("invalid URL '{}': {}", request.url, e),
            ))
        })?;

        let mut builder = self
            .client
            .request(request.method.into(), url)
            .timeout(request.timeout);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportFailure::Retryable(Exception::from(e)))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();

        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportFailure::Retryable(Exception::from(e)))?;

        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            match serde_json::from_slice(&bytes) {
                Ok(body) => body,
                Err(e) if (200..300).contains(&status) => {
                    return Err(TransportFailure::Retryable(Exception::from(e)));
                }
                Err(_) => serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned()),
            }
        };

        Ok(TransportResponse { status, headers, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::classify;
    use crate::types::ExceptionKind;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(url: String) -> TransportRequest {
        TransportRequest {
            method: Method::Get,
            url,
            headers: BTreeMap::new(),
            body: None,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_reqwest_transport_decodes_json() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/items"))
            .and(header("x-client", "guard"))
            .and(body_json(json!({"name": "lamp"})))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(json!({"id": 7, "name": "lamp"}))
                    .insert_header("x-request-id", "abc"),
            )
            .mount(&mock_server)
            .await;

        let transport = ReqwestTransport::new().unwrap();
        let mut req = request(format!("{}/items", mock_server.uri()));
        req.method = Method::Post;
        req.headers.insert("x-client".to_string(), "guard".to_string());
        req.body = Some(json!({"name": "lamp"}));

        let response = transport.send(req).await.unwrap();
        assert_eq!(response.status, 201);
        assert!(response.is_success());
        assert_eq!(response.body["id"], 7);
        assert_eq!(response.headers.get("x-request-id").map(String::as_str), Some("abc"));
    }

    #[tokio::test]
    async fn test_reqwest_transport_keeps_error_bodies() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&mock_server)
            .await;

        let transport = ReqwestTransport::new().unwrap();
        let response = transport.send(request(mock_server.uri())).await.unwrap();

        assert_eq!(response.status, 503);
        assert_eq!(response.body, json!("maintenance"));
    }

    #[tokio::test]
    async fn test_reqwest_transport_rejects_invalid_url() {
        let transport = ReqwestTransport::new().unwrap();
        let failure = transport.send(request("not a url".to_string())).await.unwrap_err();
        assert!(failure.is_terminal());
    }

    #[tokio::test]
    async fn test_reqwest_transport_timeout_is_network_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&mock_server)
            .await;

        let transport = ReqwestTransport::new().unwrap();
        let mut req = request(mock_server.uri());
        req.timeout = Duration::from_millis(50);

        let failure = transport.send(req).await.unwrap_err();
        assert!(!failure.is_terminal());
        assert_eq!(classify(failure.exception()), ExceptionKind::NetworkError);
    }
}
