//! HTTP transport seam.
//!
//! The dispatcher, token manager, and session registry all talk to the
//! backend through [`HttpTransport`], so tests (and alternative stacks)
//! can inject their own implementation. [`ReqwestTransport`] is the
//! production one.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    /// Reads are cacheable and carry parameters in the query string;
    /// everything else is a mutation with a JSON body.
    pub fn is_read(&self) -> bool {
        matches!(self, Method::Get)
    }

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

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    /// Absolute URL, query string included.
    pub url: String,
    pub bearer: Option<String>,
    /// JSON body; only sent for mutating methods.
    pub body: Option<Value>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_str(&self.body)
            .map_err(|err| ApiError::InvalidResponse(format!("failed to parse body: {err}")))
    }
}

/// Executes one HTTP exchange. Implementations return `Err` only for
/// network-class failures; HTTP-level errors come back as responses with
/// their status so the dispatcher can classify them.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ApiError>;
}

/// Canonical query string for a parameter object. Keys are sorted so
/// logically-equal parameter sets produce the same digest (and the same
/// cache key). Non-object parameters serialize under a single `q` key.
pub(crate) fn canonical_query(params: &Value) -> String {
    match params {
        Value::Null => String::new(),
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            keys.iter()
                .map(|key| {
                    let value = &map[key.as_str()];
                    match value {
                        Value::String(s) => format!("{key}={s}"),
                        other => format!("{key}={other}"),
                    }
                })
                .collect::<Vec<_>>()
                .join("&")
        }
        other => format!("q={other}"),
    }
}

/// Production transport. Clone is cheap - reqwest::Client uses Arc
/// internally for connection pooling.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(default_timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(default_timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
            Method::Put => self.client.put(&request.url),
            Method::Patch => self.client.patch(&request.url),
            Method::Delete => self.client.delete(&request.url),
        };
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            if !request.method.is_read() {
                builder = builder.json(body);
            }
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(HttpResponse { status, body })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_query_sorts_keys() {
        let a = canonical_query(&json!({"b": 2, "a": "one"}));
        let b = canonical_query(&json!({"a": "one", "b": 2}));
        assert_eq!(a, "a=one&b=2");
        assert_eq!(a, b);
    }

    #[test]
    fn test_canonical_query_empty_and_scalar() {
        assert_eq!(canonical_query(&Value::Null), "");
        assert_eq!(canonical_query(&json!({})), "");
        assert_eq!(canonical_query(&json!(["x", 1])), r#"q=["x",1]"#);
    }

    #[test]
    fn test_method_classification() {
        assert!(Method::Get.is_read());
        assert!(!Method::Post.is_read());
        assert!(!Method::Delete.is_read());
        assert_eq!(Method::Patch.as_str(), "PATCH");
    }
}
