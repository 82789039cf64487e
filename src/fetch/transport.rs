//! HTTP transport behind the resilient fetch layer.
//!
//! The fetch layer is written against this trait so tests can script
//! responses; production code uses [`ReqwestTransport`].

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// One outgoing request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: vec![("Accept".to_string(), "application/json".to_string())],
            body: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: vec![
                ("Accept".to_string(), "application/json".to_string()),
                ("Content-Type".to_string(), "application/json".to_string()),
            ],
            body: Some(body.into()),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// Raw response as seen by the fetch layer. Status is kept as a plain u16 so
/// scripted test responses need no reqwest types.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        let lower = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_ascii_lowercase() == lower)
            .map(|(_, v)| v.as_str())
    }

    /// Parse the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).map_err(|e| anyhow!("failed to parse JSON: {}", e))
    }

    /// Map a terminal response to the error taxonomy. 2xx/3xx pass through.
    pub fn into_result(self) -> Result<FetchResponse, crate::error::IngestError> {
        match self.status {
            200..=399 => Ok(self),
            429 => Err(crate::error::IngestError::RateLimited { attempts: 0 }),
            400..=499 => Err(crate::error::IngestError::ClientRejected {
                status: self.status,
                body: truncate(&self.body, 200),
            }),
            _ => Err(crate::error::IngestError::UpstreamUnavailable {
                status: self.status,
                body: truncate(&self.body, 200),
            }),
        }
    }
}

fn truncate(body: &str, max: usize) -> String {
    if body.len() > max {
        let mut end = max;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body[..end].to_string()
    } else {
        body.to_string()
    }
}

/// Pluggable request executor.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Perform the request once. Network-level failures (DNS, connect,
    /// timeout) come back as `Err`; any HTTP status is `Ok`.
    async fn send(&self, request: &FetchRequest) -> Result<FetchResponse>;
}

/// Production transport backed by a shared reqwest client.
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &FetchRequest) -> Result<FetchResponse> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| anyhow!("Request failed for {}: {}", request.url, e))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.text().await.unwrap_or_default();

        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let mut headers = HashMap::new();
        headers.insert("Retry-After".to_string(), "30".to_string());
        let response = FetchResponse {
            status: 429,
            headers,
            body: String::new(),
        };
        assert_eq!(response.header("retry-after"), Some("30"));
        assert_eq!(response.header("RETRY-AFTER"), Some("30"));
        assert_eq!(response.header("X-Missing"), None);
    }

    #[test]
    fn test_into_result_maps_statuses() {
        let make = |status| FetchResponse {
            status,
            headers: HashMap::new(),
            body: "details".to_string(),
        };

        assert!(make(200).into_result().is_ok());
        assert!(make(301).into_result().is_ok());
        assert!(matches!(
            make(429).into_result(),
            Err(crate::error::IngestError::RateLimited { .. })
        ));
        assert!(matches!(
            make(404).into_result(),
            Err(crate::error::IngestError::ClientRejected { status: 404, .. })
        ));
        assert!(matches!(
            make(503).into_result(),
            Err(crate::error::IngestError::UpstreamUnavailable { status: 503, .. })
        ));
    }
}
