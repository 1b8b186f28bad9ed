//! HTTP transport and request signing
//!
//! Every service call made by [`S3Client`](super::S3Client) goes through a
//! [`Transport`]. The default implementation is backed by `reqwest`; tests
//! and alternate HTTP stacks plug in their own.
//!
//! Authentication is delegated to a [`Signer`]. The crate ships only
//! [`AnonymousSigner`]: signature computation belongs to the caller's
//! credential stack.

use super::S3ClientError;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Url};
use std::sync::Arc;
use std::time::Duration;

/// A fully-addressed HTTP request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpRequest {
    /// Create a request with no headers and an empty body
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Replace the request body
    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    /// Insert a header, validating name and value
    pub fn insert_header(&mut self, name: &str, value: &str) -> Result<(), S3ClientError> {
        let name = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())
            .map_err(|e| S3ClientError::ConfigError(format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| S3ClientError::ConfigError(format!("invalid value for '{name}': {e}")))?;
        self.headers.insert(name, value);
        Ok(())
    }
}

/// Raw HTTP response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    /// Whether the status code is 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Get a header value as a string, if present and valid UTF-8
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// HTTP transport used by the S3 client
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request. Network failures map to [`S3ClientError::RequestError`];
    /// non-2xx statuses are returned as responses, not errors.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, S3ClientError>;
}

/// View of a request handed to a [`Signer`]
#[derive(Debug)]
pub struct SignableRequest<'a> {
    pub method: &'a Method,
    pub url: &'a Url,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
}

/// Produces authentication headers for a request
pub trait Signer: Send + Sync {
    /// Return `(name, value)` pairs to add to the request
    fn sign(&self, request: &SignableRequest<'_>) -> Result<Vec<(String, String)>, S3ClientError>;
}

/// Signer that adds nothing (public buckets, presigned endpoints, local emulators)
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousSigner;

impl Signer for AnonymousSigner {
    fn sign(&self, _request: &SignableRequest<'_>) -> Result<Vec<(String, String)>, S3ClientError> {
        Ok(Vec::new())
    }
}

/// `reqwest`-backed transport
pub struct ReqwestTransport {
    client: reqwest::Client,
    signer: Arc<dyn Signer>,
}

impl ReqwestTransport {
    /// Create a transport with the given per-request timeout
    pub fn new(timeout: Duration, signer: Arc<dyn Signer>) -> Result<Self, S3ClientError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| S3ClientError::ConfigError(e.to_string()))?;

        Ok(Self { client, signer })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, mut request: HttpRequest) -> Result<HttpResponse, S3ClientError> {
        let auth_headers = self.signer.sign(&SignableRequest {
            method: &request.method,
            url: &request.url,
            headers: &request.headers,
            body: &request.body,
        })?;

        for (name, value) in auth_headers {
            request
                .insert_header(&name, &value)
                .map_err(|e| S3ClientError::SigningError(e.to_string()))?;
        }

        let response = self
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| S3ClientError::RequestError(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| S3ClientError::RequestError(e.to_string()))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
