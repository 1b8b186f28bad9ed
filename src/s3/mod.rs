//! S3 Client module
//!
//! Maps each object-storage operation used by the upload engine to exactly
//! one HTTP exchange against an S3-compatible service.
//!
//! # Tracing
//!
//! All operations are instrumented with spans:
//!
//! | Operation | Span Name | Attributes |
//! |-----------|-----------|------------|
//! | PutObject | `s3.put_object` | bucket, key, bytes, etag, status_code |
//! | CreateMultipartUpload | `s3.create_multipart_upload` | bucket, key, upload_id, status_code |
//! | UploadPart | `s3.upload_part` | bucket, upload_id, part_number, bytes, etag, status_code |
//! | CompleteMultipartUpload | `s3.complete_multipart_upload` | bucket, upload_id, parts_count, etag, status_code |
//! | AbortMultipartUpload | `s3.abort_multipart_upload` | bucket, upload_id, status_code |
//! | ListParts | `s3.list_parts` | bucket, upload_id, part_number_marker, parts_count |
//!
//! # Example
//!
//! ```no_run
//! use kumo_uploadr::s3::{MultipartApi, ObjectOptions, S3Client, S3ClientConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = S3Client::new(S3ClientConfig {
//!     endpoint: Some("http://localhost:9000".into()),
//!     ..Default::default()
//! })?;
//!
//! let created = client
//!     .create_multipart_upload("my-bucket", "big.bin", &ObjectOptions::default())
//!     .await?;
//! println!("upload id: {}", created.upload_id);
//! # Ok(())
//! # }
//! ```

pub mod transport;
mod xml;

use crate::config::{AddressingStyle, ServiceConfig};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{Method, Url};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use transport::{
    AnonymousSigner, HttpRequest, HttpResponse, ReqwestTransport, SignableRequest, Signer,
    Transport,
};

/// Characters escaped in object keys. `/` stays literal so keys keep their hierarchy.
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Default per-request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// S3 client errors
#[derive(Error, Debug)]
pub enum S3ClientError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Request error: {0}")]
    RequestError(String),

    #[error("Response error: {0}")]
    ResponseError(String),

    #[error("Signing error: {0}")]
    SigningError(String),

    #[error("Service error {status} {code}: {message}")]
    ServiceError {
        status: u16,
        code: String,
        message: String,
        request_id: Option<String>,
    },
}

impl S3ClientError {
    /// Whether repeating the same request may succeed.
    ///
    /// Network failures, 5xx, 408 and 429 are transient; every other service
    /// response is a final answer.
    pub fn is_retryable(&self) -> bool {
        match self {
            S3ClientError::RequestError(_) => true,
            S3ClientError::ServiceError { status, code, .. } => {
                *status >= 500
                    || *status == 408
                    || *status == 429
                    || matches!(code.as_str(), "RequestTimeout" | "SlowDown" | "InternalError")
            }
            S3ClientError::ConfigError(_)
            | S3ClientError::ResponseError(_)
            | S3ClientError::SigningError(_) => false,
        }
    }
}

/// S3 Client configuration
#[derive(Debug, Clone)]
pub struct S3ClientConfig {
    pub region: String,
    pub endpoint: Option<String>,
    pub addressing_style: AddressingStyle,
    /// Prefix of vendor headers, e.g. `x-amz` or `x-cos`
    pub header_prefix: String,
    pub timeout: Option<Duration>,
}

impl Default for S3ClientConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".into(),
            endpoint: None,
            addressing_style: AddressingStyle::Path,
            header_prefix: "x-amz".into(),
            timeout: None,
        }
    }
}

impl From<&ServiceConfig> for S3ClientConfig {
    fn from(service: &ServiceConfig) -> Self {
        Self {
            region: service.region.clone(),
            endpoint: service.endpoint.clone(),
            addressing_style: service.addressing_style,
            header_prefix: service.header_prefix.clone(),
            timeout: Some(Duration::from_secs(service.timeout_seconds)),
        }
    }
}

/// Whole-object options. Sent with PutObject or CreateMultipartUpload only;
/// they cannot be set per part.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ObjectOptions {
    pub storage_class: Option<String>,
    pub server_side_encryption: Option<String>,
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub cache_control: Option<String>,
    /// User metadata, sent as `<prefix>-meta-<name>`
    pub metadata: BTreeMap<String, String>,
}

/// Operations the upload engine needs from the storage service
#[async_trait]
pub trait MultipartApi: Send + Sync {
    /// Single-request upload
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        options: &ObjectOptions,
        content_md5: Option<&str>,
    ) -> Result<S3PutObjectResponse, S3ClientError>;

    /// Start a multipart upload and obtain its upload id
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        options: &ObjectOptions,
    ) -> Result<S3CreateMultipartUploadResponse, S3ClientError>;

    /// Upload one part. Re-uploading a part number replaces it.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
        content_md5: Option<&str>,
    ) -> Result<S3UploadPartResponse, S3ClientError>;

    /// Assemble the object from `parts`, which must be in ascending part order
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[S3CompletedPart],
    ) -> Result<S3CompleteMultipartUploadResponse, S3ClientError>;

    /// Discard an upload and every part stored for it
    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), S3ClientError>;

    /// One page of the parts already stored for an upload
    async fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number_marker: Option<u32>,
        max_parts: Option<u32>,
    ) -> Result<S3ListPartsResponse, S3ClientError>;
}

/// S3 Client
pub struct S3Client {
    config: S3ClientConfig,
    transport: Arc<dyn Transport>,
}

impl S3Client {
    /// Create a new S3 client with anonymous requests
    pub fn new(config: S3ClientConfig) -> Result<Self, S3ClientError> {
        Self::with_signer(config, Arc::new(AnonymousSigner))
    }

    /// Create a client whose requests are signed by `signer`
    pub fn with_signer(
        config: S3ClientConfig,
        signer: Arc<dyn Signer>,
    ) -> Result<Self, S3ClientError> {
        let timeout = config.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let transport = ReqwestTransport::new(timeout, signer)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Create a client over an existing transport
    pub fn with_transport(config: S3ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self { config, transport }
    }

    /// Get the region
    pub fn region(&self) -> &str {
        &self.config.region
    }

    /// Get the endpoint URL
    pub fn endpoint(&self) -> String {
        self.config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", self.config.region))
    }

    /// URL of an object, honouring the configured addressing style
    pub fn object_url(&self, bucket: &str, key: &str) -> Result<Url, S3ClientError> {
        let endpoint = self.endpoint();
        let mut url = Url::parse(&endpoint)
            .map_err(|e| S3ClientError::ConfigError(format!("invalid endpoint '{endpoint}': {e}")))?;
        let encoded_key = utf8_percent_encode(key, KEY_ENCODE_SET).to_string();

        match self.config.addressing_style {
            AddressingStyle::Path => {
                let base = url.path().trim_end_matches('/').to_string();
                url.set_path(&format!("{base}/{bucket}/{encoded_key}"));
            }
            AddressingStyle::VirtualHosted => {
                let host = url
                    .host_str()
                    .ok_or_else(|| {
                        S3ClientError::ConfigError(format!("endpoint '{endpoint}' has no host"))
                    })?
                    .to_string();
                url.set_host(Some(&format!("{bucket}.{host}")))
                    .map_err(|e| S3ClientError::ConfigError(e.to_string()))?;
                url.set_path(&format!("/{encoded_key}"));
            }
        }

        Ok(url)
    }

    fn vendor_header(&self, suffix: &str) -> String {
        format!("{}-{}", self.config.header_prefix, suffix)
    }

    fn echoed_encryption(&self, response: &HttpResponse) -> Option<String> {
        response
            .header(&self.vendor_header("server-side-encryption"))
            .map(str::to_string)
    }

    fn apply_object_options(
        &self,
        request: &mut HttpRequest,
        options: &ObjectOptions,
    ) -> Result<(), S3ClientError> {
        if let Some(storage_class) = &options.storage_class {
            request.insert_header(&self.vendor_header("storage-class"), storage_class)?;
        }
        if let Some(sse) = &options.server_side_encryption {
            request.insert_header(&self.vendor_header("server-side-encryption"), sse)?;
        }
        if let Some(value) = &options.content_type {
            request.insert_header("content-type", value)?;
        }
        if let Some(value) = &options.content_disposition {
            request.insert_header("content-disposition", value)?;
        }
        if let Some(value) = &options.content_encoding {
            request.insert_header("content-encoding", value)?;
        }
        if let Some(value) = &options.cache_control {
            request.insert_header("cache-control", value)?;
        }
        for (name, value) in &options.metadata {
            request.insert_header(&self.vendor_header(&format!("meta-{name}")), value)?;
        }
        Ok(())
    }

    /// Send a request and turn non-2xx responses into [`S3ClientError::ServiceError`]
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, S3ClientError> {
        let response = self.transport.send(request).await?;
        tracing::Span::current().record("http.status_code", response.status);

        if !response.is_success() {
            return Err(self.service_error(&response));
        }
        Ok(response)
    }

    fn service_error(&self, response: &HttpResponse) -> S3ClientError {
        let body: xml::ErrorBody = if response.body.is_empty() {
            xml::ErrorBody::default()
        } else {
            xml::from_xml(&response.body).unwrap_or_default()
        };

        S3ClientError::ServiceError {
            status: response.status,
            code: body
                .code
                .unwrap_or_else(|| format!("HttpStatus{}", response.status)),
            message: body.message.unwrap_or_default(),
            request_id: body.request_id.or_else(|| {
                response
                    .header(&self.vendor_header("request-id"))
                    .map(str::to_string)
            }),
        }
    }

    fn required_etag(response: &HttpResponse) -> Result<String, S3ClientError> {
        response
            .header("etag")
            .map(str::to_string)
            .ok_or_else(|| S3ClientError::ResponseError("response has no ETag header".into()))
    }
}

#[async_trait]
impl MultipartApi for S3Client {
    #[tracing::instrument(
        name = "s3.put_object",
        skip(self, body, options, content_md5),
        fields(
            s3.bucket = %bucket,
            s3.key = %key,
            http.method = "PUT",
            upload.bytes = body.len(),
            s3.etag = tracing::field::Empty,
            http.status_code = tracing::field::Empty
        ),
        err
    )]
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        options: &ObjectOptions,
        content_md5: Option<&str>,
    ) -> Result<S3PutObjectResponse, S3ClientError> {
        let bytes = body.len();
        let mut request = HttpRequest::new(Method::PUT, self.object_url(bucket, key)?).with_body(body);
        self.apply_object_options(&mut request, options)?;
        if let Some(md5) = content_md5 {
            request.insert_header("content-md5", md5)?;
        }

        let response = self.execute(request).await?;
        let etag = Self::required_etag(&response)?;
        tracing::Span::current().record("s3.etag", etag.as_str());

        tracing::debug!(etag = %etag, bytes = bytes, "PutObject completed");

        Ok(S3PutObjectResponse {
            etag,
            server_side_encryption: self.echoed_encryption(&response),
        })
    }

    #[tracing::instrument(
        name = "s3.create_multipart_upload",
        skip(self, options),
        fields(
            s3.bucket = %bucket,
            s3.key = %key,
            http.method = "POST",
            s3.upload_id = tracing::field::Empty,
            http.status_code = tracing::field::Empty
        ),
        err
    )]
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        options: &ObjectOptions,
    ) -> Result<S3CreateMultipartUploadResponse, S3ClientError> {
        let mut url = self.object_url(bucket, key)?;
        url.set_query(Some("uploads"));
        let mut request = HttpRequest::new(Method::POST, url);
        self.apply_object_options(&mut request, options)?;

        let response = self.execute(request).await?;
        let parsed: xml::InitiateMultipartUploadResult = xml::from_xml(&response.body)?;
        let upload_id = parsed
            .upload_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| S3ClientError::ResponseError("response has no UploadId".into()))?;

        tracing::Span::current().record("s3.upload_id", upload_id.as_str());
        tracing::debug!(upload_id = %upload_id, "CreateMultipartUpload completed");

        Ok(S3CreateMultipartUploadResponse {
            upload_id,
            server_side_encryption: self.echoed_encryption(&response),
        })
    }

    #[tracing::instrument(
        name = "s3.upload_part",
        skip(self, body, content_md5),
        fields(
            s3.bucket = %bucket,
            s3.upload_id = %upload_id,
            s3.part_number = part_number,
            http.method = "PUT",
            upload.bytes = body.len(),
            s3.etag = tracing::field::Empty,
            http.status_code = tracing::field::Empty
        ),
        err
    )]
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
        content_md5: Option<&str>,
    ) -> Result<S3UploadPartResponse, S3ClientError> {
        let mut url = self.object_url(bucket, key)?;
        url.query_pairs_mut()
            .append_pair("partNumber", &part_number.to_string())
            .append_pair("uploadId", upload_id);
        let mut request = HttpRequest::new(Method::PUT, url).with_body(body);
        if let Some(md5) = content_md5 {
            request.insert_header("content-md5", md5)?;
        }

        let response = self.execute(request).await?;
        let etag = Self::required_etag(&response)?;
        tracing::Span::current().record("s3.etag", etag.as_str());

        Ok(S3UploadPartResponse {
            etag,
            server_side_encryption: self.echoed_encryption(&response),
        })
    }

    #[tracing::instrument(
        name = "s3.complete_multipart_upload",
        skip(self, parts),
        fields(
            s3.bucket = %bucket,
            s3.upload_id = %upload_id,
            http.method = "POST",
            parts_count = parts.len(),
            s3.etag = tracing::field::Empty,
            http.status_code = tracing::field::Empty
        ),
        err
    )]
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[S3CompletedPart],
    ) -> Result<S3CompleteMultipartUploadResponse, S3ClientError> {
        let body = xml::to_xml(&xml::CompleteMultipartUpload {
            parts: parts
                .iter()
                .map(|p| xml::CompletePart {
                    part_number: p.part_number,
                    etag: &p.etag,
                })
                .collect(),
        })?;

        let mut url = self.object_url(bucket, key)?;
        url.query_pairs_mut().append_pair("uploadId", upload_id);
        let mut request = HttpRequest::new(Method::POST, url).with_body(Bytes::from(body));
        request.insert_header("content-type", "application/xml")?;

        let response = self.execute(request).await?;

        // Completion can fail after the 200 status line has been sent
        if xml::root_element(&response.body).as_deref() == Some("Error") {
            let mut failed = response.clone();
            failed.status = 500;
            return Err(self.service_error(&failed));
        }

        let parsed: xml::CompleteMultipartUploadResult = xml::from_xml(&response.body)?;
        let etag = parsed
            .etag
            .ok_or_else(|| S3ClientError::ResponseError("response has no ETag".into()))?;
        tracing::Span::current().record("s3.etag", etag.as_str());

        tracing::debug!(etag = %etag, parts = parts.len(), "CompleteMultipartUpload completed");

        Ok(S3CompleteMultipartUploadResponse {
            etag,
            location: parsed.location,
            server_side_encryption: self.echoed_encryption(&response),
        })
    }

    #[tracing::instrument(
        name = "s3.abort_multipart_upload",
        skip(self),
        fields(
            s3.bucket = %bucket,
            s3.upload_id = %upload_id,
            http.method = "DELETE",
            http.status_code = tracing::field::Empty
        ),
        err
    )]
    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), S3ClientError> {
        let mut url = self.object_url(bucket, key)?;
        url.query_pairs_mut().append_pair("uploadId", upload_id);

        self.execute(HttpRequest::new(Method::DELETE, url)).await?;
        Ok(())
    }

    #[tracing::instrument(
        name = "s3.list_parts",
        skip(self),
        fields(
            s3.bucket = %bucket,
            s3.upload_id = %upload_id,
            http.method = "GET",
            parts_count = tracing::field::Empty,
            http.status_code = tracing::field::Empty
        ),
        err
    )]
    async fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number_marker: Option<u32>,
        max_parts: Option<u32>,
    ) -> Result<S3ListPartsResponse, S3ClientError> {
        let mut url = self.object_url(bucket, key)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("uploadId", upload_id);
            if let Some(marker) = part_number_marker {
                query.append_pair("part-number-marker", &marker.to_string());
            }
            if let Some(max) = max_parts {
                query.append_pair("max-parts", &max.to_string());
            }
        }

        let response = self.execute(HttpRequest::new(Method::GET, url)).await?;
        let parsed: xml::ListPartsResult = xml::from_xml(&response.body)?;
        tracing::Span::current().record("parts_count", parsed.parts.len());

        let next_part_number_marker = match parsed.next_part_number_marker.as_deref() {
            Some(marker) if !marker.trim().is_empty() => {
                Some(marker.trim().parse::<u32>().map_err(|e| {
                    S3ClientError::ResponseError(format!("invalid NextPartNumberMarker: {e}"))
                })?)
            }
            _ => None,
        };

        let parts = parsed
            .parts
            .into_iter()
            .map(|p| S3ListedPart {
                part_number: p.part_number,
                etag: p.etag,
                size: p.size,
                last_modified: p
                    .last_modified
                    .as_deref()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|d| d.with_timezone(&Utc)),
            })
            .collect();

        Ok(S3ListPartsResponse {
            parts,
            is_truncated: parsed.is_truncated.unwrap_or(false),
            next_part_number_marker,
        })
    }
}

/// S3 PutObject response
#[derive(Debug, Clone)]
pub struct S3PutObjectResponse {
    pub etag: String,
    pub server_side_encryption: Option<String>,
}

/// S3 CreateMultipartUpload response
#[derive(Debug, Clone)]
pub struct S3CreateMultipartUploadResponse {
    pub upload_id: String,
    pub server_side_encryption: Option<String>,
}

/// S3 UploadPart response
#[derive(Debug, Clone)]
pub struct S3UploadPartResponse {
    pub etag: String,
    pub server_side_encryption: Option<String>,
}

/// S3 CompleteMultipartUpload response
#[derive(Debug, Clone)]
pub struct S3CompleteMultipartUploadResponse {
    pub etag: String,
    pub location: Option<String>,
    pub server_side_encryption: Option<String>,
}

/// S3 completed part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// One page of ListParts
#[derive(Debug, Clone)]
pub struct S3ListPartsResponse {
    pub parts: Vec<S3ListedPart>,
    pub is_truncated: bool,
    pub next_part_number_marker: Option<u32>,
}

/// A part already stored by the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3ListedPart {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}
