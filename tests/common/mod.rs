//! Common Test Infrastructure
//!
//! An in-memory multipart service implementing `MultipartApi`, with hooks
//! to inject failures, slow parts down, and observe every call.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use kumo_uploadr::config::UploadConfig;
use kumo_uploadr::s3::{
    MultipartApi, ObjectOptions, S3ClientError, S3CompleteMultipartUploadResponse,
    S3CompletedPart, S3CreateMultipartUploadResponse, S3ListPartsResponse, S3ListedPart,
    S3PutObjectResponse, S3UploadPartResponse,
};
use kumo_uploadr::upload::checksum::PartDigest;
use kumo_uploadr::upload::RetryPolicy;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Encryption algorithms the fake accepts
const SUPPORTED_SSE: &[&str] = &["AES256"];

#[derive(Debug, Clone)]
pub struct StoredPart {
    pub etag: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
struct FakeUpload {
    bucket: String,
    key: String,
    sse: Option<String>,
    parts: BTreeMap<u32, StoredPart>,
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub etag: String,
    pub size: u64,
    pub options: ObjectOptions,
}

/// In-memory multipart service
#[derive(Default)]
pub struct FakeService {
    uploads: Mutex<HashMap<String, FakeUpload>>,
    objects: Mutex<HashMap<(String, String), StoredObject>>,
    next_id: AtomicUsize,

    part_failures: Mutex<HashMap<u32, VecDeque<S3ClientError>>>,
    wrong_etags: Mutex<HashMap<u32, usize>>,
    lost_parts: Mutex<Vec<u32>>,
    cancel_on_create: Mutex<Option<CancellationToken>>,
    cancel_on_list: Mutex<Option<CancellationToken>>,
    complete_failures: Mutex<VecDeque<S3ClientError>>,
    abort_failures: Mutex<VecDeque<S3ClientError>>,
    part_delay: Mutex<Duration>,

    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,

    pub part_calls: Mutex<Vec<u32>>,
    pub complete_calls: Mutex<Vec<Vec<u32>>>,
    pub abort_calls: Mutex<Vec<String>>,
    pub put_calls: AtomicUsize,
    pub content_md5s: Mutex<Vec<Option<String>>>,
}

impl FakeService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next uploads of `part_number` with `errors`, in order
    pub fn fail_part(&self, part_number: u32, errors: Vec<S3ClientError>) {
        self.part_failures
            .lock()
            .entry(part_number)
            .or_default()
            .extend(errors);
    }

    /// Return a wrong MD5 ETag for the next `times` uploads of `part_number`
    pub fn corrupt_etag(&self, part_number: u32, times: usize) {
        self.wrong_etags.lock().insert(part_number, times);
    }

    pub fn fail_complete(&self, error: S3ClientError) {
        self.complete_failures.lock().push_back(error);
    }

    pub fn fail_abort(&self, error: S3ClientError) {
        self.abort_failures.lock().push_back(error);
    }

    pub fn set_part_delay(&self, delay: Duration) {
        *self.part_delay.lock() = delay;
    }

    /// Acknowledge uploads of `part_number` without storing them
    pub fn lose_part(&self, part_number: u32) {
        self.lost_parts.lock().push(part_number);
    }

    /// Cancel `token` once CreateMultipartUpload has created the upload
    pub fn cancel_after_create(&self, token: CancellationToken) {
        *self.cancel_on_create.lock() = Some(token);
    }

    /// Cancel `token` while ListParts is being answered
    pub fn cancel_during_list(&self, token: CancellationToken) {
        *self.cancel_on_list.lock() = Some(token);
    }

    pub fn is_open(&self, upload_id: &str) -> bool {
        self.uploads.lock().contains_key(upload_id)
    }

    pub fn open_uploads(&self) -> usize {
        self.uploads.lock().len()
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn stored_parts(&self, upload_id: &str) -> Vec<u32> {
        self.uploads
            .lock()
            .get(upload_id)
            .map(|u| u.parts.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn sorted_part_calls(&self) -> Vec<u32> {
        let mut calls = self.part_calls.lock().clone();
        calls.sort_unstable();
        calls
    }

    fn no_such_upload(upload_id: &str) -> S3ClientError {
        S3ClientError::ServiceError {
            status: 404,
            code: "NoSuchUpload".into(),
            message: format!("upload {upload_id} does not exist"),
            request_id: None,
        }
    }
}

pub fn service_error(status: u16, code: &str) -> S3ClientError {
    S3ClientError::ServiceError {
        status,
        code: code.into(),
        message: format!("{code} injected by test"),
        request_id: Some("req-test".into()),
    }
}

fn quoted_md5(body: &[u8]) -> String {
    format!("\"{}\"", PartDigest::compute(body).hex())
}

#[async_trait]
impl MultipartApi for FakeService {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        options: &ObjectOptions,
        _content_md5: Option<&str>,
    ) -> Result<S3PutObjectResponse, S3ClientError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(sse) = &options.server_side_encryption {
            if !SUPPORTED_SSE.contains(&sse.as_str()) {
                return Err(service_error(400, "InvalidArgument"));
            }
        }
        let etag = quoted_md5(&body);
        self.objects.lock().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                etag: etag.clone(),
                size: body.len() as u64,
                options: options.clone(),
            },
        );
        Ok(S3PutObjectResponse {
            etag,
            server_side_encryption: options.server_side_encryption.clone(),
        })
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        options: &ObjectOptions,
    ) -> Result<S3CreateMultipartUploadResponse, S3ClientError> {
        if let Some(sse) = &options.server_side_encryption {
            if !SUPPORTED_SSE.contains(&sse.as_str()) {
                return Err(service_error(400, "InvalidArgument"));
            }
        }
        let upload_id = format!("upload-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.uploads.lock().insert(
            upload_id.clone(),
            FakeUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                sse: options.server_side_encryption.clone(),
                parts: BTreeMap::new(),
            },
        );
        if let Some(token) = self.cancel_on_create.lock().take() {
            token.cancel();
        }
        Ok(S3CreateMultipartUploadResponse {
            upload_id,
            server_side_encryption: options.server_side_encryption.clone(),
        })
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
        content_md5: Option<&str>,
    ) -> Result<S3UploadPartResponse, S3ClientError> {
        self.part_calls.lock().push(part_number);
        self.content_md5s.lock().push(content_md5.map(str::to_string));

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let delay = *self.part_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let injected = self
            .part_failures
            .lock()
            .get_mut(&part_number)
            .and_then(VecDeque::pop_front);
        if let Some(error) = injected {
            return Err(error);
        }

        let mut etag = quoted_md5(&body);
        {
            let mut wrong = self.wrong_etags.lock();
            if let Some(remaining) = wrong.get_mut(&part_number) {
                if *remaining > 0 {
                    *remaining -= 1;
                    etag = "\"00000000000000000000000000000000\"".into();
                }
            }
        }

        let lost = self.lost_parts.lock().contains(&part_number);
        let mut uploads = self.uploads.lock();
        let upload = uploads
            .get_mut(upload_id)
            .ok_or_else(|| Self::no_such_upload(upload_id))?;
        if lost {
            return Ok(S3UploadPartResponse {
                etag,
                server_side_encryption: upload.sse.clone(),
            });
        }
        upload.parts.insert(
            part_number,
            StoredPart {
                etag: etag.clone(),
                size: body.len() as u64,
            },
        );
        Ok(S3UploadPartResponse {
            etag,
            server_side_encryption: upload.sse.clone(),
        })
    }

    async fn complete_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        parts: &[S3CompletedPart],
    ) -> Result<S3CompleteMultipartUploadResponse, S3ClientError> {
        self.complete_calls
            .lock()
            .push(parts.iter().map(|p| p.part_number).collect());

        if let Some(error) = self.complete_failures.lock().pop_front() {
            return Err(error);
        }

        let mut uploads = self.uploads.lock();
        let upload = uploads
            .get(upload_id)
            .ok_or_else(|| Self::no_such_upload(upload_id))?;

        let mut size = 0;
        let mut previous = 0;
        for part in parts {
            if part.part_number <= previous {
                return Err(service_error(400, "InvalidPartOrder"));
            }
            previous = part.part_number;
            match upload.parts.get(&part.part_number) {
                Some(stored) if stored.etag == part.etag => size += stored.size,
                _ => return Err(service_error(400, "InvalidPart")),
            }
        }

        let etag = format!("\"complete-{}\"", parts.len());
        let sse = upload.sse.clone();
        let key = (upload.bucket.clone(), upload.key.clone());
        uploads.remove(upload_id);
        self.objects.lock().insert(
            key,
            StoredObject {
                etag: etag.clone(),
                size,
                options: ObjectOptions {
                    server_side_encryption: sse.clone(),
                    ..Default::default()
                },
            },
        );

        Ok(S3CompleteMultipartUploadResponse {
            etag,
            location: None,
            server_side_encryption: sse,
        })
    }

    async fn abort_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<(), S3ClientError> {
        self.abort_calls.lock().push(upload_id.to_string());
        if let Some(error) = self.abort_failures.lock().pop_front() {
            return Err(error);
        }
        self.uploads
            .lock()
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| Self::no_such_upload(upload_id))
    }

    async fn list_parts(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        part_number_marker: Option<u32>,
        max_parts: Option<u32>,
    ) -> Result<S3ListPartsResponse, S3ClientError> {
        if let Some(token) = self.cancel_on_list.lock().take() {
            token.cancel();
        }
        let uploads = self.uploads.lock();
        let upload = uploads
            .get(upload_id)
            .ok_or_else(|| Self::no_such_upload(upload_id))?;

        let marker = part_number_marker.unwrap_or(0);
        let max = max_parts.unwrap_or(1000) as usize;
        let remaining: Vec<S3ListedPart> = upload
            .parts
            .range(marker + 1..)
            .map(|(number, part)| S3ListedPart {
                part_number: *number,
                etag: part.etag.clone(),
                size: part.size,
                last_modified: None,
            })
            .collect();

        let is_truncated = remaining.len() > max;
        let parts: Vec<S3ListedPart> = remaining.into_iter().take(max).collect();
        let next_part_number_marker = if is_truncated {
            parts.last().map(|p| p.part_number)
        } else {
            None
        };

        Ok(S3ListPartsResponse {
            parts,
            is_truncated,
            next_part_number_marker,
        })
    }
}

/// Upload settings with tiny parts so tests stay fast
pub fn small_parts_config(part_size: u64, concurrent_parts: usize) -> UploadConfig {
    UploadConfig {
        multipart_threshold: part_size,
        part_size,
        min_part_size: 1,
        concurrent_parts,
        ..UploadConfig::default()
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}

/// Deterministic test payload
pub fn payload(size: usize) -> Bytes {
    Bytes::from((0..size).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}
