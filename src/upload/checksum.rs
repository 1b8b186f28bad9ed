//! Part integrity helpers
//!
//! The service reports the MD5 of a part as its ETag for unencrypted and
//! SSE-S3 parts. Other ETags (SSE-KMS, SSE-C, composite) are opaque.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use md5::{Digest, Md5};

/// MD5 of a part body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartDigest([u8; 16]);

impl PartDigest {
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Md5::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Value for the `Content-MD5` header
    pub fn content_md5(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Lowercase hex, as it appears in an ETag
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Compare with a service ETag.
    ///
    /// Returns `None` when the ETag is not a plain MD5 and cannot be
    /// compared.
    pub fn matches_etag(&self, etag: &str) -> Option<bool> {
        let tag = normalize_etag(etag);
        if !is_md5_etag(tag) {
            return None;
        }
        Some(tag.eq_ignore_ascii_case(&self.hex()))
    }
}

/// Strip surrounding quotes and a weak-validator prefix
pub fn normalize_etag(etag: &str) -> &str {
    let etag = etag.trim();
    let etag = etag.strip_prefix("W/").unwrap_or(etag);
    etag.trim_matches('"')
}

/// Whether two ETags name the same content
pub fn etags_equal(a: &str, b: &str) -> bool {
    normalize_etag(a).eq_ignore_ascii_case(normalize_etag(b))
}

fn is_md5_etag(tag: &str) -> bool {
    tag.len() == 32 && tag.bytes().all(|b| b.is_ascii_hexdigit())
}
