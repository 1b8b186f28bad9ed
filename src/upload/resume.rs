//! Resume/listing resolver
//!
//! Pages through the parts a service already holds for an upload and
//! decides which of them a recomputed plan can reuse.
//!
//! # Example
//!
//! ```no_run
//! use futures::TryStreamExt;
//! use kumo_uploadr::s3::{S3Client, S3ClientConfig};
//! use kumo_uploadr::upload::{list_uploaded_parts, SessionRef};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Arc::new(S3Client::new(S3ClientConfig::default())?);
//! let session = SessionRef::new("my-bucket", "big.bin", "upload-id");
//!
//! let parts: Vec<_> = list_uploaded_parts(client, session, 1000).try_collect().await?;
//! println!("{} parts already uploaded", parts.len());
//! # Ok(())
//! # }
//! ```

use super::planner::{PartSpec, UploadPlan};
use super::session::SessionRef;
use super::{PartResult, UploadError};
use crate::s3::{MultipartApi, S3ListedPart};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, TryStreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A part the service reports as stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadedPart {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

impl From<S3ListedPart> for UploadedPart {
    fn from(part: S3ListedPart) -> Self {
        Self {
            part_number: part.part_number,
            etag: part.etag,
            size: part.size,
            last_modified: part.last_modified,
        }
    }
}

struct PageCursor {
    api: Arc<dyn MultipartApi>,
    session: SessionRef,
    page_size: u32,
    marker: Option<u32>,
    finished: bool,
}

/// Every stored part of `session`, ascending by part number.
///
/// Pages are requested lazily as the stream is polled.
pub fn list_uploaded_parts(
    api: Arc<dyn MultipartApi>,
    session: SessionRef,
    page_size: u32,
) -> impl Stream<Item = Result<UploadedPart, UploadError>> + Send {
    list_uploaded_parts_from(api, session, page_size, None)
}

/// Like [`list_uploaded_parts`], starting after part number `marker`
pub fn list_uploaded_parts_from(
    api: Arc<dyn MultipartApi>,
    session: SessionRef,
    page_size: u32,
    marker: Option<u32>,
) -> impl Stream<Item = Result<UploadedPart, UploadError>> + Send {
    let cursor = PageCursor {
        api,
        session,
        page_size: page_size.max(1),
        marker,
        finished: false,
    };

    stream::try_unfold(cursor, next_page)
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, UploadError>)))
        .try_flatten()
}

async fn next_page(
    mut cursor: PageCursor,
) -> Result<Option<(Vec<UploadedPart>, PageCursor)>, UploadError> {
    if cursor.finished {
        return Ok(None);
    }

    let page = cursor
        .api
        .list_parts(
            &cursor.session.bucket,
            &cursor.session.key,
            &cursor.session.upload_id,
            cursor.marker,
            Some(cursor.page_size),
        )
        .await?;

    let mut parts: Vec<UploadedPart> = page
        .parts
        .into_iter()
        .map(UploadedPart::from)
        .filter(|p| cursor.marker.map_or(true, |m| p.part_number > m))
        .collect();
    parts.sort_by_key(|p| p.part_number);

    tracing::debug!(
        upload_id = %cursor.session.upload_id,
        marker = ?cursor.marker,
        parts = parts.len(),
        truncated = page.is_truncated,
        "Listed uploaded parts"
    );

    if page.is_truncated {
        let next = page
            .next_part_number_marker
            .or_else(|| parts.last().map(|p| p.part_number));
        match next {
            Some(next) if cursor.marker.map_or(true, |m| next > m) => cursor.marker = Some(next),
            _ => {
                return Err(UploadError::MalformedResponse(format!(
                    "truncated part listing did not advance past marker {:?}",
                    cursor.marker
                )))
            }
        }
    } else {
        cursor.finished = true;
    }

    Ok(Some((parts, cursor)))
}

/// How stored parts line up with a plan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    /// Stored parts that match their planned range
    pub reusable: Vec<PartResult>,
    /// Planned parts that still need uploading
    pub pending: Vec<PartSpec>,
    /// Stored parts that cannot be used: wrong size or outside the plan
    pub invalidated: Vec<UploadedPart>,
}

/// Split `plan` into reusable and pending parts given what the service holds.
///
/// A stored part is reusable only when its size equals the planned length.
/// If a part number is listed more than once the last listing wins.
pub fn reconcile(plan: &UploadPlan, uploaded: &[UploadedPart]) -> Reconciliation {
    let mut stored: BTreeMap<u32, &UploadedPart> = BTreeMap::new();
    for part in uploaded {
        stored.insert(part.part_number, part);
    }

    let mut result = Reconciliation::default();
    for spec in plan.parts() {
        match stored.remove(&spec.part_number) {
            Some(part) if part.size == spec.length => result.reusable.push(PartResult {
                part_number: part.part_number,
                etag: part.etag.clone(),
                size: part.size,
                server_side_encryption: None,
            }),
            Some(part) => {
                result.invalidated.push(part.clone());
                result.pending.push(*spec);
            }
            None => result.pending.push(*spec),
        }
    }
    result.invalidated.extend(stored.into_values().cloned());
    result.invalidated.sort_by_key(|p| p.part_number);
    result
}
