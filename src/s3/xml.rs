//! XML bodies of the multipart upload API

use super::S3ClientError;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct InitiateMultipartUploadResult {
    #[serde(default)]
    pub upload_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename = "CompleteMultipartUpload")]
pub(crate) struct CompleteMultipartUpload<'a> {
    #[serde(rename = "Part")]
    pub parts: Vec<CompletePart<'a>>,
}

#[derive(Debug, Serialize)]
pub(crate) struct CompletePart<'a> {
    #[serde(rename = "PartNumber")]
    pub part_number: u32,
    #[serde(rename = "ETag")]
    pub etag: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct CompleteMultipartUploadResult {
    #[serde(default)]
    pub location: Option<String>,
    #[serde(rename = "ETag", default)]
    pub etag: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ListPartsResult {
    #[serde(default)]
    pub next_part_number_marker: Option<String>,
    #[serde(default)]
    pub is_truncated: Option<bool>,
    #[serde(rename = "Part", default)]
    pub parts: Vec<ListedPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ListedPart {
    pub part_number: u32,
    #[serde(rename = "ETag")]
    pub etag: String,
    pub size: u64,
    #[serde(default)]
    pub last_modified: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Deserialize an XML response body
pub(crate) fn from_xml<T: DeserializeOwned>(body: &[u8]) -> Result<T, S3ClientError> {
    let text = std::str::from_utf8(body)
        .map_err(|e| S3ClientError::ResponseError(format!("response is not UTF-8: {e}")))?;
    quick_xml::de::from_str(text).map_err(|e| S3ClientError::ResponseError(e.to_string()))
}

/// Serialize a request body
pub(crate) fn to_xml<T: Serialize>(value: &T) -> Result<String, S3ClientError> {
    quick_xml::se::to_string(value).map_err(|e| S3ClientError::ConfigError(e.to_string()))
}

/// Local name of the document's root element
pub(crate) fn root_element(body: &[u8]) -> Option<String> {
    let mut reader = Reader::from_reader(body);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return Some(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}
