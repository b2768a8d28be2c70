//! S3-style XML documents: listings, multipart results, error bodies.

use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::{CompletedPart, ListResult, StoreError};

const XMLNS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";
const XML_DECL: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";

fn iso8601(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Serialize)]
#[serde(rename = "ListBucketResult")]
struct ListBucketResult {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Prefix")]
    prefix: String,
    #[serde(rename = "Delimiter", skip_serializing_if = "Option::is_none")]
    delimiter: Option<String>,
    #[serde(rename = "MaxKeys")]
    max_keys: usize,
    #[serde(rename = "KeyCount")]
    key_count: usize,
    #[serde(rename = "IsTruncated")]
    is_truncated: bool,
    #[serde(
        rename = "NextContinuationToken",
        skip_serializing_if = "Option::is_none"
    )]
    next_continuation_token: Option<String>,
    #[serde(rename = "Contents")]
    contents: Vec<Contents>,
    #[serde(rename = "CommonPrefixes")]
    common_prefixes: Vec<CommonPrefix>,
}

#[derive(Debug, Serialize)]
struct Contents {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "LastModified")]
    last_modified: String,
    #[serde(rename = "ETag")]
    etag: String,
    #[serde(rename = "Size")]
    size: u64,
    #[serde(rename = "StorageClass")]
    storage_class: &'static str,
}

#[derive(Debug, Serialize)]
struct CommonPrefix {
    #[serde(rename = "Prefix")]
    prefix: String,
}

pub(crate) fn list_result_doc(
    bucket: &str,
    prefix: Option<&str>,
    delimiter: Option<&str>,
    max_keys: usize,
    result: &ListResult,
) -> String {
    let doc = ListBucketResult {
        xmlns: XMLNS,
        name: bucket.to_owned(),
        prefix: prefix.unwrap_or("").to_owned(),
        delimiter: delimiter.map(str::to_owned),
        max_keys,
        key_count: result.contents.len() + result.common_prefixes.len(),
        is_truncated: result.is_truncated,
        next_continuation_token: result.next_continuation_token.clone(),
        contents: result
            .contents
            .iter()
            .map(|entry| Contents {
                key: entry.key.clone(),
                last_modified: iso8601(entry.last_modified),
                etag: format!("\"{}\"", entry.etag),
                size: entry.size,
                storage_class: "STANDARD",
            })
            .collect(),
        common_prefixes: result
            .common_prefixes
            .iter()
            .map(|p| CommonPrefix { prefix: p.clone() })
            .collect(),
    };
    serialize(&doc)
}

#[derive(Debug, Serialize)]
#[serde(rename = "InitiateMultipartUploadResult")]
struct InitiateMultipartUploadResult {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "Bucket")]
    bucket: String,
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "UploadId")]
    upload_id: String,
}

pub(crate) fn initiate_doc(bucket: &str, key: &str, upload_id: &str) -> String {
    serialize(&InitiateMultipartUploadResult {
        xmlns: XMLNS,
        bucket: bucket.to_owned(),
        key: key.to_owned(),
        upload_id: upload_id.to_owned(),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename = "CompleteMultipartUploadResult")]
struct CompleteMultipartUploadResult {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "Location")]
    location: String,
    #[serde(rename = "Bucket")]
    bucket: String,
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "ETag")]
    etag: String,
}

pub(crate) fn complete_doc(bucket: &str, key: &str, etag: &str) -> String {
    serialize(&CompleteMultipartUploadResult {
        xmlns: XMLNS,
        location: format!("/{}/{}", bucket, key),
        bucket: bucket.to_owned(),
        key: key.to_owned(),
        etag: format!("\"{}\"", etag),
    })
}

#[derive(Debug, Deserialize)]
struct CompleteMultipartUpload {
    #[serde(rename = "Part", default)]
    parts: Vec<PartXml>,
}

#[derive(Debug, Deserialize)]
struct PartXml {
    #[serde(rename = "PartNumber")]
    part_number: u32,
    #[serde(rename = "ETag")]
    etag: String,
}

/// Parses a `CompleteMultipartUpload` request body. An unparseable or
/// empty document is `MalformedXML`.
pub(crate) fn parse_complete(body: &[u8]) -> Result<Vec<CompletedPart>, StoreError> {
    let text = std::str::from_utf8(body).map_err(|_| StoreError::MalformedXml)?;
    let doc: CompleteMultipartUpload =
        quick_xml::de::from_str(text).map_err(|_| StoreError::MalformedXml)?;
    if doc.parts.is_empty() {
        return Err(StoreError::MalformedXml);
    }
    Ok(doc
        .parts
        .into_iter()
        .map(|part| CompletedPart {
            part_number: part.part_number,
            etag: part.etag.trim_matches('"').to_owned(),
        })
        .collect())
}

#[derive(Debug, Serialize)]
#[serde(rename = "Error")]
struct ErrorDoc {
    #[serde(rename = "Code")]
    code: &'static str,
    #[serde(rename = "Message")]
    message: String,
    #[serde(rename = "RequestId")]
    request_id: String,
    #[serde(rename = "HostId")]
    host_id: String,
}

pub(crate) fn error_doc(err: &StoreError, request_id: &str) -> String {
    serialize(&ErrorDoc {
        code: err.code(),
        message: err.message(),
        request_id: request_id.to_owned(),
        host_id: "warren-edge".to_owned(),
    })
}

fn serialize<T: Serialize>(doc: &T) -> String {
    match quick_xml::se::to_string(doc) {
        Ok(xml) => format!("{}{}", XML_DECL, xml),
        // Serialization of these closed structs cannot fail; keep the
        // body well-formed if it somehow does.
        Err(err) => {
            tracing::error!(%err, "xml serialization failed");
            format!(
                "{}<Error><Code>InternalError</Code><Message>xml serialization failed</Message></Error>",
                XML_DECL
            )
        }
    }
}
