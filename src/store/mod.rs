//! The object-store seam behind the edge side.
//!
//! The edge's data-channel handlers reconstruct an HTTP request and hand
//! it to the [`adapter`], which routes it to an [`ObjectStore`]
//! implementation and renders S3-style responses (including XML error
//! bodies). The store itself is a trait so the storage backend stays an
//! external collaborator; [`memory::MemoryStore`] is the in-process
//! implementation used by tests and local runs.

pub mod adapter;
pub mod memory;
mod multipart;
mod xml;

use std::fmt;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;

/// Objects at or below this size are written in one shot; larger bodies
/// go through a transparent multipart upload.
pub const SINGLE_SHOT_LIMIT: u64 = 50 * 1024 * 1024;

/// Part size used by the transparent multipart path.
pub const MULTIPART_PART_SIZE: usize = 10 * 1024 * 1024;

/// Every part except the last must be at least this large.
pub const MULTIPART_MIN_PART: u64 = 5 * 1024 * 1024;

/// Part numbers are constrained to `1..=MAX_PART_NUMBER`.
pub const MAX_PART_NUMBER: u32 = 10_000;

/// Metadata describing one stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub content_type: String,
    pub content_length: u64,
    /// Unquoted entity tag.
    pub etag: String,
    pub last_modified: SystemTime,
    /// Custom `md5` metadata recorded at write time, echoed back as
    /// `x-amz-meta-md5`.
    pub md5: Option<String>,
}

/// A retrieved object: metadata plus its bytes.
#[derive(Debug, Clone)]
pub struct ObjectBody {
    pub meta: ObjectMeta,
    pub data: Bytes,
}

/// Options carried by object writes.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub md5: Option<String>,
}

/// Options carried by bucket listings.
#[derive(Debug, Clone)]
pub struct ListOptions {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub max_keys: usize,
    pub continuation_token: Option<String>,
}

impl Default for ListOptions {
    fn default() -> ListOptions {
        ListOptions {
            prefix: None,
            delimiter: None,
            max_keys: 1000,
            continuation_token: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListEntry {
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub last_modified: SystemTime,
}

#[derive(Debug, Clone, Default)]
pub struct ListResult {
    pub contents: Vec<ListEntry>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
}

/// One entry of a multipart completion list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Typed store failures; each knows its S3 error code and status.
#[derive(Debug)]
pub enum StoreError {
    NoSuchBucket,
    NoSuchKey,
    NoSuchUpload,
    InvalidPart(String),
    EntityTooSmall,
    InvalidArgument(String),
    MalformedXml,
    PreconditionFailed,
    MethodNotAllowed,
    Internal(String),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NoSuchBucket => "NoSuchBucket",
            StoreError::NoSuchKey => "NoSuchKey",
            StoreError::NoSuchUpload => "NoSuchUpload",
            StoreError::InvalidPart(_) => "InvalidPart",
            StoreError::EntityTooSmall => "EntityTooSmall",
            StoreError::InvalidArgument(_) => "InvalidArgument",
            StoreError::MalformedXml => "MalformedXML",
            StoreError::PreconditionFailed => "PreconditionFailed",
            StoreError::MethodNotAllowed => "MethodNotAllowed",
            StoreError::Internal(_) => "InternalError",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            StoreError::NoSuchBucket | StoreError::NoSuchKey | StoreError::NoSuchUpload => {
                StatusCode::NOT_FOUND
            }
            StoreError::InvalidPart(_)
            | StoreError::EntityTooSmall
            | StoreError::InvalidArgument(_)
            | StoreError::MalformedXml => StatusCode::BAD_REQUEST,
            StoreError::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            StoreError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            StoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> String {
        match self {
            StoreError::NoSuchBucket => "The specified bucket does not exist.".to_owned(),
            StoreError::NoSuchKey => "The specified key does not exist.".to_owned(),
            StoreError::NoSuchUpload => "The specified upload does not exist.".to_owned(),
            StoreError::InvalidPart(detail) => format!("Invalid part: {}", detail),
            StoreError::EntityTooSmall => {
                "Your proposed upload is smaller than the minimum allowed size.".to_owned()
            }
            StoreError::InvalidArgument(detail) => detail.clone(),
            StoreError::MalformedXml => {
                "The XML you provided was not well-formed or did not validate.".to_owned()
            }
            StoreError::PreconditionFailed => {
                "At least one of the pre-conditions you specified did not hold.".to_owned()
            }
            StoreError::MethodNotAllowed => {
                "The specified method is not allowed against this resource.".to_owned()
            }
            StoreError::Internal(detail) => detail.clone(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl std::error::Error for StoreError {}

/// The operation surface the edge side requires of a storage backend.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn list(&self, bucket: &str, opts: ListOptions) -> Result<ListResult, StoreError>;

    async fn get(&self, bucket: &str, key: &str) -> Result<ObjectBody, StoreError>;

    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectMeta, StoreError>;

    /// Single-shot write; returns the new entity tag.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        opts: PutOptions,
    ) -> Result<String, StoreError>;

    /// Idempotent: deleting an absent key succeeds.
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError>;

    /// Starts a multipart upload; returns the upload id.
    async fn create_multipart(
        &self,
        bucket: &str,
        key: &str,
        opts: PutOptions,
    ) -> Result<String, StoreError>;

    /// Uploads one part; returns the part's entity tag.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String, StoreError>;

    /// Assembles the uploaded parts; returns the object's entity tag.
    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<String, StoreError>;

    async fn abort_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StoreError>;
}
