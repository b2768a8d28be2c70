//! Routes reconstructed HTTP requests onto the [`ObjectStore`] surface
//! and renders S3-style responses.
//!
//! Paths are routed by bucket prefix: `/<known-bucket>/key...` strips the
//! prefix and addresses the named bucket, anything else addresses the
//! default bucket. Failures never escape as errors; they render as XML
//! error documents so the container side can forward them as-is.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{
    HeaderName, HeaderValue, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_TYPE, ETAG, IF_MATCH,
    IF_NONE_MATCH, LAST_MODIFIED,
};
use http::{HeaderMap, Method, Response, StatusCode};
use url::Url;
use uuid::Uuid;

use super::{
    multipart, xml, ListOptions, ObjectMeta, ObjectStore, PutOptions, StoreError,
    SINGLE_SHOT_LIMIT,
};

const META_MD5: &str = "x-amz-meta-md5";
const XML_CONTENT_TYPE: &str = "application/xml";

/// The edge side's view of the object store, addressed over HTTP.
pub struct StoreAdapter {
    store: Arc<dyn ObjectStore>,
    default_bucket: String,
    buckets: HashSet<String>,
}

impl fmt::Debug for StoreAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreAdapter")
            .field("default_bucket", &self.default_bucket)
            .field("buckets", &self.buckets)
            .finish()
    }
}

impl StoreAdapter {
    pub fn new<I, S>(store: Arc<dyn ObjectStore>, default_bucket: S, buckets: I) -> StoreAdapter
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let default_bucket = default_bucket.into();
        let mut known: HashSet<String> = buckets.into_iter().map(Into::into).collect();
        known.insert(default_bucket.clone());
        StoreAdapter {
            store,
            default_bucket,
            buckets: known,
        }
    }

    /// Serves one reconstructed request. Never fails: store errors come
    /// back as S3 XML error responses with their proper status.
    pub async fn handle(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Response<Bytes> {
        match self.route(method, url, headers, body).await {
            Ok(response) => response,
            Err(err) => {
                let request_id = Uuid::new_v4().to_string();
                tracing::debug!(code = err.code(), %request_id, "store request failed");
                xml_response(err.status(), xml::error_doc(&err, &request_id))
            }
        }
    }

    async fn route(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response<Bytes>, StoreError> {
        let (bucket, key) = self.split_bucket(url.path());
        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();

        if key.is_empty() {
            return if *method == Method::GET {
                self.list(&bucket, &query).await
            } else {
                Err(StoreError::MethodNotAllowed)
            };
        }

        if *method == Method::GET {
            self.get_object(&bucket, &key, headers, false).await
        } else if *method == Method::HEAD {
            self.get_object(&bucket, &key, headers, true).await
        } else if *method == Method::PUT {
            match (query.get("uploadId"), query.get("partNumber")) {
                (Some(upload_id), Some(part_number)) => {
                    self.upload_part(&bucket, &key, upload_id, part_number, body)
                        .await
                }
                (Some(_), None) | (None, Some(_)) => Err(StoreError::InvalidArgument(
                    "uploadId and partNumber are required together".to_owned(),
                )),
                (None, None) => self.put_object(&bucket, &key, headers, body).await,
            }
        } else if *method == Method::POST {
            if query.contains_key("uploads") {
                self.initiate(&bucket, &key, headers).await
            } else if let Some(upload_id) = query.get("uploadId") {
                self.complete(&bucket, &key, upload_id, body).await
            } else {
                Err(StoreError::MethodNotAllowed)
            }
        } else if *method == Method::DELETE {
            if let Some(upload_id) = query.get("uploadId") {
                self.store.abort_multipart(&bucket, &key, upload_id).await?;
            } else {
                self.store.delete(&bucket, &key).await?;
            }
            Ok(empty_response(StatusCode::NO_CONTENT))
        } else {
            Err(StoreError::MethodNotAllowed)
        }
    }

    /// `/<known-bucket>/rest` routes to the named bucket, everything
    /// else to the default.
    fn split_bucket(&self, path: &str) -> (String, String) {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        if let Some((first, rest)) = trimmed.split_once('/') {
            if self.buckets.contains(first) {
                return (first.to_owned(), rest.to_owned());
            }
        } else if self.buckets.contains(trimmed) {
            // `/bucketA` alone addresses the bucket root (listing)
            return (trimmed.to_owned(), String::new());
        }
        (self.default_bucket.clone(), trimmed.to_owned())
    }

    async fn list(
        &self,
        bucket: &str,
        query: &HashMap<String, String>,
    ) -> Result<Response<Bytes>, StoreError> {
        let max_keys = match query.get("max-keys") {
            Some(raw) => raw
                .parse()
                .map_err(|_| StoreError::InvalidArgument("invalid max-keys".to_owned()))?,
            None => ListOptions::default().max_keys,
        };
        let opts = ListOptions {
            prefix: query.get("prefix").cloned(),
            delimiter: query.get("delimiter").cloned(),
            max_keys,
            continuation_token: query.get("continuation-token").cloned(),
        };
        let result = self.store.list(bucket, opts.clone()).await?;
        Ok(xml_response(
            StatusCode::OK,
            xml::list_result_doc(
                bucket,
                opts.prefix.as_deref(),
                opts.delimiter.as_deref(),
                opts.max_keys,
                &result,
            ),
        ))
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        headers: &HeaderMap,
        head_only: bool,
    ) -> Result<Response<Bytes>, StoreError> {
        let (meta, data) = if head_only {
            (self.store.head(bucket, key).await?, Bytes::new())
        } else {
            let object = self.store.get(bucket, key).await?;
            (object.meta, object.data)
        };

        if let Some(condition) = headers.get(IF_MATCH) {
            if !etag_condition_matches(condition, &meta.etag) {
                return Err(StoreError::PreconditionFailed);
            }
        }
        if let Some(condition) = headers.get(IF_NONE_MATCH) {
            if etag_condition_matches(condition, &meta.etag) {
                let mut response = empty_response(StatusCode::NOT_MODIFIED);
                put_header(response.headers_mut(), ETAG, &quoted(&meta.etag));
                return Ok(response);
            }
        }

        let mut response = Response::new(data);
        object_headers(response.headers_mut(), &meta);
        Ok(response)
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response<Bytes>, StoreError> {
        let opts = put_options(headers);
        let etag = if body.len() as u64 > SINGLE_SHOT_LIMIT {
            multipart::put_via_multipart(&*self.store, bucket, key, body, opts).await?
        } else {
            self.store.put(bucket, key, body, opts).await?
        };
        let mut response = empty_response(StatusCode::NO_CONTENT);
        put_header(response.headers_mut(), ETAG, &quoted(&etag));
        Ok(response)
    }

    async fn initiate(
        &self,
        bucket: &str,
        key: &str,
        headers: &HeaderMap,
    ) -> Result<Response<Bytes>, StoreError> {
        let upload_id = self
            .store
            .create_multipart(bucket, key, put_options(headers))
            .await?;
        Ok(xml_response(
            StatusCode::OK,
            xml::initiate_doc(bucket, key, &upload_id),
        ))
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: &str,
        body: Bytes,
    ) -> Result<Response<Bytes>, StoreError> {
        let part_number: u32 = part_number
            .parse()
            .map_err(|_| StoreError::InvalidArgument("invalid partNumber".to_owned()))?;
        let etag = self
            .store
            .upload_part(bucket, key, upload_id, part_number, body)
            .await?;
        let mut response = empty_response(StatusCode::OK);
        put_header(response.headers_mut(), ETAG, &quoted(&etag));
        Ok(response)
    }

    async fn complete(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        body: Bytes,
    ) -> Result<Response<Bytes>, StoreError> {
        let parts = xml::parse_complete(&body)?;
        let etag = self
            .store
            .complete_multipart(bucket, key, upload_id, parts)
            .await?;
        Ok(xml_response(
            StatusCode::OK,
            xml::complete_doc(bucket, key, &etag),
        ))
    }
}

fn put_options(headers: &HeaderMap) -> PutOptions {
    PutOptions {
        content_type: headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned),
        md5: headers
            .get(META_MD5)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned),
    }
}

fn object_headers(headers: &mut HeaderMap, meta: &ObjectMeta) {
    put_header(headers, CONTENT_TYPE, &meta.content_type);
    put_header(headers, CONTENT_LENGTH, &meta.content_length.to_string());
    put_header(headers, ETAG, &quoted(&meta.etag));
    put_header(
        headers,
        LAST_MODIFIED,
        &httpdate::fmt_http_date(meta.last_modified),
    );
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(md5) = &meta.md5 {
        if let Ok(name) = HeaderName::from_bytes(META_MD5.as_bytes()) {
            put_header(headers, name, md5);
        }
    }
}

fn put_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => tracing::warn!(%name, "dropping unrepresentable header value"),
    }
}

fn quoted(etag: &str) -> String {
    format!("\"{}\"", etag)
}

/// `If-Match` / `If-None-Match` comparison: `*` matches anything that
/// exists; otherwise any listed (unquoted, non-weak) tag must equal the
/// object's.
fn etag_condition_matches(condition: &HeaderValue, etag: &str) -> bool {
    let condition = match condition.to_str() {
        Ok(value) => value,
        Err(_) => return false,
    };
    condition.split(',').any(|candidate| {
        let candidate = candidate.trim().trim_start_matches("W/").trim_matches('"');
        candidate == "*" || candidate == etag
    })
}

fn xml_response(status: StatusCode, body: String) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(XML_CONTENT_TYPE));
    response
}

fn empty_response(status: StatusCode) -> Response<Bytes> {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = status;
    response
}
