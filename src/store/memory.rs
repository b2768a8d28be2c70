//! In-memory [`ObjectStore`] used by tests and local runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use super::{
    CompletedPart, ListEntry, ListOptions, ListResult, ObjectBody, ObjectMeta, ObjectStore,
    PutOptions, StoreError, MAX_PART_NUMBER, MULTIPART_MIN_PART,
};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Sorts after every real key sharing the prefix it is appended to;
/// used to resume a listing past a whole common-prefix group.
const AFTER_PREFIX: char = '\u{10FFFF}';

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    buckets: HashMap<String, BTreeMap<String, StoredObject>>,
    uploads: HashMap<String, UploadState>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    meta: ObjectMeta,
}

#[derive(Debug)]
struct UploadState {
    bucket: String,
    key: String,
    opts: PutOptions,
    parts: BTreeMap<u32, PartData>,
}

#[derive(Debug)]
struct PartData {
    data: Bytes,
    etag: String,
}

fn etag_of(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

struct Assembled {
    data: Vec<u8>,
    /// Concatenated binary part digests; the multipart etag is the md5
    /// of this, suffixed with the part count.
    digests: Vec<u8>,
}

fn assemble(upload: &UploadState, parts: &[CompletedPart]) -> Result<Assembled, StoreError> {
    let mut last_number = 0;
    let mut out = Assembled {
        data: Vec::new(),
        digests: Vec::with_capacity(parts.len() * 16),
    };
    for (index, part) in parts.iter().enumerate() {
        if part.part_number <= last_number {
            return Err(StoreError::InvalidPart(
                "part numbers must be ascending".to_owned(),
            ));
        }
        last_number = part.part_number;
        let stored = upload
            .parts
            .get(&part.part_number)
            .ok_or_else(|| StoreError::InvalidPart(format!("part {}", part.part_number)))?;
        if stored.etag != part.etag {
            return Err(StoreError::InvalidPart(format!(
                "etag mismatch for part {}",
                part.part_number
            )));
        }
        let is_last = index + 1 == parts.len();
        if !is_last && (stored.data.len() as u64) < MULTIPART_MIN_PART {
            return Err(StoreError::EntityTooSmall);
        }
        out.digests
            .extend_from_slice(&md5::compute(&stored.data).0);
        out.data.extend_from_slice(&stored.data);
    }
    Ok(out)
}

impl MemoryStore {
    /// Creates a store with the given (initially empty) buckets.
    pub fn new<I, S>(buckets: I) -> MemoryStore
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inner = Inner::default();
        for bucket in buckets {
            inner.buckets.insert(bucket.into(), BTreeMap::new());
        }
        MemoryStore {
            inner: Mutex::new(inner),
        }
    }
}

impl Inner {
    fn bucket(&self, name: &str) -> Result<&BTreeMap<String, StoredObject>, StoreError> {
        self.buckets.get(name).ok_or(StoreError::NoSuchBucket)
    }

    fn bucket_mut(
        &mut self,
        name: &str,
    ) -> Result<&mut BTreeMap<String, StoredObject>, StoreError> {
        self.buckets.get_mut(name).ok_or(StoreError::NoSuchBucket)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self, bucket: &str, opts: ListOptions) -> Result<ListResult, StoreError> {
        let inner = self.inner.lock().unwrap();
        let objects = inner.bucket(bucket)?;

        if opts.max_keys == 0 {
            return Ok(ListResult::default());
        }

        let prefix = opts.prefix.as_deref().unwrap_or("");
        let delimiter = opts.delimiter.as_deref().filter(|d| !d.is_empty());
        let start = match &opts.continuation_token {
            Some(token) => Bound::Excluded(token.clone()),
            None => Bound::Unbounded,
        };

        let mut result = ListResult::default();
        let mut seen_prefixes: BTreeSet<String> = BTreeSet::new();
        let mut count = 0;
        let mut marker = String::new();

        for (key, object) in objects.range((start, Bound::Unbounded)) {
            if !key.starts_with(prefix) {
                if key.as_str() < prefix {
                    continue;
                }
                break;
            }
            // Keys sharing a delimiter-terminated segment after the
            // prefix roll up into one CommonPrefixes entry.
            if let Some(delim) = delimiter {
                if let Some(pos) = key[prefix.len()..].find(delim) {
                    let group = key[..prefix.len() + pos + delim.len()].to_owned();
                    if seen_prefixes.contains(&group) {
                        continue;
                    }
                    if count == opts.max_keys {
                        result.is_truncated = true;
                        break;
                    }
                    marker = format!("{}{}", group, AFTER_PREFIX);
                    seen_prefixes.insert(group.clone());
                    result.common_prefixes.push(group);
                    count += 1;
                    continue;
                }
            }
            if count == opts.max_keys {
                result.is_truncated = true;
                break;
            }
            marker = key.clone();
            result.contents.push(ListEntry {
                key: key.clone(),
                size: object.meta.content_length,
                etag: object.meta.etag.clone(),
                last_modified: object.meta.last_modified,
            });
            count += 1;
        }

        if result.is_truncated {
            result.next_continuation_token = Some(marker);
        }
        Ok(result)
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<ObjectBody, StoreError> {
        let inner = self.inner.lock().unwrap();
        let object = inner.bucket(bucket)?.get(key).ok_or(StoreError::NoSuchKey)?;
        Ok(ObjectBody {
            meta: object.meta.clone(),
            data: object.data.clone(),
        })
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectMeta, StoreError> {
        let inner = self.inner.lock().unwrap();
        let object = inner.bucket(bucket)?.get(key).ok_or(StoreError::NoSuchKey)?;
        Ok(object.meta.clone())
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        opts: PutOptions,
    ) -> Result<String, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let objects = inner.bucket_mut(bucket)?;
        let etag = etag_of(&data);
        let meta = ObjectMeta {
            content_type: opts
                .content_type
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_owned()),
            content_length: data.len() as u64,
            etag: etag.clone(),
            last_modified: SystemTime::now(),
            md5: opts.md5,
        };
        objects.insert(key.to_owned(), StoredObject { data, meta });
        Ok(etag)
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.bucket_mut(bucket)?.remove(key);
        Ok(())
    }

    async fn create_multipart(
        &self,
        bucket: &str,
        key: &str,
        opts: PutOptions,
    ) -> Result<String, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.bucket(bucket)?;
        let upload_id = Uuid::new_v4().to_string();
        inner.uploads.insert(
            upload_id.clone(),
            UploadState {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
                opts,
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String, StoreError> {
        if part_number == 0 || part_number > MAX_PART_NUMBER {
            return Err(StoreError::InvalidArgument(format!(
                "part number must be between 1 and {}",
                MAX_PART_NUMBER
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        let upload = inner
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.bucket == bucket && u.key == key)
            .ok_or(StoreError::NoSuchUpload)?;
        let etag = etag_of(&data);
        upload.parts.insert(part_number, PartData {
            data,
            etag: etag.clone(),
        });
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<String, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let upload = inner
            .uploads
            .remove(upload_id)
            .filter(|u| u.bucket == bucket && u.key == key)
            .ok_or(StoreError::NoSuchUpload)?;

        // A failed completion leaves the upload in place so the caller
        // can retry or abort it.
        let assembled = match assemble(&upload, &parts) {
            Ok(assembled) => assembled,
            Err(err) => {
                inner.uploads.insert(upload_id.to_owned(), upload);
                return Err(err);
            }
        };

        let etag = format!("{:x}-{}", md5::compute(&assembled.digests), parts.len());
        let opts = upload.opts;
        let meta = ObjectMeta {
            content_type: opts
                .content_type
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_owned()),
            content_length: assembled.data.len() as u64,
            etag: etag.clone(),
            last_modified: SystemTime::now(),
            md5: opts.md5,
        };
        inner.bucket_mut(bucket)?.insert(
            key.to_owned(),
            StoredObject {
                data: Bytes::from(assembled.data),
                meta,
            },
        );
        Ok(etag)
    }

    async fn abort_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .uploads
            .remove(upload_id)
            .filter(|u| u.bucket == bucket && u.key == key)
            .ok_or(StoreError::NoSuchUpload)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new(["bucketA"])
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let store = store();
        let etag = store
            .put("bucketA", "hello.txt", Bytes::from_static(b"hi\n"), PutOptions::default())
            .await
            .unwrap();
        let object = store.get("bucketA", "hello.txt").await.unwrap();
        assert_eq!(&object.data[..], b"hi\n");
        assert_eq!(object.meta.etag, etag);
        assert_eq!(object.meta.content_length, 3);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = store();
        store
            .put("bucketA", "k", Bytes::from_static(b"x"), PutOptions::default())
            .await
            .unwrap();
        store.delete("bucketA", "k").await.unwrap();
        store.delete("bucketA", "k").await.unwrap();
        store.delete("bucketA", "never-existed").await.unwrap();
        assert!(matches!(
            store.get("bucketA", "k").await,
            Err(StoreError::NoSuchKey)
        ));
    }

    #[tokio::test]
    async fn unknown_bucket_is_an_error() {
        let store = store();
        assert!(matches!(
            store.get("nope", "k").await,
            Err(StoreError::NoSuchBucket)
        ));
    }

    #[tokio::test]
    async fn list_with_delimiter_groups_prefixes() {
        let store = store();
        for key in ["a/1", "a/2", "b/1", "top"] {
            store
                .put("bucketA", key, Bytes::from_static(b"x"), PutOptions::default())
                .await
                .unwrap();
        }
        let result = store
            .list(
                "bucketA",
                ListOptions {
                    delimiter: Some("/".to_owned()),
                    ..ListOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(result.common_prefixes, vec!["a/", "b/"]);
        assert_eq!(result.contents.len(), 1);
        assert_eq!(result.contents[0].key, "top");
        assert!(!result.is_truncated);
    }

    #[tokio::test]
    async fn list_paginates_with_continuation_token() {
        let store = store();
        for key in ["k1", "k2", "k3", "k4", "k5"] {
            store
                .put("bucketA", key, Bytes::from_static(b"x"), PutOptions::default())
                .await
                .unwrap();
        }
        let first = store
            .list(
                "bucketA",
                ListOptions {
                    max_keys: 2,
                    ..ListOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(first.contents.len(), 2);
        assert!(first.is_truncated);
        let token = first.next_continuation_token.clone().unwrap();

        let second = store
            .list(
                "bucketA",
                ListOptions {
                    max_keys: 10,
                    continuation_token: Some(token),
                    ..ListOptions::default()
                },
            )
            .await
            .unwrap();
        let keys: Vec<_> = second.contents.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["k3", "k4", "k5"]);
        assert!(!second.is_truncated);
    }

    #[tokio::test]
    async fn multipart_assembles_in_part_number_order() {
        let store = store();
        let upload_id = store
            .create_multipart("bucketA", "big", PutOptions::default())
            .await
            .unwrap();
        let part1 = Bytes::from(vec![b'a'; MULTIPART_MIN_PART as usize]);
        let etag1 = store
            .upload_part("bucketA", "big", &upload_id, 1, part1.clone())
            .await
            .unwrap();
        let etag2 = store
            .upload_part("bucketA", "big", &upload_id, 2, Bytes::from_static(b"tail"))
            .await
            .unwrap();
        let etag = store
            .complete_multipart(
                "bucketA",
                "big",
                &upload_id,
                vec![
                    CompletedPart {
                        part_number: 1,
                        etag: etag1,
                    },
                    CompletedPart {
                        part_number: 2,
                        etag: etag2,
                    },
                ],
            )
            .await
            .unwrap();
        assert!(etag.ends_with("-2"));
        let object = store.get("bucketA", "big").await.unwrap();
        assert_eq!(object.data.len(), MULTIPART_MIN_PART as usize + 4);
        // the upload is gone
        assert!(matches!(
            store.abort_multipart("bucketA", "big", &upload_id).await,
            Err(StoreError::NoSuchUpload)
        ));
    }

    #[tokio::test]
    async fn multipart_enforces_minimum_part_size() {
        let store = store();
        let upload_id = store
            .create_multipart("bucketA", "small", PutOptions::default())
            .await
            .unwrap();
        let e1 = store
            .upload_part("bucketA", "small", &upload_id, 1, Bytes::from_static(b"tiny"))
            .await
            .unwrap();
        let e2 = store
            .upload_part("bucketA", "small", &upload_id, 2, Bytes::from_static(b"tiny2"))
            .await
            .unwrap();
        let err = store
            .complete_multipart(
                "bucketA",
                "small",
                &upload_id,
                vec![
                    CompletedPart {
                        part_number: 1,
                        etag: e1,
                    },
                    CompletedPart {
                        part_number: 2,
                        etag: e2,
                    },
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::EntityTooSmall));
    }

    #[tokio::test]
    async fn part_number_bounds_enforced() {
        let store = store();
        let upload_id = store
            .create_multipart("bucketA", "k", PutOptions::default())
            .await
            .unwrap();
        for bad in [0, MAX_PART_NUMBER + 1] {
            assert!(matches!(
                store
                    .upload_part("bucketA", "k", &upload_id, bad, Bytes::from_static(b"x"))
                    .await,
                Err(StoreError::InvalidArgument(_))
            ));
        }
    }
}
