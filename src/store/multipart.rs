//! Transparent multipart uploads for oversized PUT bodies.

use bytes::Bytes;

use super::{CompletedPart, ObjectStore, PutOptions, StoreError, MULTIPART_PART_SIZE};

/// Writes `data` as a multipart upload in fixed-size parts. Any failure
/// aborts the upload so no orphaned parts linger.
pub(crate) async fn put_via_multipart(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    data: Bytes,
    opts: PutOptions,
) -> Result<String, StoreError> {
    let upload_id = store.create_multipart(bucket, key, opts).await?;
    match upload_parts(store, bucket, key, &upload_id, data).await {
        Ok(etag) => Ok(etag),
        Err(err) => {
            if let Err(abort_err) = store.abort_multipart(bucket, key, &upload_id).await {
                tracing::warn!(%upload_id, error = %abort_err, "failed to abort multipart upload");
            }
            Err(err)
        }
    }
}

async fn upload_parts(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    upload_id: &str,
    data: Bytes,
) -> Result<String, StoreError> {
    let mut parts = Vec::with_capacity(data.len() / MULTIPART_PART_SIZE + 1);
    let mut offset = 0;
    let mut part_number = 1;
    while offset < data.len() {
        let end = std::cmp::min(offset + MULTIPART_PART_SIZE, data.len());
        let chunk = data.slice(offset..end);
        let etag = store
            .upload_part(bucket, key, upload_id, part_number, chunk)
            .await?;
        parts.push(CompletedPart {
            part_number,
            etag,
        });
        offset = end;
        part_number += 1;
    }
    store.complete_multipart(bucket, key, upload_id, parts).await
}
