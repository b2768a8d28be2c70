//! Serialization of message heads and bodies onto a stream.
//!
//! Writes go out in discrete units (head block, buffered body, each
//! chunk), each flushed before the next so the peer is never stalled on a
//! partially-filled buffer. `write_all` supplies the loop-until-accepted
//! discipline for short writes.

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{Method, StatusCode, Uri};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::conn::MessageReader;
use super::decode::BodyDecoder;
use crate::error::Error;

pub(crate) const CHUNKED_END: &[u8] = b"0\r\n\r\n";

/// Bodies re-encoded as chunked are cut into frames of this size.
const CHUNK_FRAME_SIZE: usize = 64 * 1024;

const AVERAGE_HEADER_SIZE: usize = 30;

/// Renders `METHOD path?query HTTP/1.1` plus the header block. A `Host`
/// header is inserted when missing, using `fallback_host`. The caller has
/// already fixed up framing headers.
pub(crate) fn render_request_head(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    fallback_host: Option<&str>,
) -> BytesMut {
    let target = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut dst = BytesMut::with_capacity(
        method.as_str().len() + target.len() + 16 + headers.len() * AVERAGE_HEADER_SIZE,
    );
    dst.put_slice(method.as_str().as_bytes());
    dst.put_u8(b' ');
    dst.put_slice(target.as_bytes());
    dst.put_slice(b" HTTP/1.1\r\n");
    if !headers.contains_key(HOST) {
        let host = uri.host().or(fallback_host);
        if let Some(host) = host {
            dst.put_slice(b"host: ");
            dst.put_slice(host.as_bytes());
            dst.put_slice(b"\r\n");
        }
    }
    write_headers(headers, &mut dst);
    dst.put_slice(b"\r\n");
    dst
}

/// Renders `HTTP/1.1 CODE reason` plus the header block.
pub(crate) fn render_response_head(status: StatusCode, headers: &HeaderMap) -> BytesMut {
    let mut dst = BytesMut::with_capacity(32 + headers.len() * AVERAGE_HEADER_SIZE);
    dst.put_slice(b"HTTP/1.1 ");
    dst.put_slice(status.as_str().as_bytes());
    dst.put_u8(b' ');
    dst.put_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    dst.put_slice(b"\r\n");
    write_headers(headers, &mut dst);
    dst.put_slice(b"\r\n");
    dst
}

fn write_headers(headers: &HeaderMap, dst: &mut BytesMut) {
    for (name, value) in headers.iter() {
        dst.put_slice(name.as_str().as_bytes());
        dst.put_slice(b": ");
        dst.put_slice(value.as_bytes());
        dst.put_slice(b"\r\n");
    }
}

/// Frames one chunk: `hex(len)\r\n<data>\r\n`.
pub(crate) fn chunk_frame(data: &[u8]) -> BytesMut {
    let mut dst = BytesMut::with_capacity(data.len() + 16);
    let mut size = [0u8; 16];
    let mut pos = size.len();
    let mut len = data.len();
    loop {
        pos -= 1;
        size[pos] = b"0123456789abcdef"[len % 16];
        len /= 16;
        if len == 0 {
            break;
        }
    }
    dst.put_slice(&size[pos..]);
    dst.put_slice(b"\r\n");
    dst.put_slice(data);
    dst.put_slice(b"\r\n");
    dst
}

/// Writes one discrete unit and flushes it.
pub(crate) async fn write_unit<W>(io: &mut W, buf: &[u8]) -> crate::Result<()>
where
    W: AsyncWrite + Unpin,
{
    io.write_all(buf).await.map_err(Error::new_io)?;
    io.flush().await.map_err(Error::new_io)
}

/// Where a request's body bytes come from.
pub(crate) enum RequestBodySource<'a> {
    /// No body follows the head.
    None,
    /// Content-Length framing: the decoded bytes stream through
    /// unchanged, same length, same content.
    Sized(&'a mut MessageReader, BodyDecoder),
    /// Chunked framing: decoded chunks are re-framed on the wire,
    /// ending with the zero chunk.
    Rechunk(&'a mut MessageReader, BodyDecoder),
    /// A body with neither framing: buffered up front so its size can
    /// be declared as `Content-Length`.
    Unframed(Bytes),
}

impl std::fmt::Debug for RequestBodySource<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestBodySource::None => f.write_str("None"),
            RequestBodySource::Sized(..) => f.write_str("Sized"),
            RequestBodySource::Rechunk(..) => f.write_str("Rechunk"),
            RequestBodySource::Unframed(data) => write!(f, "Unframed({}B)", data.len()),
        }
    }
}

/// Writes one request onto a data channel: request line rebuilt from the
/// target, headers passed through (with `Host` inserted when missing),
/// body framed per its source. Each unit is flushed as it goes out.
pub(crate) async fn write_request<W>(
    io: &mut W,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    fallback_host: Option<&str>,
    body: RequestBodySource<'_>,
) -> crate::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match body {
        RequestBodySource::None => {
            write_unit(io, &render_request_head(method, uri, headers, fallback_host)).await
        }
        RequestBodySource::Unframed(data) => {
            let mut headers = headers.clone();
            headers.remove(TRANSFER_ENCODING);
            let len = HeaderValue::from_str(&data.len().to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("0"));
            headers.insert(CONTENT_LENGTH, len);
            write_unit(io, &render_request_head(method, uri, &headers, fallback_host)).await?;
            write_unit(io, &data).await
        }
        RequestBodySource::Sized(reader, mut decoder) => {
            write_unit(io, &render_request_head(method, uri, headers, fallback_host)).await?;
            while let Some(chunk) = reader.next_body_chunk(&mut decoder).await? {
                write_unit(io, &chunk).await?;
            }
            Ok(())
        }
        RequestBodySource::Rechunk(reader, mut decoder) => {
            write_unit(io, &render_request_head(method, uri, headers, fallback_host)).await?;
            while let Some(chunk) = reader.next_body_chunk(&mut decoder).await? {
                if !chunk.is_empty() {
                    write_unit(io, &chunk_frame(&chunk)).await?;
                }
            }
            write_unit(io, CHUNKED_END).await
        }
    }
}

/// Serializes a response onto a data channel, fixing up framing the way
/// the edge side must: a body with neither `Content-Length` nor
/// `Transfer-Encoding: chunked` is chunk-encoded on the wire, and a
/// bodyless response without `Content-Length` gets `Content-Length: 0`.
/// `head_only` suppresses body bytes (HEAD) while keeping the headers.
pub(crate) async fn write_response<W>(
    io: &mut W,
    status: StatusCode,
    headers: &HeaderMap,
    body: &Bytes,
    head_only: bool,
) -> crate::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let has_length = headers.contains_key(CONTENT_LENGTH);
    let declared_chunked = headers
        .get(TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);

    let mut headers = headers.clone();
    let chunk_body = if body.is_empty() {
        if !has_length {
            headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        }
        false
    } else if declared_chunked {
        true
    } else if has_length {
        false
    } else {
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        true
    };

    write_unit(io, &render_response_head(status, &headers)).await?;
    if head_only || body.is_empty() {
        return Ok(());
    }
    if chunk_body {
        for frame in body.chunks(CHUNK_FRAME_SIZE) {
            write_unit(io, &chunk_frame(frame)).await?;
        }
        write_unit(io, CHUNKED_END).await?;
    } else {
        write_unit(io, body).await?;
    }
    Ok(())
}

/// Serializes a fully-buffered response to an ingress client. The body is
/// already decoded, so the wire framing is normalized to `Content-Length`
/// and any stale `Transfer-Encoding` is dropped. For a HEAD exchange the
/// declared `Content-Length` passes through untouched: it describes the
/// entity, not the (absent) body bytes.
pub(crate) async fn write_buffered_response<W>(
    io: &mut W,
    status: StatusCode,
    headers: &HeaderMap,
    body: &Bytes,
    head_request: bool,
) -> crate::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut headers = headers.clone();
    headers.remove(TRANSFER_ENCODING);
    if head_request {
        // keep the entity's declared length
    } else if body.is_empty() && (status.is_informational() || status == StatusCode::NO_CONTENT) {
        headers.remove(CONTENT_LENGTH);
    } else {
        let len = HeaderValue::from_str(&body.len().to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0"));
        headers.insert(CONTENT_LENGTH, len);
    }
    write_unit(io, &render_response_head(status, &headers)).await?;
    if !head_request && !body.is_empty() {
        write_unit(io, body).await?;
    }
    Ok(())
}
