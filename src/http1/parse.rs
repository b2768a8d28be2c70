//! Head parsing for both message directions.

use bytes::{Buf, BytesMut};
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode, Uri, Version};

use super::{BodyLength, RequestHead, ResponseHead};
use crate::error::{Error, Parse};

pub(crate) const MAX_HEADERS: usize = 100;

/// Maximum bytes a message head may occupy while still incomplete.
pub(crate) const MAX_HEAD_SIZE: usize = 8192 + 4096 * 100;

/// Tries to parse one request head off the front of `buf`.
///
/// Returns `Ok(None)` until a full head (terminated by `\r\n\r\n`) is
/// buffered; on success the head bytes are consumed from `buf` and any
/// body bytes that followed them are left in place.
pub(crate) fn parse_request_head(buf: &mut BytesMut) -> crate::Result<Option<RequestHead>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let (len, method, uri, version, headers) = {
        let mut parsed = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut parsed);
        match req.parse(buf).map_err(map_httparse)? {
            httparse::Status::Complete(len) => {
                // httparse guarantees the fields on Complete
                let method = Method::from_bytes(req.method.unwrap().as_bytes())
                    .map_err(|_| Error::new_parse(Parse::Method))?;
                let uri = req
                    .path
                    .unwrap()
                    .parse::<Uri>()
                    .map_err(|_| Error::new_parse(Parse::Uri))?;
                let version = parse_version(req.version.unwrap())?;
                let headers = copy_headers(req.headers)?;
                (len, method, uri, version, headers)
            }
            httparse::Status::Partial => {
                if buf.len() >= MAX_HEAD_SIZE {
                    return Err(Error::new_parse(Parse::TooLarge));
                }
                return Ok(None);
            }
        }
    };
    buf.advance(len);
    let body = request_body_length(&headers)?;
    Ok(Some(RequestHead {
        method,
        uri,
        version,
        headers,
        body,
    }))
}

/// Tries to parse one response head off the front of `buf`.
pub(crate) fn parse_response_head(buf: &mut BytesMut) -> crate::Result<Option<ResponseHead>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let (len, status, version, headers) = {
        let mut parsed = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut res = httparse::Response::new(&mut parsed);
        match res.parse(buf).map_err(map_httparse)? {
            httparse::Status::Complete(len) => {
                let status = StatusCode::from_u16(res.code.unwrap())
                    .map_err(|_| Error::new_parse(Parse::Status))?;
                let version = parse_version(res.version.unwrap())?;
                let headers = copy_headers(res.headers)?;
                (len, status, version, headers)
            }
            httparse::Status::Partial => {
                if buf.len() >= MAX_HEAD_SIZE {
                    return Err(Error::new_parse(Parse::TooLarge));
                }
                return Ok(None);
            }
        }
    };
    buf.advance(len);
    let mut head = ResponseHead {
        status,
        version,
        headers,
        body: BodyLength::CloseDelimited,
    };
    head.body = if head.never_has_body() {
        BodyLength::Empty
    } else {
        response_body_length(&head.headers)?
    };
    Ok(Some(head))
}

fn map_httparse(err: httparse::Error) -> Error {
    match err {
        httparse::Error::HeaderName
        | httparse::Error::HeaderValue
        | httparse::Error::NewLine
        | httparse::Error::Token => Error::new_parse(Parse::Header),
        httparse::Error::Status => Error::new_parse(Parse::Status),
        httparse::Error::Version => Error::new_parse(Parse::Version),
        httparse::Error::TooManyHeaders => Error::new_parse(Parse::TooLarge),
    }
}

fn parse_version(minor: u8) -> crate::Result<Version> {
    match minor {
        0 => Ok(Version::HTTP_10),
        1 => Ok(Version::HTTP_11),
        _ => Err(Error::new_parse(Parse::Version)),
    }
}

fn copy_headers(parsed: &[httparse::Header<'_>]) -> crate::Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(parsed.len());
    for header in parsed {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| Error::new_parse(Parse::Header))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| Error::new_parse(Parse::Header))?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// RFC 7230 §3.3.3 as it applies to requests: chunked must be the final
/// transfer coding, Content-Length must be a single consistent value, and
/// the two must not be combined. A request with neither has no body.
fn request_body_length(headers: &HeaderMap) -> crate::Result<BodyLength> {
    match transfer_encoding_chunked(headers) {
        Some(true) => {
            if headers.contains_key(CONTENT_LENGTH) {
                return Err(Error::new_parse(Parse::Header));
            }
            Ok(BodyLength::Chunked)
        }
        // A request body whose length cannot be determined is unframeable.
        Some(false) => Err(Error::new_parse(Parse::Header)),
        None => match content_length(headers)? {
            Some(len) => Ok(BodyLength::Known(len)),
            None => Ok(BodyLength::Empty),
        },
    }
}

/// RFC 7230 §3.3.3 for responses: a non-chunked transfer coding, or no
/// framing headers at all, delimits the body by connection close.
fn response_body_length(headers: &HeaderMap) -> crate::Result<BodyLength> {
    match transfer_encoding_chunked(headers) {
        Some(true) => Ok(BodyLength::Chunked),
        Some(false) => Ok(BodyLength::CloseDelimited),
        None => match content_length(headers)? {
            Some(len) => Ok(BodyLength::Known(len)),
            None => Ok(BodyLength::CloseDelimited),
        },
    }
}

/// `Some(true)` if Transfer-Encoding is present with `chunked` as the
/// final coding, `Some(false)` if present without it, `None` if absent.
fn transfer_encoding_chunked(headers: &HeaderMap) -> Option<bool> {
    let mut last = None;
    let mut present = false;
    for value in headers.get_all(TRANSFER_ENCODING) {
        present = true;
        let value = value.to_str().ok()?;
        for coding in value.split(',') {
            let coding = coding.trim();
            if !coding.is_empty() {
                last = Some(coding.eq_ignore_ascii_case("chunked"));
            }
        }
    }
    if present {
        Some(last.unwrap_or(false))
    } else {
        None
    }
}

fn content_length(headers: &HeaderMap) -> crate::Result<Option<u64>> {
    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| Error::new_parse(Parse::Header))?;
        // Multiple Content-Length headers must agree.
        if let Some(existing) = length {
            if existing != parsed {
                return Err(Error::new_parse(Parse::Header));
            }
        }
        length = Some(parsed);
    }
    Ok(length)
}
