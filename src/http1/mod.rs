//! HTTP/1.1 wire handling shared by both peers.
//!
//! The container side serializes requests onto data channels and parses
//! responses off them; the edge side does the mirror image. Both
//! directions share the head parsers ([`parse`]), the body decoder state
//! machine ([`decode`]), the serializers ([`encode`]), and the buffered
//! message reader ([`conn`]).

pub(crate) mod conn;
pub(crate) mod decode;
pub(crate) mod encode;
pub(crate) mod parse;

use http::{HeaderMap, Method, StatusCode, Uri, Version};

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyLength {
    /// No body bytes follow the head.
    Empty,
    /// A `Content-Length` header declared this many bytes.
    Known(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// No framing headers; the body runs until the peer closes.
    /// Only legal for responses.
    CloseDelimited,
}

/// A parsed request head.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub(crate) method: Method,
    /// The request target exactly as received (origin-form).
    pub(crate) uri: Uri,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) body: BodyLength,
}

/// A parsed response head.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) body: BodyLength,
}

impl ResponseHead {
    /// Statuses that finalize immediately with an empty body no matter
    /// what framing the headers declare: 1xx, 204, 304.
    pub(crate) fn never_has_body(&self) -> bool {
        self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
    }
}
