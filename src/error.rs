//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can have warren `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur handling proxy channels and the HTTP
/// exchanges carried over them.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// Every data channel was in use when an allocation was requested.
    Saturated,
    /// The peer never acknowledged an allocation within the deadline.
    AllocationTimeout,
    /// The peer refused an allocation (unknown or busy channel).
    AllocationRefused,
    /// The control channel is not connected.
    ControlChannelDown,
    /// A control frame could not be framed or exceeded the frame cap.
    Frame,
    /// An HTTP message on a data channel could not be parsed.
    Parse(Parse),
    /// An `io::Error` occurred while reading or writing a stream.
    Io,
    /// A response did not complete within the response deadline.
    ResponseTimeout,
    /// A pending exchange was dropped before it completed.
    Canceled,
    /// Error creating one of the container-side listeners.
    Listen,
}

#[derive(Debug)]
pub(crate) enum Parse {
    Method,
    Uri,
    Version,
    Header,
    Status,
    TooLarge,
    Chunk,
}

impl Error {
    /// Returns true if the channel pool was saturated.
    pub fn is_saturated(&self) -> bool {
        matches!(self.inner.kind, Kind::Saturated)
    }

    /// Returns true if an allocation timed out waiting for the peer.
    pub fn is_allocation_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::AllocationTimeout)
    }

    /// Returns true if the control channel was down.
    pub fn is_control_channel_down(&self) -> bool {
        matches!(self.inner.kind, Kind::ControlChannelDown)
    }

    /// Returns true if this was an HTTP parse error.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if this was caused by a message that was too large.
    pub fn is_parse_too_large(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(Parse::TooLarge))
    }

    /// Returns true if a response timed out.
    pub fn is_response_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::ResponseTimeout)
    }

    /// Returns true if a pending exchange was canceled.
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn new_saturated() -> Error {
        Error::new(Kind::Saturated)
    }

    pub(crate) fn new_allocation_timeout() -> Error {
        Error::new(Kind::AllocationTimeout)
    }

    pub(crate) fn new_allocation_refused(message: String) -> Error {
        Error::new(Kind::AllocationRefused).with(message)
    }

    pub(crate) fn new_control_channel_down() -> Error {
        Error::new(Kind::ControlChannelDown)
    }

    pub(crate) fn new_frame<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Frame).with(cause)
    }

    pub(crate) fn new_parse(parse: Parse) -> Error {
        Error::new(Kind::Parse(parse))
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_response_timeout() -> Error {
        Error::new(Kind::ResponseTimeout)
    }

    pub(crate) fn new_canceled() -> Error {
        Error::new(Kind::Canceled)
    }

    pub(crate) fn new_listen(cause: std::io::Error) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Saturated => "all proxy channels in use",
            Kind::AllocationTimeout => "channel allocation timed out",
            Kind::AllocationRefused => "channel allocation refused by peer",
            Kind::ControlChannelDown => "control channel disconnected",
            Kind::Frame => "control frame error",
            Kind::Parse(Parse::Method) => "invalid HTTP method parsed",
            Kind::Parse(Parse::Uri) => "invalid URI",
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::Header) => "invalid HTTP header parsed",
            Kind::Parse(Parse::Status) => "invalid HTTP status-line parsed",
            Kind::Parse(Parse::TooLarge) => "message head is too large",
            Kind::Parse(Parse::Chunk) => "invalid chunked encoding",
            Kind::Io => "connection error",
            Kind::ResponseTimeout => "response timed out",
            Kind::Canceled => "operation was canceled",
            Kind::Listen => "error creating listener",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("warren::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::new_io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn error_size_of() {
        assert_eq!(mem::size_of::<Error>(), mem::size_of::<usize>());
    }

    #[test]
    fn predicates_match_kinds() {
        assert!(Error::new_saturated().is_saturated());
        assert!(Error::new_allocation_timeout().is_allocation_timeout());
        assert!(Error::new_control_channel_down().is_control_channel_down());
        assert!(Error::new_parse(Parse::Chunk).is_parse());
        assert!(Error::new_parse(Parse::TooLarge).is_parse_too_large());
        assert!(Error::new_response_timeout().is_response_timeout());
        assert!(!Error::new_canceled().is_saturated());
    }

    #[test]
    fn display_includes_cause() {
        let err = Error::new_frame("frame length 20971520 exceeds cap");
        let s = err.to_string();
        assert!(s.starts_with("control frame error"));
        assert!(s.contains("exceeds cap"));
    }
}
