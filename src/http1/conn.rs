//! Buffered message reading over either a socket or a byte pipe.
//!
//! The edge side reads straight off its data-channel sockets. The
//! container side reads off the bounded pipe its per-socket reader task
//! feeds. Both drive the same rolling buffer and decoders.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;

use super::decode::{BodyDecoder, Step};
use super::parse;
use super::{BodyLength, RequestHead, ResponseHead};
use crate::error::Error;

const READ_CHUNK: usize = 16 * 1024;

/// Where a reader's bytes come from.
#[derive(Debug)]
pub(crate) enum ByteStream {
    Socket(OwnedReadHalf),
    Pipe(mpsc::Receiver<Bytes>),
}

impl ByteStream {
    /// Appends the next batch of bytes to `buf`; `false` means EOF.
    async fn fill(&mut self, buf: &mut BytesMut) -> io::Result<bool> {
        match self {
            ByteStream::Socket(half) => {
                buf.reserve(READ_CHUNK);
                let n = half.read_buf(buf).await?;
                Ok(n > 0)
            }
            ByteStream::Pipe(rx) => match rx.recv().await {
                Some(bytes) => {
                    buf.extend_from_slice(&bytes);
                    Ok(true)
                }
                None => Ok(false),
            },
        }
    }
}

/// Rolling-buffer HTTP/1.1 message reader.
#[derive(Debug)]
pub(crate) struct MessageReader {
    stream: ByteStream,
    buf: BytesMut,
    eof: bool,
}

impl MessageReader {
    pub(crate) fn socket(half: OwnedReadHalf) -> MessageReader {
        MessageReader {
            stream: ByteStream::Socket(half),
            buf: BytesMut::with_capacity(READ_CHUNK),
            eof: false,
        }
    }

    pub(crate) fn pipe(rx: mpsc::Receiver<Bytes>) -> MessageReader {
        MessageReader {
            stream: ByteStream::Pipe(rx),
            buf: BytesMut::with_capacity(READ_CHUNK),
            eof: false,
        }
    }

    async fn fill(&mut self) -> crate::Result<()> {
        if !self
            .stream
            .fill(&mut self.buf)
            .await
            .map_err(Error::new_io)?
        {
            self.eof = true;
        }
        Ok(())
    }

    /// Reads one request head. `Ok(None)` means the peer closed cleanly
    /// between messages (normal end of a keep-alive connection).
    pub(crate) async fn read_request_head(&mut self) -> crate::Result<Option<RequestHead>> {
        loop {
            if let Some(head) = parse::parse_request_head(&mut self.buf)? {
                return Ok(Some(head));
            }
            if self.eof {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(Error::new_io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid-head",
                    )))
                };
            }
            self.fill().await?;
        }
    }

    pub(crate) async fn read_response_head(&mut self) -> crate::Result<ResponseHead> {
        loop {
            if let Some(head) = parse::parse_response_head(&mut self.buf)? {
                return Ok(head);
            }
            if self.eof {
                return Err(Error::new_io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before response head",
                )));
            }
            self.fill().await?;
        }
    }

    /// Starts streaming a body; `None` when the head declared no body.
    pub(crate) fn begin_body(&mut self, body: BodyLength) -> Option<BodyDecoder> {
        BodyDecoder::new(body)
    }

    /// Next decoded body chunk, or `None` once the body is complete.
    pub(crate) async fn next_body_chunk(
        &mut self,
        decoder: &mut BodyDecoder,
    ) -> crate::Result<Option<Bytes>> {
        loop {
            match decoder.decode(&mut self.buf, self.eof)? {
                Step::Data(data) => return Ok(Some(data)),
                Step::Complete => return Ok(None),
                Step::NeedMore => self.fill().await?,
            }
        }
    }

    /// Collects one full body.
    pub(crate) async fn read_body(&mut self, body: BodyLength) -> crate::Result<Bytes> {
        let mut decoder = match BodyDecoder::new(body) {
            Some(decoder) => decoder,
            None => return Ok(Bytes::new()),
        };
        let mut out = BytesMut::new();
        while let Some(data) = self.next_body_chunk(&mut decoder).await? {
            out.extend_from_slice(&data);
        }
        Ok(out.freeze())
    }

    /// Reads one full request (head plus buffered body).
    pub(crate) async fn read_request(&mut self) -> crate::Result<Option<(RequestHead, Bytes)>> {
        let head = match self.read_request_head().await? {
            Some(head) => head,
            None => return Ok(None),
        };
        let body = self.read_body(head.body).await?;
        Ok(Some((head, body)))
    }

    /// Recovers the pipe receiver for keep-alive reuse of the channel.
    /// Returns `None` for socket-backed readers.
    pub(crate) fn into_pipe(self) -> Option<mpsc::Receiver<Bytes>> {
        match self.stream {
            ByteStream::Pipe(rx) => Some(rx),
            ByteStream::Socket(_) => None,
        }
    }

    /// Reads one full response. `head_request` skips the body entirely:
    /// a HEAD response carries framing headers but no body bytes.
    pub(crate) async fn read_response(
        &mut self,
        head_request: bool,
    ) -> crate::Result<(ResponseHead, Bytes)> {
        let head = self.read_response_head().await?;
        let body = if head_request {
            Bytes::new()
        } else {
            self.read_body(head.body).await?
        };
        Ok((head, body))
    }
}
