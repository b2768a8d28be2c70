//! Body decoders for the three delimitation modes.
//!
//! The decoder is sans-io: it consumes bytes off the front of a rolling
//! buffer and reports whether it produced data, needs more input, or
//! finished. Both peers drive it — the edge side from a socket, the
//! container side from the per-channel byte pipe — so it never touches a
//! stream itself.

use std::io;

use bytes::{Buf, Bytes, BytesMut};

use super::BodyLength;
use crate::error::{Error, Parse};

/// Cap on bytes spent in chunk extensions across the whole body.
const CHUNKED_EXTENSIONS_LIMIT: u64 = 1024 * 16;

/// Caps on the (discarded) trailer section after the last chunk.
const TRAILER_LINE_LIMIT: usize = 100;
const TRAILER_BYTE_LIMIT: usize = 1024 * 16;

/// One step of decoding.
#[derive(Debug)]
pub(crate) enum Step {
    /// Decoded body bytes.
    Data(Bytes),
    /// The buffer ran dry mid-message.
    NeedMore,
    /// The body is complete; unconsumed bytes stay in the buffer.
    Complete,
}

#[derive(Debug)]
pub(crate) struct BodyDecoder {
    kind: Kind,
}

#[derive(Debug)]
enum Kind {
    /// Content-Length counted this many bytes remaining.
    Length(u64),
    /// Transfer-Encoding: chunked.
    Chunked {
        state: ChunkedState,
        chunk_len: u64,
        extensions_cnt: u64,
        trailer_bytes: usize,
        trailer_lines: usize,
    },
    /// No framing; the body is delimited by connection close.
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ChunkedState {
    Start,
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    TrailerLf,
    EndCr,
    EndLf,
    End,
}

impl BodyDecoder {
    /// Returns the decoder for a parsed body length, or `None` when no
    /// body bytes follow the head.
    pub(crate) fn new(body: BodyLength) -> Option<BodyDecoder> {
        match body {
            BodyLength::Empty => None,
            BodyLength::Known(0) => None,
            BodyLength::Known(len) => Some(BodyDecoder {
                kind: Kind::Length(len),
            }),
            BodyLength::Chunked => Some(BodyDecoder {
                kind: Kind::Chunked {
                    state: ChunkedState::Start,
                    chunk_len: 0,
                    extensions_cnt: 0,
                    trailer_bytes: 0,
                    trailer_lines: 0,
                },
            }),
            BodyLength::CloseDelimited => Some(BodyDecoder { kind: Kind::Eof }),
        }
    }

    /// Consumes bytes from the front of `buf`. `eof` says the transport
    /// has closed and no further bytes will ever arrive.
    pub(crate) fn decode(&mut self, buf: &mut BytesMut, eof: bool) -> crate::Result<Step> {
        match self.kind {
            Kind::Length(ref mut remaining) => {
                if *remaining == 0 {
                    return Ok(Step::Complete);
                }
                if buf.is_empty() {
                    return starved(eof);
                }
                let n = std::cmp::min(buf.len() as u64, *remaining) as usize;
                let data = buf.split_to(n).freeze();
                *remaining -= n as u64;
                Ok(Step::Data(data))
            }
            Kind::Eof => {
                if !buf.is_empty() {
                    let len = buf.len();
                    Ok(Step::Data(buf.split_to(len).freeze()))
                } else if eof {
                    Ok(Step::Complete)
                } else {
                    Ok(Step::NeedMore)
                }
            }
            Kind::Chunked {
                ref mut state,
                ref mut chunk_len,
                ref mut extensions_cnt,
                ref mut trailer_bytes,
                ref mut trailer_lines,
            } => loop {
                if *state == ChunkedState::End {
                    return Ok(Step::Complete);
                }
                if *state == ChunkedState::Body {
                    if buf.is_empty() {
                        return starved(eof);
                    }
                    let n = std::cmp::min(buf.len() as u64, *chunk_len) as usize;
                    let data = buf.split_to(n).freeze();
                    *chunk_len -= n as u64;
                    if *chunk_len == 0 {
                        *state = ChunkedState::BodyCr;
                    }
                    tracing::trace!("chunked read, {} bytes", n);
                    return Ok(Step::Data(data));
                }
                if buf.is_empty() {
                    return starved(eof);
                }
                let byte = buf.get_u8();
                *state = step_chunked(
                    *state,
                    byte,
                    chunk_len,
                    extensions_cnt,
                    trailer_bytes,
                    trailer_lines,
                )?;
            },
        }
    }
}

fn starved(eof: bool) -> crate::Result<Step> {
    if eof {
        Err(Error::new_io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before message completed",
        )))
    } else {
        Ok(Step::NeedMore)
    }
}

/// Advances the chunked state machine by one byte (all states except
/// `Body`, which consumes slices).
fn step_chunked(
    state: ChunkedState,
    byte: u8,
    chunk_len: &mut u64,
    extensions_cnt: &mut u64,
    trailer_bytes: &mut usize,
    trailer_lines: &mut usize,
) -> crate::Result<ChunkedState> {
    use self::ChunkedState::*;

    let invalid = |what: &'static str| Err(Error::new_parse(Parse::Chunk).with(what));

    match state {
        Start => match hex_value(byte) {
            Some(v) => {
                *chunk_len = v as u64;
                Ok(Size)
            }
            None => invalid("missing size digit in chunk size line"),
        },
        Size => match byte {
            b'\t' | b' ' => Ok(SizeLws),
            b';' => Ok(Extension),
            b'\r' => Ok(SizeLf),
            _ => match hex_value(byte) {
                Some(v) => {
                    *chunk_len = chunk_len
                        .checked_mul(16)
                        .and_then(|len| len.checked_add(v as u64))
                        .ok_or_else(|| Error::new_parse(Parse::Chunk).with("chunk size overflow"))?;
                    Ok(Size)
                }
                None => invalid("invalid chunk size"),
            },
        },
        // LWS can follow the chunk size, but no more digits can come
        SizeLws => match byte {
            b'\t' | b' ' => Ok(SizeLws),
            b';' => Ok(Extension),
            b'\r' => Ok(SizeLf),
            _ => invalid("invalid chunk size linear white space"),
        },
        // Extensions are ignored; they end at CRLF. A bare LF inside an
        // extension is rejected rather than silently swallowed.
        Extension => match byte {
            b'\r' => Ok(SizeLf),
            b'\n' => invalid("chunk extension contains newline"),
            _ => {
                *extensions_cnt += 1;
                if *extensions_cnt >= CHUNKED_EXTENSIONS_LIMIT {
                    invalid("chunk extensions over limit")
                } else {
                    Ok(Extension)
                }
            }
        },
        SizeLf => match byte {
            b'\n' if *chunk_len == 0 => Ok(EndCr),
            b'\n' => Ok(Body),
            _ => invalid("invalid chunk size LF"),
        },
        Body => unreachable!("Body consumes slices"),
        BodyCr => match byte {
            b'\r' => Ok(BodyLf),
            _ => invalid("invalid chunk body CR"),
        },
        BodyLf => match byte {
            b'\n' => Ok(Start),
            _ => invalid("invalid chunk body LF"),
        },
        // Trailer lines after the last chunk are read and discarded.
        Trailer => {
            *trailer_bytes += 1;
            if *trailer_bytes >= TRAILER_BYTE_LIMIT {
                return invalid("chunk trailers over byte limit");
            }
            match byte {
                b'\r' => Ok(TrailerLf),
                _ => Ok(Trailer),
            }
        }
        TrailerLf => match byte {
            b'\n' => {
                *trailer_lines += 1;
                if *trailer_lines >= TRAILER_LINE_LIMIT {
                    invalid("chunk trailers over line limit")
                } else {
                    Ok(EndCr)
                }
            }
            _ => invalid("invalid trailer end LF"),
        },
        EndCr => match byte {
            b'\r' => Ok(EndLf),
            _ => {
                *trailer_bytes += 1;
                Ok(Trailer)
            }
        },
        EndLf => match byte {
            b'\n' => Ok(End),
            _ => invalid("invalid chunk end LF"),
        },
        End => Ok(End),
    }
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte + 10 - b'a'),
        b'A'..=b'F' => Some(byte + 10 - b'A'),
        _ => None,
    }
}
