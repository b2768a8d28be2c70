use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::ControlMessage;
use crate::error::Error;

/// Frames whose declared length exceeds this are treated as an
/// unrecoverable framing error and force-close the channel. The protocol
/// itself carries no bound; real control messages are tiny.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Serializes one message as `[u32 LE length][json]`.
pub fn encode_frame(msg: &ControlMessage) -> Bytes {
    // serde_json can only fail on non-string map keys or a failing
    // Write; neither applies to ControlMessage.
    let json = serde_json::to_vec(msg).expect("control message serializes");
    let mut frame = BytesMut::with_capacity(LEN_PREFIX + json.len());
    frame.put_u32_le(json.len() as u32);
    frame.put_slice(&json);
    frame.freeze()
}

/// Rolling receive buffer for length-prefixed frames.
///
/// Incoming bytes are appended as they arrive; [`next_frame`] is then
/// called repeatedly to drain as many complete frames as are present. A
/// partially-received frame stays buffered until the rest of it lands.
///
/// [`next_frame`]: FrameBuffer::next_frame
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> FrameBuffer {
        FrameBuffer {
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Appends newly received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Buffer to read into directly, avoiding a copy on the socket path.
    /// Capacity for the next read is reserved up front.
    pub(crate) fn read_buf(&mut self) -> &mut BytesMut {
        self.buf.reserve(4096);
        &mut self.buf
    }

    /// Extracts the next complete frame body, if one is buffered.
    ///
    /// Returns `Ok(None)` when fewer than `4 + len` bytes are available.
    /// A declared length over [`MAX_FRAME_LEN`] is unrecoverable: the
    /// buffer can never resynchronize, so the caller must drop the
    /// connection.
    pub fn next_frame(&mut self) -> crate::Result<Option<Bytes>> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let mut len_bytes = [0u8; LEN_PREFIX];
        len_bytes.copy_from_slice(&self.buf[..LEN_PREFIX]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::new_frame(format!(
                "frame length {} exceeds cap {}",
                len, MAX_FRAME_LEN
            )));
        }
        if self.buf.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        self.buf.advance(LEN_PREFIX);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_multiple_frames_from_one_arrival() {
        let a = encode_frame(&ControlMessage::Heartbeat { timestamp: 1 });
        let b = encode_frame(&ControlMessage::ChannelReleased { port: 9003 });

        let mut rx = FrameBuffer::new();
        let mut wire = Vec::new();
        wire.extend_from_slice(&a);
        wire.extend_from_slice(&b);
        rx.extend(&wire);

        let one = rx.next_frame().unwrap().unwrap();
        let two = rx.next_frame().unwrap().unwrap();
        assert_eq!(
            ControlMessage::decode(&one).unwrap(),
            ControlMessage::Heartbeat { timestamp: 1 }
        );
        assert_eq!(
            ControlMessage::decode(&two).unwrap(),
            ControlMessage::ChannelReleased { port: 9003 }
        );
        assert!(rx.next_frame().unwrap().is_none());
    }

    #[test]
    fn holds_partial_frame_across_arrivals() {
        let frame = encode_frame(&ControlMessage::AllocateChannel {
            request_id: "r".to_owned(),
            port: 9001,
        });
        let mut rx = FrameBuffer::new();

        // Length prefix split across two arrivals.
        rx.extend(&frame[..2]);
        assert!(rx.next_frame().unwrap().is_none());
        rx.extend(&frame[2..frame.len() - 1]);
        assert!(rx.next_frame().unwrap().is_none());
        rx.extend(&frame[frame.len() - 1..]);
        let body = rx.next_frame().unwrap().unwrap();
        assert!(ControlMessage::decode(&body).is_ok());
    }

    #[test]
    fn oversized_length_is_fatal() {
        let mut rx = FrameBuffer::new();
        let mut wire = Vec::new();
        wire.extend_from_slice(&(MAX_FRAME_LEN as u32 + 1).to_le_bytes());
        wire.extend_from_slice(b"x");
        rx.extend(&wire);
        assert!(rx.next_frame().is_err());
    }

    #[test]
    fn little_endian_prefix() {
        let frame = encode_frame(&ControlMessage::Heartbeat { timestamp: 0 });
        let body_len = frame.len() - 4;
        assert_eq!(
            u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize,
            body_len
        );
    }
}
