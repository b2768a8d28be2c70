//! The framed control protocol spoken on the control channel.
//!
//! Messages are UTF-8 JSON, tagged by a `type` field, and framed on the
//! wire as `[u32 little-endian length][json bytes]`. The control channel
//! carries only allocation and liveness traffic; request and response
//! bytes never travel here.

mod framing;

pub use self::framing::{encode_frame, FrameBuffer, MAX_FRAME_LEN};

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A control-channel message.
///
/// The container side is the allocator: it picks a free data port and
/// sends [`AllocateChannel`](ControlMessage::AllocateChannel); the edge
/// side answers by opening a TCP connection to that port and confirming
/// with [`ChannelAllocated`](ControlMessage::ChannelAllocated).
/// [`ChannelReleased`](ControlMessage::ChannelReleased) is informational
/// and never required; neither peer sends it today.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Container → edge: open a data connection to `port` for this request.
    AllocateChannel { request_id: String, port: u16 },
    /// Edge → container: the data connection to `port` is open.
    ChannelAllocated { request_id: String, port: u16 },
    /// Informational: the sender considers the channel free again.
    ChannelReleased { port: u16 },
    /// The sender failed to allocate or handle `request_id`.
    Error { request_id: String, message: String },
    /// Container → edge: periodic liveness ping.
    Heartbeat { timestamp: u64 },
}

impl ControlMessage {
    /// Parses one JSON frame body.
    pub fn decode(frame: &[u8]) -> Result<ControlMessage, serde_json::Error> {
        serde_json::from_slice(frame)
    }
}

/// Milliseconds since the Unix epoch, as carried by `Heartbeat`.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
