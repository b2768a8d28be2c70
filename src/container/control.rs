//! Container-side control channel: listener, frame dispatch, heartbeats.
//!
//! The edge dials in; the newest connection always wins. While a
//! connection is up the container sends a heartbeat every ten seconds
//! and forwards allocation requests from the pool. Any read or write
//! failure tears the connection down — never the process — and the
//! listener keeps accepting.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, MissedTickBehavior};

use super::pool::ChannelPool;
use crate::protocol::{encode_frame, unix_millis, ControlMessage, FrameBuffer};

pub(crate) const HEARTBEAT_PERIOD: Duration = Duration::from_secs(10);

const OUTBOUND_DEPTH: usize = 64;

pub(crate) async fn run_control_listener(
    pool: Arc<ChannelPool>,
    listener: TcpListener,
    connected: watch::Sender<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut replacement: Option<TcpStream> = None;
    loop {
        let stream = match replacement.take() {
            Some(stream) => stream,
            None => tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::info!(%peer, "control channel connected");
                        stream
                    }
                    Err(err) => {
                        tracing::warn!(%err, "control accept failed");
                        time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            },
        };

        connected.send_replace(true);
        replacement = serve_control(stream, &pool, &listener, &mut shutdown).await;
        connected.send_replace(false);
        pool.set_control(None);
        pool.fail_pending();

        if *shutdown.borrow() {
            return;
        }
    }
}

/// Serves one control connection until it dies, a replacement arrives
/// (returned for the outer loop), or shutdown.
async fn serve_control(
    stream: TcpStream,
    pool: &Arc<ChannelPool>,
    listener: &TcpListener,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<TcpStream> {
    let (mut read, mut write) = stream.into_split();
    let (tx, mut outbound) = mpsc::channel(OUTBOUND_DEPTH);
    pool.set_control(Some(tx));

    let mut frames = FrameBuffer::new();
    let mut heartbeat = time::interval(HEARTBEAT_PERIOD);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return None;
                }
            }
            _ = heartbeat.tick() => {
                let frame = encode_frame(&ControlMessage::Heartbeat { timestamp: unix_millis() });
                if let Err(err) = write.write_all(&frame).await {
                    tracing::debug!(%err, "heartbeat write failed");
                    return None;
                }
            }
            Some(msg) = outbound.recv() => {
                let frame = encode_frame(&msg);
                if let Err(err) = write.write_all(&frame).await {
                    tracing::debug!(%err, "control write failed");
                    return None;
                }
            }
            accepted = listener.accept() => {
                if let Ok((stream, peer)) = accepted {
                    tracing::info!(%peer, "control channel replaced by newer connection");
                    return Some(stream);
                }
            }
            result = read.read_buf(frames.read_buf()) => match result {
                Ok(0) => {
                    tracing::info!("control channel closed by peer");
                    return None;
                }
                Ok(_) => {
                    if dispatch_frames(&mut frames, pool).is_err() {
                        return None;
                    }
                }
                Err(err) => {
                    tracing::debug!(%err, "control read failed");
                    return None;
                }
            },
        }
    }
}

/// Drains complete frames. Unparseable frames are dropped without
/// touching any state; an unrecoverable framing error closes the
/// connection.
fn dispatch_frames(frames: &mut FrameBuffer, pool: &ChannelPool) -> crate::Result<()> {
    loop {
        let frame = match frames.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(err) => {
                tracing::error!(%err, "unrecoverable framing error; closing control channel");
                return Err(err);
            }
        };
        match ControlMessage::decode(&frame) {
            Err(err) => tracing::warn!(%err, "dropping unparseable control frame"),
            Ok(ControlMessage::ChannelAllocated { request_id, port }) => {
                pool.resolve_allocated(&request_id, port);
            }
            Ok(ControlMessage::Error {
                request_id,
                message,
            }) => {
                tracing::warn!(%request_id, %message, "edge reported allocation error");
                pool.resolve_error(&request_id, message);
            }
            Ok(ControlMessage::ChannelReleased { port }) => {
                tracing::debug!(port, "peer considers channel released");
            }
            Ok(ControlMessage::Heartbeat { .. }) => {
                tracing::trace!("ignoring heartbeat from edge");
            }
            Ok(ControlMessage::AllocateChannel { request_id, .. }) => {
                tracing::warn!(%request_id, "edge sent AllocateChannel; ignoring");
            }
        }
    }
}
