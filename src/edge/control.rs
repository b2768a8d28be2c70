//! Edge-side control-channel client.
//!
//! The edge dials the container's control port, reads framed control
//! messages, and reacts to `AllocateChannel` by opening the requested
//! data connection. A watchdog force-closes the connection when the
//! container's heartbeats stop; liveness lives entirely on this channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};

use super::{data, ContainerStatus, EdgeSide};
use crate::error::Error;
use crate::protocol::{encode_frame, ControlMessage, FrameBuffer};

/// Control connect retry ladder, milliseconds.
pub(crate) const CONTROL_BACKOFF_MS: [u64; 10] =
    [500, 1000, 2000, 3000, 5000, 5000, 5000, 5000, 5000, 5000];

/// Data connect retry ladder; far below the allocation timeout.
const DATA_BACKOFF_MS: [u64; 3] = [100, 250, 500];

/// The watchdog trips when heartbeats have been silent this long...
const HEARTBEAT_GRACE: Duration = Duration::from_millis(20_000);
/// ...but only after the channel has been up this long.
const WATCHDOG_WARMUP: Duration = Duration::from_millis(10_000);
const WATCHDOG_PERIOD: Duration = Duration::from_secs(5);

const OUTBOUND_DEPTH: usize = 64;

/// Dials the control port with backoff. `None` when the attempts are
/// exhausted or the container stopped being `Running` mid-retry.
pub(crate) async fn connect_with_backoff(edge: &Arc<EdgeSide>) -> Option<TcpStream> {
    let addr = (
        edge.config().container_host.clone(),
        edge.config().control_port,
    );
    for (attempt, delay) in CONTROL_BACKOFF_MS.iter().enumerate() {
        if edge.stop_requested() || edge.status() != ContainerStatus::Running {
            return None;
        }
        match TcpStream::connect(addr.clone()).await {
            Ok(stream) => {
                tracing::info!(attempt, "control channel established");
                return Some(stream);
            }
            Err(err) => {
                tracing::debug!(attempt, %err, "control connect failed");
            }
        }
        if edge.sleep_or_stop(Duration::from_millis(*delay)).await {
            return None;
        }
    }
    tracing::warn!("control connect attempts exhausted");
    None
}

/// Serves one control connection to completion.
///
/// `Ok(())` is a clean end (peer closed, or stop requested); any error
/// is a failed connection and the supervisor backs off longer.
pub(crate) async fn run_control_connection(
    edge: &Arc<EdgeSide>,
    stream: TcpStream,
) -> crate::Result<()> {
    let (mut read, mut write) = stream.into_split();
    let (reply_tx, mut outbound) = mpsc::channel::<ControlMessage>(OUTBOUND_DEPTH);
    let mut frames = FrameBuffer::new();

    let connected_at = Instant::now();
    let mut last_heartbeat = Instant::now();
    let mut watchdog = time::interval(WATCHDOG_PERIOD);
    watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut stop = edge.stop_watch();
    let mut status = edge.status_watch();

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    return Ok(());
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    // the status feed is gone; the container identity is
                    // being torn down
                    return Ok(());
                }
                match *status.borrow() {
                    ContainerStatus::Stopping | ContainerStatus::Stopped => return Ok(()),
                    _ => {}
                }
            }
            _ = watchdog.tick() => {
                if last_heartbeat.elapsed() > HEARTBEAT_GRACE
                    && connected_at.elapsed() > WATCHDOG_WARMUP
                {
                    tracing::warn!(
                        silent_for = ?last_heartbeat.elapsed(),
                        "heartbeat watchdog tripped; closing control channel"
                    );
                    return Err(Error::new_control_channel_down());
                }
            }
            Some(msg) = outbound.recv() => {
                let frame = encode_frame(&msg);
                write.write_all(&frame).await.map_err(Error::new_io)?;
            }
            result = read.read_buf(frames.read_buf()) => match result {
                Ok(0) => {
                    tracing::info!("control channel closed by container");
                    return Ok(());
                }
                Ok(_) => {
                    dispatch_frames(edge, &reply_tx, &mut frames, &mut last_heartbeat)?;
                }
                Err(err) => return Err(Error::new_io(err)),
            },
        }
    }
}

fn dispatch_frames(
    edge: &Arc<EdgeSide>,
    reply_tx: &mpsc::Sender<ControlMessage>,
    frames: &mut FrameBuffer,
    last_heartbeat: &mut Instant,
) -> crate::Result<()> {
    loop {
        let frame = match frames.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(err) => {
                tracing::error!(%err, "unrecoverable framing error on control channel");
                return Err(err);
            }
        };
        match ControlMessage::decode(&frame) {
            Err(err) => tracing::warn!(%err, "dropping unparseable control frame"),
            Ok(ControlMessage::Heartbeat { timestamp }) => {
                tracing::trace!(timestamp, "heartbeat");
                *last_heartbeat = Instant::now();
            }
            Ok(ControlMessage::AllocateChannel { request_id, port }) => {
                handle_allocate(edge, reply_tx, request_id, port);
            }
            Ok(ControlMessage::ChannelReleased { port }) => {
                tracing::debug!(port, "peer considers channel released");
            }
            Ok(ControlMessage::ChannelAllocated { request_id, .. }) => {
                tracing::warn!(%request_id, "container sent ChannelAllocated; ignoring");
            }
            Ok(ControlMessage::Error { request_id, message }) => {
                tracing::warn!(%request_id, %message, "container reported error");
            }
        }
    }
}

/// Reacts to one allocation request: claim the slot, connect to the data
/// port, confirm, then serve the channel until it closes.
fn handle_allocate(
    edge: &Arc<EdgeSide>,
    reply_tx: &mpsc::Sender<ControlMessage>,
    request_id: String,
    port: u16,
) {
    let index = match edge.slot_index(port) {
        Some(index) => index,
        None => {
            tracing::warn!(port, "allocation for unknown data port");
            send_error(reply_tx, request_id, "Requested channel not found");
            return;
        }
    };
    if !edge.try_claim(index) {
        send_error(reply_tx, request_id, "Requested channel already in use");
        return;
    }

    let edge = edge.clone();
    let reply_tx = reply_tx.clone();
    tokio::spawn(async move {
        match connect_data(&edge, port).await {
            Some(stream) => {
                let _ = reply_tx
                    .send(ControlMessage::ChannelAllocated {
                        request_id,
                        port,
                    })
                    .await;
                if let Err(err) = data::serve_data_channel(edge.adapter(), stream).await {
                    tracing::debug!(port, %err, "data channel ended with error");
                }
            }
            None => {
                send_error(&reply_tx, request_id, "Failed to connect to data channel");
            }
        }
        edge.release(index);
        tracing::debug!(port, "data channel slot released");
    });
}

async fn connect_data(edge: &Arc<EdgeSide>, port: u16) -> Option<TcpStream> {
    let addr = (edge.config().container_host.clone(), port);
    for delay in DATA_BACKOFF_MS {
        if edge.stop_requested() || edge.status() != ContainerStatus::Running {
            return None;
        }
        match TcpStream::connect(addr.clone()).await {
            Ok(stream) => return Some(stream),
            Err(err) => tracing::debug!(port, %err, "data connect failed"),
        }
        time::sleep(Duration::from_millis(delay)).await;
    }
    None
}

fn send_error(reply_tx: &mpsc::Sender<ControlMessage>, request_id: String, message: &str) {
    let message = message.to_owned();
    let reply_tx = reply_tx.clone();
    let msg = ControlMessage::Error {
        request_id,
        message,
    };
    tokio::spawn(async move {
        let _ = reply_tx.send(msg).await;
    });
}
