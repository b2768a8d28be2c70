//! Data-channel listeners and per-socket reader tasks.
//!
//! Each data port keeps its listener for the life of the process. When
//! the edge connects, the socket is split: the write half parks in the
//! pool slot, and a reader task pumps incoming bytes into a bounded pipe.
//! Whichever request handler holds the channel drains the pipe; while the
//! channel is idle, stray bytes just sit in it and are discarded at the
//! next checkout.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use super::pool::ChannelPool;

/// Bound on buffered-but-undrained reads per connection.
const PIPE_DEPTH: usize = 32;

const PIPE_READ_CHUNK: usize = 16 * 1024;

/// One accepted edge connection: the write half plus the pipe its
/// reader task feeds.
#[derive(Debug)]
pub(crate) struct DataConn {
    pub(crate) write: OwnedWriteHalf,
    pub(crate) rx: mpsc::Receiver<Bytes>,
}

/// Accept loop for one data port. The listener never closes on peer
/// errors; a newer connection simply replaces the parked one.
pub(crate) async fn run_data_listener(
    pool: Arc<ChannelPool>,
    listener: TcpListener,
    index: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, index, "data channel connected");
                    attach_stream(&pool, index, stream);
                }
                Err(err) => {
                    tracing::warn!(%err, index, "data accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
}

fn attach_stream(pool: &Arc<ChannelPool>, index: usize, stream: TcpStream) {
    let (mut read, write) = stream.into_split();
    let (tx, rx) = mpsc::channel(PIPE_DEPTH);
    let generation = pool.attach(index, DataConn { write, rx });

    let pool = pool.clone();
    tokio::spawn(async move {
        loop {
            let mut chunk = BytesMut::with_capacity(PIPE_READ_CHUNK);
            match read.read_buf(&mut chunk).await {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(chunk.freeze()).await.is_err() {
                        // receiver side dropped the connection
                        break;
                    }
                }
                Err(err) => {
                    tracing::debug!(%err, index, "data socket read failed");
                    break;
                }
            }
        }
        pool.socket_closed(index, generation);
    });
}
