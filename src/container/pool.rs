//! The channel pool and allocation state machine.
//!
//! Slots live in a fixed array indexed by `port - D1`. `in_use` guards
//! the handler slot: it is set by [`ChannelPool::allocate`] and cleared
//! when the [`ChannelLease`] completes or drops. Ownership of the
//! underlying connection moves into exactly one handler at a time, so no
//! two tasks ever touch the same socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{self, Duration, Instant};
use uuid::Uuid;

use super::channel::DataConn;
use crate::error::Error;
use crate::protocol::ControlMessage;

/// How long an allocation may wait for the peer to open the channel.
pub(crate) const ALLOCATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
struct Slot {
    in_use: bool,
    conn: Option<DataConn>,
    /// Identifies the currently-attached socket so a late reader-task
    /// exit cannot clear a newer connection.
    generation: u64,
}

#[derive(Debug)]
pub(crate) struct ChannelPool {
    base_port: u16,
    slots: Vec<Mutex<Slot>>,
    arrivals: Vec<Notify>,
    generations: AtomicU64,
    pending: Mutex<HashMap<String, oneshot::Sender<crate::Result<u16>>>>,
    control: Mutex<Option<mpsc::Sender<ControlMessage>>>,
}

impl ChannelPool {
    pub(crate) fn new(base_port: u16, count: usize) -> ChannelPool {
        ChannelPool {
            base_port,
            slots: (0..count).map(|_| Mutex::new(Slot::default())).collect(),
            arrivals: (0..count).map(|_| Notify::new()).collect(),
            generations: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            control: Mutex::new(None),
        }
    }

    pub(crate) fn channel_count(&self) -> usize {
        self.slots.len()
    }

    /// Installs (or clears) the control-channel sender used to request
    /// fresh allocations from the edge.
    pub(crate) fn set_control(&self, sender: Option<mpsc::Sender<ControlMessage>>) {
        *self.control.lock().unwrap() = sender;
    }

    /// Parks a freshly accepted connection in its slot and wakes any
    /// allocation waiting for it. The newest connection always wins.
    pub(crate) fn attach(&self, index: usize, conn: DataConn) -> u64 {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        {
            let mut slot = self.slots[index].lock().unwrap();
            slot.conn = Some(conn);
            slot.generation = generation;
        }
        self.arrivals[index].notify_waiters();
        generation
    }

    /// Called by a reader task when its socket closes. Clears the parked
    /// connection if it is still the one that closed; an active lease's
    /// `in_use` is left for the lease teardown to reset.
    pub(crate) fn socket_closed(&self, index: usize, generation: u64) {
        let mut slot = self.slots[index].lock().unwrap();
        if slot.generation == generation {
            slot.conn = None;
        }
    }

    /// Reserves one free channel and hands out its connection.
    ///
    /// Keep-alive reuse resolves immediately; otherwise an
    /// `AllocateChannel` goes out on the control channel and the call
    /// waits (bounded by [`ALLOCATION_TIMEOUT`]) for the edge to confirm
    /// and connect.
    pub(crate) async fn allocate(self: &Arc<Self>) -> crate::Result<(ChannelLease, DataConn)> {
        let index = self.try_reserve().ok_or_else(Error::new_saturated)?;
        let port = self.base_port + index as u16;

        if let Some(conn) = self.take_parked(index) {
            tracing::trace!(port, "reusing keep-alive data channel");
            return Ok((self.lease(index, port), conn));
        }

        match self.allocate_fresh(index, port).await {
            Ok(conn) => Ok((self.lease(index, port), conn)),
            Err(err) => {
                self.clear_in_use(index);
                Err(err)
            }
        }
    }

    async fn allocate_fresh(self: &Arc<Self>, index: usize, port: u16) -> crate::Result<DataConn> {
        let sender = self
            .control
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(Error::new_control_channel_down)?;

        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(request_id.clone(), tx);

        let deadline = Instant::now() + ALLOCATION_TIMEOUT;
        tracing::debug!(%request_id, port, "requesting channel allocation");
        if sender
            .send(ControlMessage::AllocateChannel {
                request_id: request_id.clone(),
                port,
            })
            .await
            .is_err()
        {
            self.pending.lock().unwrap().remove(&request_id);
            return Err(Error::new_control_channel_down());
        }

        let resolved = match time::timeout_at(deadline, rx).await {
            Err(_) => {
                self.pending.lock().unwrap().remove(&request_id);
                tracing::warn!(%request_id, port, "channel allocation timed out");
                return Err(Error::new_allocation_timeout());
            }
            // the pending entry was dropped, which only happens on
            // control-channel teardown
            Ok(Err(_)) => return Err(Error::new_control_channel_down()),
            Ok(Ok(result)) => result?,
        };
        debug_assert_eq!(resolved, port);

        // The confirmation races the TCP accept; wait for the socket.
        loop {
            let notified = self.arrivals[index].notified();
            if let Some(conn) = self.take_parked(index) {
                return Ok(conn);
            }
            if time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::new_allocation_timeout());
            }
        }
    }

    fn lease(self: &Arc<Self>, index: usize, port: u16) -> ChannelLease {
        ChannelLease {
            pool: self.clone(),
            index,
            port,
            done: false,
        }
    }

    fn try_reserve(&self) -> Option<usize> {
        for (index, slot) in self.slots.iter().enumerate() {
            let mut slot = slot.lock().unwrap();
            if !slot.in_use {
                slot.in_use = true;
                return Some(index);
            }
        }
        None
    }

    /// Takes the parked connection, discarding any stale bytes that
    /// arrived while it was idle. A connection whose reader task is gone
    /// is dead and is dropped here.
    fn take_parked(&self, index: usize) -> Option<DataConn> {
        let mut conn = self.slots[index].lock().unwrap().conn.take()?;
        loop {
            match conn.rx.try_recv() {
                Ok(stale) => {
                    tracing::debug!(len = stale.len(), "discarding stale bytes on idle channel");
                }
                Err(TryRecvError::Empty) => return Some(conn),
                Err(TryRecvError::Disconnected) => return None,
            }
        }
    }

    fn park(&self, index: usize, conn: DataConn) {
        let mut slot = self.slots[index].lock().unwrap();
        // if the listener already replaced the socket, ours is stale
        if slot.conn.is_none() {
            slot.conn = Some(conn);
        }
    }

    fn clear_in_use(&self, index: usize) {
        self.slots[index].lock().unwrap().in_use = false;
    }

    /// Resolution path for `ChannelAllocated`. A missing entry means the
    /// allocation already timed out; the confirmation is dropped.
    pub(crate) fn resolve_allocated(&self, request_id: &str, port: u16) {
        match self.pending.lock().unwrap().remove(request_id) {
            Some(tx) => {
                let _ = tx.send(Ok(port));
            }
            None => tracing::debug!(%request_id, port, "late allocation confirmation dropped"),
        }
    }

    /// Resolution path for a peer `Error` message.
    pub(crate) fn resolve_error(&self, request_id: &str, message: String) {
        match self.pending.lock().unwrap().remove(request_id) {
            Some(tx) => {
                let _ = tx.send(Err(Error::new_allocation_refused(message)));
            }
            None => tracing::debug!(%request_id, "error for unknown allocation dropped"),
        }
    }

    /// Fails every pending allocation; used on control-channel teardown.
    pub(crate) fn fail_pending(&self) {
        let drained: Vec<_> = self.pending.lock().unwrap().drain().collect();
        for (request_id, tx) in drained {
            tracing::debug!(%request_id, "failing pending allocation: control channel down");
            let _ = tx.send(Err(Error::new_control_channel_down()));
        }
    }

    #[cfg(test)]
    pub(crate) fn in_use_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.lock().unwrap().in_use)
            .count()
    }
}

/// Guard for one reserved channel. Completing an exchange checks the
/// connection back in for keep-alive reuse; dropping the lease on an
/// error path leaves the connection closed and just frees the slot.
#[derive(Debug)]
pub(crate) struct ChannelLease {
    pool: Arc<ChannelPool>,
    index: usize,
    port: u16,
    done: bool,
}

impl ChannelLease {
    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    /// Parks the connection for reuse and frees the slot.
    pub(crate) fn checkin(mut self, conn: DataConn) {
        self.pool.park(self.index, conn);
        self.pool.clear_in_use(self.index);
        self.done = true;
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        if !self.done {
            self.pool.clear_in_use(self.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    async fn conn_pair() -> (DataConn, tokio::net::TcpStream, mpsc::Sender<Bytes>) {
        // a real socket pair for the write half; the pipe is driven by hand
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (_read, write) = server.into_split();
        let (tx, rx) = mpsc::channel(4);
        (DataConn { write, rx }, client, tx)
    }

    #[tokio::test]
    async fn saturation_rejects_before_any_waiting() {
        let pool = Arc::new(ChannelPool::new(9001, 1));
        let (conn, _client, _tx) = conn_pair().await;
        pool.attach(0, conn);

        let (lease, _conn) = pool.allocate().await.unwrap();
        let err = pool.allocate().await.unwrap_err();
        assert!(err.is_saturated());
        drop(lease);
        // slot is free again (connection was dropped, not parked)
        assert_eq!(pool.in_use_count(), 0);
    }

    #[tokio::test]
    async fn allocation_without_control_channel_fails_fast() {
        let pool = Arc::new(ChannelPool::new(9001, 1));
        let err = pool.allocate().await.unwrap_err();
        assert!(err.is_control_channel_down());
        assert_eq!(pool.in_use_count(), 0);
    }

    #[tokio::test]
    async fn keep_alive_reuse_skips_the_control_channel() {
        // no control channel installed at all: a parked socket must
        // still satisfy the allocation immediately
        let pool = Arc::new(ChannelPool::new(9001, 1));
        let (conn, _client, _tx) = conn_pair().await;
        pool.attach(0, conn);

        let (lease, conn) = pool.allocate().await.unwrap();
        assert_eq!(lease.port(), 9001);
        lease.checkin(conn);
        assert_eq!(pool.in_use_count(), 0);

        // and the parked connection survives for the next request
        let (lease, conn) = pool.allocate().await.unwrap();
        lease.checkin(conn);
    }

    #[tokio::test]
    async fn fresh_allocation_times_out_and_frees_the_slot() {
        tokio::time::pause();
        let pool = Arc::new(ChannelPool::new(9001, 1));
        let (tx, mut control_rx) = mpsc::channel(4);
        pool.set_control(Some(tx));

        let pool2 = pool.clone();
        let alloc = tokio::spawn(async move { pool2.allocate().await.map(|(l, c)| (l.port(), c)) });

        // the AllocateChannel request goes out...
        let msg = control_rx.recv().await.unwrap();
        assert!(matches!(msg, ControlMessage::AllocateChannel { port: 9001, .. }));

        // ...but nothing ever answers
        tokio::time::advance(ALLOCATION_TIMEOUT + Duration::from_millis(10)).await;
        let err = alloc.await.unwrap().unwrap_err();
        assert!(err.is_allocation_timeout());
        assert_eq!(pool.in_use_count(), 0);
    }

    #[tokio::test]
    async fn confirmation_then_socket_arrival_resolves() {
        let pool = Arc::new(ChannelPool::new(9001, 1));
        let (tx, mut control_rx) = mpsc::channel(4);
        pool.set_control(Some(tx));

        let pool2 = pool.clone();
        let alloc = tokio::spawn(async move { pool2.allocate().await.map(|(l, c)| (l, c)) });

        let request_id = match control_rx.recv().await.unwrap() {
            ControlMessage::AllocateChannel { request_id, port } => {
                assert_eq!(port, 9001);
                request_id
            }
            other => panic!("unexpected {:?}", other),
        };

        // confirm first, then let the socket land
        pool.resolve_allocated(&request_id, 9001);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (conn, _client, _tx2) = conn_pair().await;
        pool.attach(0, conn);

        let (lease, conn) = alloc.await.unwrap().unwrap();
        assert_eq!(lease.port(), 9001);
        lease.checkin(conn);
    }

    #[tokio::test]
    async fn peer_error_refuses_the_allocation() {
        let pool = Arc::new(ChannelPool::new(9001, 1));
        let (tx, mut control_rx) = mpsc::channel(4);
        pool.set_control(Some(tx));

        let pool2 = pool.clone();
        let alloc = tokio::spawn(async move { pool2.allocate().await.map(|(l, _)| l.port()) });

        let request_id = match control_rx.recv().await.unwrap() {
            ControlMessage::AllocateChannel { request_id, .. } => request_id,
            other => panic!("unexpected {:?}", other),
        };
        pool.resolve_error(&request_id, "Requested channel already in use".to_owned());

        let err = alloc.await.unwrap().unwrap_err();
        assert!(!err.is_saturated());
        assert_eq!(pool.in_use_count(), 0);
    }

    #[tokio::test]
    async fn stale_bytes_are_discarded_at_checkout() {
        let pool = Arc::new(ChannelPool::new(9001, 1));
        let (conn, _client, tx) = conn_pair().await;
        pool.attach(0, conn);
        tx.try_send(Bytes::from_static(b"junk from an old exchange"))
            .unwrap();

        let (lease, mut conn) = pool.allocate().await.unwrap();
        assert!(matches!(conn.rx.try_recv(), Err(TryRecvError::Empty)));
        lease.checkin(conn);
    }

    #[tokio::test]
    async fn dead_parked_connection_falls_through_to_fresh_allocation() {
        let pool = Arc::new(ChannelPool::new(9001, 1));
        let (conn, _client, tx) = conn_pair().await;
        pool.attach(0, conn);
        drop(tx); // reader task gone: the parked connection is dead

        let err = pool.allocate().await.unwrap_err();
        // fell through to the fresh path, which has no control channel
        assert!(err.is_control_channel_down());
    }
}
