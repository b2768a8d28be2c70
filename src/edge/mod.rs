//! The edge-side peer: control client, data-channel service loops, and
//! the reconnection supervisor.

mod control;
mod data;
mod supervisor;

pub use self::supervisor::SupervisorHandle;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time;

use crate::config::Config;
use crate::store::adapter::StoreAdapter;

/// Container lifecycle as observed by the edge. The supervisor only
/// connects while the container is `Running` and exits permanently once
/// it is `Stopping` or `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// How the edge reaches the container side.
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub container_host: String,
    pub control_port: u16,
    pub data_port_base: u16,
    pub data_channels: u16,
}

impl EdgeConfig {
    pub fn from_config(config: &Config) -> EdgeConfig {
        EdgeConfig {
            container_host: config.container_host.clone(),
            control_port: config.control_port,
            data_port_base: config.data_port_base,
            data_channels: config.data_channels,
        }
    }
}

/// The external peer holding the business capability.
///
/// One `EdgeSide` is keyed to one container identity: on container
/// replacement, drop it and create a fresh one rather than reusing the
/// supervisor.
pub struct EdgeSide {
    config: EdgeConfig,
    adapter: Arc<StoreAdapter>,
    status: watch::Receiver<ContainerStatus>,
    stop: watch::Sender<bool>,
    slots: Vec<AtomicBool>,
    supervisor: Mutex<Option<SupervisorHandle>>,
}

impl fmt::Debug for EdgeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdgeSide")
            .field("config", &self.config)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl EdgeSide {
    pub fn new(
        config: EdgeConfig,
        adapter: StoreAdapter,
        status: watch::Receiver<ContainerStatus>,
    ) -> EdgeSide {
        let slots = (0..config.data_channels).map(|_| AtomicBool::new(false)).collect();
        let (stop, _) = watch::channel(false);
        EdgeSide {
            config,
            adapter: Arc::new(adapter),
            status,
            stop,
            slots,
            supervisor: Mutex::new(None),
        }
    }

    /// Requests a permanent stop; the supervisor drains and exits.
    pub fn request_stop(&self) {
        // send_replace: the flag must stick even with no subscriber yet
        self.stop.send_replace(true);
    }

    pub(crate) fn config(&self) -> &EdgeConfig {
        &self.config
    }

    pub(crate) fn adapter(&self) -> Arc<StoreAdapter> {
        self.adapter.clone()
    }

    pub(crate) fn status(&self) -> ContainerStatus {
        *self.status.borrow()
    }

    pub(crate) fn status_watch(&self) -> watch::Receiver<ContainerStatus> {
        self.status.clone()
    }

    pub(crate) fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    pub(crate) fn stop_watch(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    /// Claims one data-channel slot; false if it is already in use.
    pub(crate) fn try_claim(&self, index: usize) -> bool {
        !self.slots[index].swap(true, Ordering::SeqCst)
    }

    pub(crate) fn release(&self, index: usize) {
        self.slots[index].store(false, Ordering::SeqCst);
    }

    /// Maps a data port to its slot index, if it is one of ours.
    pub(crate) fn slot_index(&self, port: u16) -> Option<usize> {
        let index = port.checked_sub(self.config.data_port_base)? as usize;
        (index < self.slots.len()).then_some(index)
    }

    /// Sleeps, returning early (true) when a stop is requested.
    pub(crate) async fn sleep_or_stop(&self, delay: Duration) -> bool {
        let mut stop = self.stop.subscribe();
        if *stop.borrow() {
            return true;
        }
        let sleep = time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return self.stop_requested(),
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return true;
                    }
                }
            }
        }
    }
}
