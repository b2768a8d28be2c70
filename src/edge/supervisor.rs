//! The reconnection supervisor.
//!
//! One long-running task per `EdgeSide` maintains the control channel:
//! `Disconnected → Connecting → Connected → Disconnected`, forever,
//! until a stop is requested or the container leaves `Running` for good.
//! A second spawn returns the existing handle instead of starting a
//! competing loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::{control, ContainerStatus, EdgeSide};

/// Reconnect delay after a clean connection end.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Reconnect delay after a connection error (or exhausted connect
/// attempts).
const RECONNECT_DELAY_AFTER_ERROR: Duration = Duration::from_secs(5);

/// Awaitable handle to a running supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    done: watch::Receiver<bool>,
}

impl SupervisorHandle {
    /// Resolves once the supervisor has exited permanently.
    pub async fn wait(mut self) {
        while !*self.done.borrow() {
            if self.done.changed().await.is_err() {
                return;
            }
        }
    }

    /// Whether the supervisor has already exited.
    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }
}

impl EdgeSide {
    /// Starts the supervisor task, or returns the handle of the one
    /// already running.
    pub fn spawn_supervisor(self: &Arc<Self>) -> SupervisorHandle {
        let mut guard = self.supervisor.lock().unwrap();
        if let Some(handle) = guard.as_ref() {
            tracing::debug!("supervisor already running; returning existing handle");
            return handle.clone();
        }
        let (done_tx, done_rx) = watch::channel(false);
        let handle = SupervisorHandle { done: done_rx };
        *guard = Some(handle.clone());
        tokio::spawn(run_supervisor(self.clone(), done_tx));
        handle
    }
}

async fn run_supervisor(edge: Arc<EdgeSide>, done: watch::Sender<bool>) {
    tracing::info!("supervisor started");
    let mut status = edge.status_watch();
    loop {
        if edge.stop_requested() {
            break;
        }
        let current = *status.borrow();
        match current {
            ContainerStatus::Stopping | ContainerStatus::Stopped => break,
            ContainerStatus::Starting => {
                // not running yet; wait for the next transition
                let mut stop = edge.stop_watch();
                tokio::select! {
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = stop.changed() => {}
                }
                continue;
            }
            ContainerStatus::Running => {}
        }

        tracing::debug!("supervisor connecting");
        let stream = match control::connect_with_backoff(&edge).await {
            Some(stream) => stream,
            None => {
                if edge.stop_requested()
                    || matches!(
                        *status.borrow(),
                        ContainerStatus::Stopping | ContainerStatus::Stopped
                    )
                {
                    break;
                }
                if edge.sleep_or_stop(RECONNECT_DELAY_AFTER_ERROR).await {
                    break;
                }
                continue;
            }
        };

        let delay = match control::run_control_connection(&edge, stream).await {
            Ok(()) => {
                tracing::info!("control connection ended");
                RECONNECT_DELAY
            }
            Err(err) => {
                tracing::warn!(%err, "control connection failed");
                RECONNECT_DELAY_AFTER_ERROR
            }
        };

        if edge.sleep_or_stop(delay).await {
            break;
        }
    }
    tracing::info!("supervisor stopped");
    let _ = done.send(true);
}
