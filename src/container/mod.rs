//! The container-side peer: ingress, control listener, data channels.

mod channel;
mod control;
mod ingress;
mod pool;

pub use self::ingress::IngressCounters;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;

use self::pool::ChannelPool;
use crate::config::Config;
use crate::error::Error;

/// The peer running inside the container.
///
/// Binds all listeners up front so the well-known port layout is claimed
/// before the edge starts dialing, then serves until shutdown.
///
/// ```no_run
/// # async fn run() -> warren::Result<()> {
/// let config = warren::config::Config::from_env();
/// let container = warren::container::ContainerSide::bind(&config).await?;
/// let handle = container.handle();
/// tokio::spawn(container.run());
/// # let _ = handle;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ContainerSide {
    ingress: TcpListener,
    ingress_addr: SocketAddr,
    control: TcpListener,
    data: Vec<TcpListener>,
    pool: Arc<ChannelPool>,
    counters: Arc<IngressCounters>,
    connected_tx: watch::Sender<bool>,
    connected_rx: watch::Receiver<bool>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Cheap clone handle for observing and stopping a running container
/// side.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    shutdown: Arc<watch::Sender<bool>>,
    connected: watch::Receiver<bool>,
    counters: Arc<IngressCounters>,
}

impl ContainerSide {
    /// Binds the ingress, control, and data listeners.
    pub async fn bind(config: &Config) -> crate::Result<ContainerSide> {
        let ingress = TcpListener::bind((config.bind_addr, config.ingress_port))
            .await
            .map_err(Error::new_listen)?;
        let ingress_addr = ingress.local_addr().map_err(Error::new_listen)?;
        let control = TcpListener::bind((config.bind_addr, config.control_port))
            .await
            .map_err(Error::new_listen)?;
        let mut data = Vec::with_capacity(config.data_channels as usize);
        for port in config.data_ports() {
            data.push(
                TcpListener::bind((config.bind_addr, port))
                    .await
                    .map_err(Error::new_listen)?,
            );
        }

        let pool = Arc::new(ChannelPool::new(
            config.data_port_base,
            config.data_channels as usize,
        ));
        let (connected_tx, connected_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tracing::info!(
            ingress = %ingress_addr,
            control = config.control_port,
            data = ?(config.data_port_base..=config.data_port_end()),
            "container side bound"
        );

        Ok(ContainerSide {
            ingress,
            ingress_addr,
            control,
            data,
            pool,
            counters: Arc::new(IngressCounters::default()),
            connected_tx,
            connected_rx,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }

    /// Address of the bound ingress listener (useful with port 0).
    pub fn ingress_addr(&self) -> SocketAddr {
        self.ingress_addr
    }

    /// Number of data channels in the pool.
    pub fn data_channel_count(&self) -> usize {
        self.pool.channel_count()
    }

    pub fn handle(&self) -> ContainerHandle {
        ContainerHandle {
            shutdown: self.shutdown_tx.clone(),
            connected: self.connected_rx.clone(),
            counters: self.counters.clone(),
        }
    }

    /// Serves until [`ContainerHandle::shutdown`] is called. The control
    /// and data listeners run on their own tasks; the ingress accept
    /// loop runs here.
    pub async fn run(self) {
        let ContainerSide {
            ingress,
            control,
            data,
            pool,
            counters,
            connected_tx,
            connected_rx,
            shutdown_tx,
            shutdown_rx,
            ..
        } = self;
        // the shutdown channel must outlive the accept loops even if no
        // handle was taken
        let _shutdown_tx = shutdown_tx;

        tokio::spawn(control::run_control_listener(
            pool.clone(),
            control,
            connected_tx,
            shutdown_rx.clone(),
        ));
        for (index, listener) in data.into_iter().enumerate() {
            tokio::spawn(channel::run_data_listener(
                pool.clone(),
                listener,
                index,
                shutdown_rx.clone(),
            ));
        }

        ingress::run_ingress(ingress, pool, connected_rx, counters, shutdown_rx).await;
        tracing::info!("container side stopped");
    }
}

impl ContainerHandle {
    /// Stops the accept loops; in-flight exchanges finish on their own
    /// tasks.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Whether the control channel is currently connected.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Watch the control-channel connection state.
    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    pub fn counters(&self) -> &IngressCounters {
        &self.counters
    }
}
