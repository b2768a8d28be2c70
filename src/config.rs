//! Runtime configuration for both fabric peers.
//!
//! Every knob has a default that matches the well-known port layout the
//! two peers agree on, and every knob can be overridden from the
//! environment (`WARREN_*`). Ports must be laid out so that the data
//! ports form one contiguous run starting at `data_port_base`.

use std::env;
use std::net::{IpAddr, Ipv4Addr};

/// Default local ingress port (`H`).
pub const DEFAULT_INGRESS_PORT: u16 = 8080;
/// Default control-channel port (`C`).
pub const DEFAULT_CONTROL_PORT: u16 = 9000;
/// Default first data-channel port (`D1`).
pub const DEFAULT_DATA_PORT_BASE: u16 = 9001;
/// Default number of data channels (`N`).
pub const DEFAULT_DATA_CHANNELS: u16 = 25;

/// Shared configuration for a fabric deployment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port of the local HTTP ingress on the container side.
    pub ingress_port: u16,
    /// Port the container side listens on for the control channel.
    pub control_port: u16,
    /// First of the contiguous data-channel ports.
    pub data_port_base: u16,
    /// Number of data channels; fixed for the process lifetime.
    pub data_channels: u16,
    /// Address the container side binds its listeners on.
    pub bind_addr: IpAddr,
    /// Host the edge side dials to reach the container side.
    pub container_host: String,
    /// Bucket used when a request path does not start with a known bucket.
    pub default_bucket: String,
    /// Buckets that may be addressed by path prefix.
    pub buckets: Vec<String>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            ingress_port: DEFAULT_INGRESS_PORT,
            control_port: DEFAULT_CONTROL_PORT,
            data_port_base: DEFAULT_DATA_PORT_BASE,
            data_channels: DEFAULT_DATA_CHANNELS,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            container_host: "127.0.0.1".to_owned(),
            default_bucket: "default".to_owned(),
            buckets: Vec::new(),
        }
    }
}

impl Config {
    /// Builds a config from defaults plus `WARREN_*` environment
    /// overrides. Unparseable values are logged and ignored.
    pub fn from_env() -> Config {
        let mut config = Config::default();
        if let Some(port) = env_port("WARREN_INGRESS_PORT") {
            config.ingress_port = port;
        }
        if let Some(port) = env_port("WARREN_CONTROL_PORT") {
            config.control_port = port;
        }
        if let Some(port) = env_port("WARREN_DATA_PORT_BASE") {
            config.data_port_base = port;
        }
        if let Some(n) = env_port("WARREN_DATA_CHANNELS") {
            config.data_channels = n;
        }
        if let Ok(host) = env::var("WARREN_CONTAINER_HOST") {
            config.container_host = host;
        }
        if let Ok(bucket) = env::var("WARREN_DEFAULT_BUCKET") {
            config.default_bucket = bucket;
        }
        if let Ok(buckets) = env::var("WARREN_BUCKETS") {
            config.buckets = buckets
                .split(',')
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(str::to_owned)
                .collect();
        }
        config
    }

    /// The last data-channel port, `D1 + N - 1`.
    pub fn data_port_end(&self) -> u16 {
        self.data_port_base + self.data_channels - 1
    }

    /// All data-channel ports in order.
    pub fn data_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.data_port_base..=self.data_port_end()
    }
}

fn env_port(name: &str) -> Option<u16> {
    let raw = env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(%name, %raw, "ignoring unparseable port override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_layout_is_contiguous() {
        let config = Config::default();
        assert_eq!(config.data_port_base, 9001);
        assert_eq!(config.data_port_end(), 9025);
        assert_eq!(config.data_ports().count(), 25);
    }
}
