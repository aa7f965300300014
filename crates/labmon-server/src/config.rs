//! Server configuration via Figment.
//!
//! Values merge in order: built-in defaults, then `labmon.toml` next to the
//! binary, then `LABMON_`-prefixed environment variables. Example:
//!
//! ```toml
//! data_dir = "/var/lib/labmon"
//! port = 8000
//! transport_deadline_ms = 2000
//! ```

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "labmon.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory holding the three JSON documents.
    pub data_dir: PathBuf,
    pub bind_address: IpAddr,
    pub port: u16,
    /// Per-operation transport deadline.
    pub transport_deadline_ms: u64,
    /// State machine evaluation period.
    pub tick_period_ms: u64,
    /// Global readings retention cap.
    pub readings_cap: usize,
    /// Default log filter when RUST_LOG is not set.
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            bind_address: "0.0.0.0".parse().expect("valid default address"),
            port: 8000,
            transport_deadline_ms: 2_000,
            tick_period_ms: 1_000,
            readings_cap: labmon_store::DEFAULT_READINGS_CAP,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    pub fn load_from(config_file: &str) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(ServerConfig::default()))
            .merge(Toml::file(config_file))
            .merge(Env::prefixed("LABMON_"))
            .extract()
    }

    pub fn transport_deadline(&self) -> Duration {
        Duration::from_millis(self.transport_deadline_ms)
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub fn listen_addr(&self) -> std::net::SocketAddr {
        (self.bind_address, self.port).into()
    }
}
