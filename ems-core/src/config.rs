//! Runtime TOML configuration (§2.1, §6.1): broker list, listen sockets,
//! log level, and metrics port, loaded the way the teacher's cold-path
//! settings are loaded -- a single `serde`-derived struct, `toml::from_str`,
//! then a `validate()` pass before anything starts.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One `(broker, symbol)` pair the daemon opens a session for on startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSymbol {
    pub broker: String,
    pub symbol: String,
    /// Smallest price increment for this venue/symbol, used to scale a
    /// triggered dark order's slippage allowance (§4.5).
    #[serde(default = "default_min_tick")]
    pub min_tick: f64,
}

fn default_min_tick() -> f64 {
    0.01
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmsConfig {
    /// `(broker, symbol)` pairs to open sessions for at startup.
    pub symbols: Vec<BrokerSymbol>,
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenConfig {
    /// Path to the Unix-domain socket clients connect to.
    pub socket_path: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self { socket_path: "/tmp/ems.sock".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    pub listen_addr: SocketAddr,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { listen_addr: "127.0.0.1:9092".parse().unwrap(), path: "/metrics".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedConfig {
    /// Directory the shared OHLC rings are created under.
    pub shm_dir: String,
    /// Default subscriber throttle in Hz; `None` is unthrottled.
    pub rate_hz: Option<f64>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self { shm_dir: "/tmp/ems-shm".to_string(), rate_hz: Some(20.0) }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl EmsConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: EmsConfig =
            toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_default() -> Result<Self> {
        Self::load("config/ems.toml")
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            anyhow::bail!("at least one [[symbols]] entry is required");
        }
        for entry in &self.symbols {
            if entry.min_tick <= 0.0 {
                anyhow::bail!("min_tick for {}.{} must be positive", entry.broker, entry.symbol);
            }
        }
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            anyhow::bail!(
                "invalid log level '{}', must be one of: {:?}",
                self.log_level,
                valid_log_levels
            );
        }
        Ok(())
    }
}
