//! `tclockd.toml` configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use tc_core::PortOptions;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TcConfig {
    /// PTP domain number (0-127). Frames from other domains are ignored.
    #[serde(default)]
    pub domain: u8,
    #[serde(default)]
    pub ports: Vec<PortEntry>,
    /// Metrics snapshot log. Omit to disable.
    #[serde(default)]
    pub stats: Option<StatsConfig>,
}

/// One forwarding port, bound to a network interface.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PortEntry {
    /// Interface name (e.g. "eth0"). Port numbers are assigned from 1 in
    /// file order.
    pub interface: String,
    /// Correction applied to ingress timestamps, nanoseconds.
    #[serde(default)]
    pub rx_timestamp_offset: i64,
    /// Correction applied to egress timestamps, nanoseconds.
    #[serde(default)]
    pub tx_timestamp_offset: i64,
    /// Peer delay request interval as log2 seconds (0 = 1 s, -1 = 500 ms).
    #[serde(default)]
    pub log_pdelay_req_interval: i8,
    /// EWMA window of the peer delay filter.
    #[serde(default = "PortEntry::default_filter_length")]
    pub delay_filter_length: i64,
}

impl PortEntry {
    fn default_filter_length() -> i64 {
        8
    }

    pub fn to_options(&self, domain: u8) -> PortOptions {
        PortOptions {
            interface: self.interface.clone(),
            domain,
            tx_timestamp_offset: self.tx_timestamp_offset,
            rx_timestamp_offset: self.rx_timestamp_offset,
            log_min_pdelay_req_interval: self.log_pdelay_req_interval,
            delay_filter_length: self.delay_filter_length,
        }
    }
}

/// Configuration for the JSONL stats log.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatsConfig {
    #[serde(default = "StatsConfig::default_enabled")]
    pub enabled: bool,
    /// File the per-port snapshots are appended to.
    #[serde(default = "StatsConfig::default_path")]
    pub path: String,
    /// Seconds between snapshots.
    #[serde(default = "StatsConfig::default_interval")]
    pub interval_secs: u64,
}

impl StatsConfig {
    fn default_enabled() -> bool { true }
    fn default_path() -> String { "/var/log/tclockd.jsonl".into() }
    fn default_interval() -> u64 { 10 }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            path: Self::default_path(),
            interval_secs: Self::default_interval(),
        }
    }
}

impl TcConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(cfg)
    }

    /// A two-port bridge configuration to start from.
    pub fn default_example() -> Self {
        Self {
            domain: 0,
            stats: Some(StatsConfig::default()),
            ports: vec![
                PortEntry {
                    interface: "eth0".into(),
                    rx_timestamp_offset: 0,
                    tx_timestamp_offset: 0,
                    log_pdelay_req_interval: 0,
                    delay_filter_length: 8,
                },
                PortEntry {
                    interface: "eth1".into(),
                    rx_timestamp_offset: 0,
                    tx_timestamp_offset: 0,
                    log_pdelay_req_interval: 0,
                    delay_filter_length: 8,
                },
            ],
        }
    }
}
