//! Configuration types.
//!
//! Every knob has a serde default so a minimal JSON document only needs the
//! zones it controls:
//!
//! ```
//! use eiscp_avr::EiscpConfig;
//!
//! let config = EiscpConfig::from_json(r#"{
//!     "zones": [
//!         { "model": "TX-NR686", "host": "192.168.1.40" },
//!         { "model": "TX-NR686", "host": "192.168.1.40", "zone": "zone2" }
//!     ]
//! }"#).unwrap();
//! assert_eq!(config.zones.len(), 2);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;
use crate::types::{PhysicalIdentity, Zone, ZoneIdentity, DEFAULT_PORT};

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_send_delay_ms() -> u64 {
    500
}

fn default_queue_threshold_ms() -> u64 {
    250
}

fn default_net_menu_delay_ms() -> u64 {
    2500
}

fn default_reconnect_sleep_secs() -> u64 {
    5
}

fn default_reconnect_timeouts_ms() -> Vec<u64> {
    vec![3000, 5000, 8000]
}

fn default_schedule_delay_ms() -> u64 {
    30_000
}

fn default_discovery_address() -> String {
    "255.255.255.255".to_string()
}

fn default_discovery_devices() -> usize {
    1
}

fn default_discovery_timeout_secs() -> u64 {
    2
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EiscpConfig {
    #[serde(default)]
    pub zones: Vec<ZoneConfig>,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub discovery: DiscoveryOptions,
}

impl EiscpConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// One configured output zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub model: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub zone: Zone,
    /// Minimum spacing between commands written to the receiver
    #[serde(default = "default_send_delay_ms")]
    pub send_delay_ms: u64,
    /// Spacing between the steps of a state poll
    #[serde(default = "default_queue_threshold_ms")]
    pub queue_threshold_ms: u64,
    /// Time the network menu needs after switching to the NET input
    #[serde(default = "default_net_menu_delay_ms")]
    pub net_menu_delay_ms: u64,
    #[serde(default)]
    pub reconnect_on_close: bool,
    #[serde(default = "default_reconnect_sleep_secs")]
    pub reconnect_sleep_secs: u64,
    /// Key used when publishing this zone's state; derived from the identity if absent
    #[serde(default)]
    pub entity_id: Option<String>,
}

impl ZoneConfig {
    pub fn new(model: impl Into<String>, host: impl Into<String>, zone: Zone) -> Self {
        Self {
            model: model.into(),
            host: host.into(),
            port: default_port(),
            zone,
            send_delay_ms: default_send_delay_ms(),
            queue_threshold_ms: default_queue_threshold_ms(),
            net_menu_delay_ms: default_net_menu_delay_ms(),
            reconnect_on_close: false,
            reconnect_sleep_secs: default_reconnect_sleep_secs(),
            entity_id: None,
        }
    }

    pub fn zone_identity(&self) -> ZoneIdentity {
        ZoneIdentity::new(self.model.clone(), self.host.clone(), self.zone)
    }

    pub fn physical_identity(&self) -> PhysicalIdentity {
        PhysicalIdentity::new(self.model.clone(), self.host.clone())
    }

    pub fn threshold(&self) -> Duration {
        Duration::from_millis(self.queue_threshold_ms)
    }

    pub fn net_menu_delay(&self) -> Duration {
        Duration::from_millis(self.net_menu_delay_ms)
    }

    pub fn entity_id(&self) -> String {
        self.entity_id.clone().unwrap_or_else(|| {
            let model = self.model.to_lowercase().replace(['-', ' '], "_");
            let host = self.host.replace(['.', ':'], "_");
            format!("{}_{}_{}", model, host, self.zone)
        })
    }

    /// Transport settings for the physical receiver behind this zone
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            host: Some(self.host.clone()),
            port: self.port,
            model: Some(self.model.clone()),
            send_delay_ms: self.send_delay_ms,
            reconnect_on_close: self.reconnect_on_close,
            reconnect_sleep_secs: self.reconnect_sleep_secs,
            discovery: DiscoveryOptions::default(),
        }
    }
}

/// Settings for one transport connection
///
/// `host` and `model` may be left empty, in which case the first receiver
/// answering discovery is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_send_delay_ms")]
    pub send_delay_ms: u64,
    #[serde(default)]
    pub reconnect_on_close: bool,
    #[serde(default = "default_reconnect_sleep_secs")]
    pub reconnect_sleep_secs: u64,
    #[serde(default)]
    pub discovery: DiscoveryOptions,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
            model: None,
            send_delay_ms: default_send_delay_ms(),
            reconnect_on_close: false,
            reconnect_sleep_secs: default_reconnect_sleep_secs(),
            discovery: DiscoveryOptions::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn send_delay(&self) -> Duration {
        Duration::from_millis(self.send_delay_ms)
    }

    pub fn reconnect_sleep(&self) -> Duration {
        Duration::from_secs(self.reconnect_sleep_secs)
    }
}

/// Reconnection policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Connect timeouts tried in order by one reconnection attempt
    #[serde(default = "default_reconnect_timeouts_ms")]
    pub timeouts_ms: Vec<u64>,
    /// Wait before each background reconnection attempt
    #[serde(default = "default_schedule_delay_ms")]
    pub schedule_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            timeouts_ms: default_reconnect_timeouts_ms(),
            schedule_delay_ms: default_schedule_delay_ms(),
        }
    }
}

impl ReconnectConfig {
    pub fn timeouts(&self) -> Vec<Duration> {
        self.timeouts_ms.iter().copied().map(Duration::from_millis).collect()
    }

    pub fn schedule_delay(&self) -> Duration {
        Duration::from_millis(self.schedule_delay_ms)
    }
}

/// UDP discovery settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryOptions {
    #[serde(default = "default_discovery_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Stop after this many receivers have answered
    #[serde(default = "default_discovery_devices")]
    pub devices: usize,
    #[serde(default = "default_discovery_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            address: default_discovery_address(),
            port: default_port(),
            devices: default_discovery_devices(),
            timeout_secs: default_discovery_timeout_secs(),
        }
    }
}

impl DiscoveryOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_defaults_fill_in() {
        let zone: ZoneConfig =
            serde_json::from_str(r#"{ "model": "TX-NR609", "host": "10.0.0.5" }"#).unwrap();
        assert_eq!(zone, ZoneConfig::new("TX-NR609", "10.0.0.5", Zone::Main));
        assert_eq!(zone.threshold(), Duration::from_millis(250));
        assert_eq!(zone.entity_id(), "tx_nr609_10_0_0_5_main");
    }

    #[test]
    fn reconnect_defaults() {
        let config = EiscpConfig::from_json(r#"{ "zones": [] }"#).unwrap();
        assert_eq!(
            config.reconnect.timeouts(),
            vec![
                Duration::from_millis(3000),
                Duration::from_millis(5000),
                Duration::from_millis(8000)
            ]
        );
        assert_eq!(config.reconnect.schedule_delay(), Duration::from_secs(30));
        assert_eq!(config.discovery.address, "255.255.255.255");
        assert_eq!(config.discovery.port, 60128);
    }

    #[test]
    fn connection_config_inherits_zone_settings() {
        let mut zone = ZoneConfig::new("TX-NR609", "10.0.0.5", Zone::Zone2);
        zone.send_delay_ms = 100;
        let conn = zone.connection_config();
        assert_eq!(conn.host.as_deref(), Some("10.0.0.5"));
        assert_eq!(conn.send_delay(), Duration::from_millis(100));
    }
}
