use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EiscpError;

/// Default eISCP control and discovery port
pub const DEFAULT_PORT: u16 = 60128;

/// Value used for zone state fields that have not been reported yet
pub const UNKNOWN: &str = "unknown";

/// Output zone of a receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Zone {
    #[default]
    Main,
    Zone2,
    Zone3,
}

impl Zone {
    /// All zones in command table lookup order
    pub const ALL: [Zone; 3] = [Zone::Main, Zone::Zone2, Zone::Zone3];

    /// Zone name as used in the command table and in the legacy string form
    pub fn as_str(&self) -> &'static str {
        match self {
            Zone::Main => "main",
            Zone::Zone2 => "zone2",
            Zone::Zone3 => "zone3",
        }
    }

    /// Command names this zone uses for power, input and volume related state
    pub fn commands(&self) -> ZoneCommands {
        match self {
            Zone::Main => ZoneCommands {
                power: "system-power",
                selector: "input-selector",
                volume: "volume",
                muting: "audio-muting",
                listening_mode: Some("listening-mode"),
            },
            Zone::Zone2 => ZoneCommands {
                power: "power",
                selector: "selector",
                volume: "volume",
                muting: "muting",
                listening_mode: Some("listening-mode"),
            },
            Zone::Zone3 => ZoneCommands {
                power: "power",
                selector: "selector",
                volume: "volume",
                muting: "muting",
                listening_mode: None,
            },
        }
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Zone {
    type Err = EiscpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "main" => Ok(Zone::Main),
            "zone2" => Ok(Zone::Zone2),
            "zone3" => Ok(Zone::Zone3),
            other => Err(EiscpError::InvalidCommand(format!("unknown zone '{}'", other))),
        }
    }
}

/// Per-zone command names used when polling state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneCommands {
    pub power: &'static str,
    pub selector: &'static str,
    pub volume: &'static str,
    pub muting: &'static str,
    /// Zone 3 has no listening mode command
    pub listening_mode: Option<&'static str>,
}

/// One physical receiver, regardless of zone
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhysicalIdentity {
    pub model: String,
    pub host: String,
}

impl PhysicalIdentity {
    pub fn new(model: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            host: host.into(),
        }
    }
}

impl fmt::Display for PhysicalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.model, self.host)
    }
}

/// One controllable output zone of a physical receiver
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ZoneIdentity {
    pub model: String,
    pub host: String,
    pub zone: Zone,
}

impl ZoneIdentity {
    pub fn new(model: impl Into<String>, host: impl Into<String>, zone: Zone) -> Self {
        Self {
            model: model.into(),
            host: host.into(),
            zone,
        }
    }

    /// The physical receiver this zone belongs to
    pub fn physical(&self) -> PhysicalIdentity {
        PhysicalIdentity::new(self.model.clone(), self.host.clone())
    }
}

impl fmt::Display for ZoneIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.model, self.host, self.zone)
    }
}

/// Connection state of a transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Address and model a connection is (or will be) talking to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub host: String,
    pub port: u16,
    pub model: String,
}

impl DeviceInfo {
    pub fn identity(&self) -> PhysicalIdentity {
        PhysicalIdentity::new(self.model.clone(), self.host.clone())
    }
}

/// Receiver found by UDP discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub host: String,
    pub port: u16,
    pub model: String,
    /// Destination area code (e.g. "DX", "XX")
    pub area_code: String,
    pub mac: String,
}

impl DiscoveredDevice {
    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            host: self.host.clone(),
            port: self.port,
            model: self.model.clone(),
        }
    }
}

/// Now-playing metadata assembled from the artist/title/album telegrams
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
}

/// Argument of a decoded message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Argument {
    Number(i64),
    Text(String),
    List(Vec<String>),
    Metadata(Metadata),
}

impl Argument {
    /// Text value, if the argument is a string
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Argument::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric value, if the argument is a number
    pub fn as_number(&self) -> Option<i64> {
        match self {
            Argument::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<&str> for Argument {
    fn from(s: &str) -> Self {
        Argument::Text(s.to_string())
    }
}

/// A telegram received from a receiver, translated to its symbolic form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedMessage {
    pub command: String,
    pub argument: Argument,
    /// Zone the command belongs to; `None` for unrecognized or zone-less telegrams
    pub zone: Option<Zone>,
}

impl DecodedMessage {
    /// Placeholder for telegrams outside the command table
    pub fn undefined() -> Self {
        Self {
            command: "undefined".to_string(),
            argument: Argument::Text("undefined".to_string()),
            zone: None,
        }
    }
}

/// Cached state of one zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneState {
    pub source: String,
    pub sub_source: String,
    pub audio_format: String,
    pub power_state: String,
}

impl Default for ZoneState {
    fn default() -> Self {
        Self {
            source: UNKNOWN.to_string(),
            sub_source: UNKNOWN.to_string(),
            audio_format: UNKNOWN.to_string(),
            power_state: UNKNOWN.to_string(),
        }
    }
}
