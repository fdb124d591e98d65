use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EiscpError;
use crate::types::Zone;

/// Symbolic command addressed to one zone
///
/// ```
/// use eiscp_avr::{Command, Zone};
///
/// let cmd: Command = "zone2.power=on".parse().unwrap();
/// assert_eq!(cmd, Command::new("power", "on").in_zone(Zone::Zone2));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    #[serde(default)]
    pub zone: Zone,
    pub command: String,
    pub args: String,
}

impl Command {
    /// Command for the main zone
    pub fn new(command: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            zone: Zone::Main,
            command: command.into(),
            args: args.into(),
        }
    }

    /// Status query (`QSTN`) for a command
    pub fn query(command: impl Into<String>) -> Self {
        Self::new(command, "query")
    }

    pub fn in_zone(mut self, zone: Zone) -> Self {
        self.zone = zone;
        self
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}={}", self.zone, self.command, self.args)
    }
}

/// Parses the legacy string form: `zone.command=args`, `command=args` or `command args`
impl FromStr for Command {
    type Err = EiscpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        let parts: Vec<&str> = lowered
            .split(|c: char| c.is_whitespace() || matches!(c, '.' | '=' | ':'))
            .filter(|p| !p.is_empty())
            .collect();

        match parts.as_slice() {
            [zone, command, args] => Ok(Command::new(*command, *args).in_zone(zone.parse()?)),
            [command, args] => Ok(Command::new(*command, *args)),
            _ => Err(EiscpError::InvalidCommand(s.to_string())),
        }
    }
}
