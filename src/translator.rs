//! Translation between symbolic commands and ISCP telegrams.

use crate::command::Command;
use crate::commands::CommandTable;
use crate::error::{EiscpError, Result};
use crate::types::{Argument, DecodedMessage, Metadata, Zone};

/// Prefixes that carry no actionable state and are dropped by the reader
const IGNORED_PREFIXES: &[&str] = &["NLS", "NLT", "NLA", "NJA", "NMS"];

/// Prefixes that may arrive with the next telegram glued to their value
const CONCATENATING_PREFIXES: &[&str] = &["SLI", "PRS", "AMT", "MVL"];

/// Whether telegrams with this prefix should be dropped without decoding
pub fn is_ignored(prefix: &str) -> bool {
    IGNORED_PREFIXES.contains(&prefix)
}

/// Encoder/decoder for one connection
///
/// Decoding is stateful: the now-playing title, artist and album arrive as
/// separate telegrams and are merged into one metadata record.
#[derive(Debug)]
pub struct Translator {
    table: &'static CommandTable,
    metadata: Metadata,
}

impl Default for Translator {
    fn default() -> Self {
        Self::new()
    }
}

impl Translator {
    /// Translator over the embedded command table
    pub fn new() -> Self {
        Self::with_table(CommandTable::global())
    }

    pub fn with_table(table: &'static CommandTable) -> Self {
        Self {
            table,
            metadata: Metadata::default(),
        }
    }

    /// Translate a symbolic command into its ISCP telegram
    pub fn command_to_wire(&self, cmd: &Command) -> Result<String> {
        let prefix = self
            .table
            .prefix_for(cmd.zone, &cmd.command)
            .ok_or_else(|| EiscpError::UnknownCommand {
                command: cmd.command.clone(),
                zone: cmd.zone.to_string(),
            })?;

        // prefix_for only returns prefixes present in the zone table
        let spec = self.table.get(cmd.zone, prefix);

        let value = match spec.and_then(|s| s.code_for(&cmd.args)) {
            Some(code) => code.to_string(),
            None => match cmd.args.trim().parse::<i64>() {
                Ok(n) if spec.is_some_and(|s| s.range) && n >= 0 => format!("{:02X}", n),
                _ => {
                    tracing::warn!(
                        command = %cmd.command,
                        zone = %cmd.zone,
                        "No value mapping for '{}', sending as-is",
                        cmd.args
                    );
                    cmd.args.clone()
                }
            },
        };

        Ok(format!("{}{}", prefix, value))
    }

    /// Translate an ISCP telegram into its symbolic form
    ///
    /// Never fails: telegrams outside the command table decode to
    /// [`DecodedMessage::undefined`].
    pub fn wire_to_command(&mut self, message: &str) -> DecodedMessage {
        let Some(prefix) = message.get(0..3) else {
            return DecodedMessage::undefined();
        };
        let value = message[3..].trim_matches(|c: char| (c as u32) < 0x20);

        match prefix {
            "NTM" => {
                return DecodedMessage {
                    command: self.command_name(prefix),
                    argument: Argument::Text(time_to_seconds(value)),
                    zone: Some(Zone::Main),
                };
            }
            "NAT" | "NTI" | "NAL" => return self.update_metadata(prefix, value),
            "DSN" => {
                return DecodedMessage {
                    command: "DSN".to_string(),
                    argument: Argument::Text(value.to_string()),
                    zone: Some(Zone::Main),
                };
            }
            _ => {}
        }

        let value = if CONCATENATING_PREFIXES.contains(&prefix) {
            strip_concatenated(value)
        } else {
            value
        };

        let Some((zone, spec)) = self.table.find(prefix) else {
            tracing::debug!("Unrecognized telegram: {}", message);
            return DecodedMessage::undefined();
        };

        let argument = if let Some(name) = spec.name_for(value) {
            Argument::Text(name.to_string())
        } else if spec.range && is_hex(value) {
            match i64::from_str_radix(value, 16) {
                Ok(n) => Argument::Number(n),
                Err(_) => Argument::Text(value.to_string()),
            }
        } else if let Some(decoded) = decode_hex_groups(value) {
            decoded
        } else {
            Argument::Text(value.to_string())
        };

        DecodedMessage {
            command: spec.name.clone(),
            argument,
            zone: Some(zone),
        }
    }

    fn update_metadata(&mut self, prefix: &str, value: &str) -> DecodedMessage {
        let value = Some(value.to_string());
        match prefix {
            "NAT" => self.metadata.artist = value,
            "NTI" => self.metadata.title = value,
            _ => self.metadata.album = value,
        }

        DecodedMessage {
            command: "metadata".to_string(),
            argument: Argument::Metadata(self.metadata.clone()),
            zone: Some(Zone::Main),
        }
    }

    fn command_name(&self, prefix: &str) -> String {
        self.table
            .find(prefix)
            .map(|(_, spec)| spec.name.clone())
            .unwrap_or_else(|| prefix.to_string())
    }
}

/// Drop a following telegram the receiver glued onto this one
fn strip_concatenated(value: &str) -> &str {
    match value.find("ISCP") {
        Some(idx) => value[..idx].trim(),
        None => value.trim(),
    }
}

/// `"mm:ss/mm:ss"` to `"<pos>/<dur>"` in seconds
fn time_to_seconds(value: &str) -> String {
    let mut sides = value.splitn(2, '/');
    let position = sides.next().map(clock_to_seconds).unwrap_or(0);
    let duration = sides.next().map(clock_to_seconds).unwrap_or(0);
    format!("{}/{}", position, duration)
}

fn clock_to_seconds(clock: &str) -> u64 {
    clock
        .trim()
        .split(':')
        .try_fold(0u64, |acc, part| part.parse::<u64>().ok().map(|n| acc * 60 + n))
        .unwrap_or(0)
}

fn is_hex(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// Comma-separated groups of hex byte pairs, each decoded as Latin-1 text
fn decode_hex_groups(value: &str) -> Option<Argument> {
    let mut groups = Vec::new();
    for group in value.split(',') {
        if !is_hex(group) || group.len() % 2 != 0 {
            return None;
        }
        let text: String = group
            .as_bytes()
            .chunks(2)
            .filter_map(|pair| std::str::from_utf8(pair).ok())
            .filter_map(|pair| u8::from_str_radix(pair, 16).ok())
            .map(char::from)
            .collect();
        groups.push(text);
    }

    if groups.len() == 1 {
        groups.pop().map(Argument::Text)
    } else {
        Some(Argument::List(groups))
    }
}
