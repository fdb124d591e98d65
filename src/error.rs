use std::time::Duration;
use thiserror::Error;

/// Result type for eISCP operations
pub type Result<T> = std::result::Result<T, EiscpError>;

/// Errors that can occur when talking to an eISCP receiver
#[derive(Error, Debug)]
pub enum EiscpError {
    /// I/O error on the control or discovery socket
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A command was sent while the receiver was not connected
    #[error("Not connected")]
    NotConnected,

    /// The receiver did not reach the connected state in time
    #[error("Timed out after {0:?} waiting for connection")]
    ConnectionTimeout(Duration),

    /// No receiver answered the discovery broadcast
    #[error("No receiver found during discovery")]
    DiscoveryFailed,

    /// The command name has no entry in the command table for the zone
    #[error("Unknown command: {command} (zone {zone})")]
    UnknownCommand {
        /// Symbolic command name
        command: String,
        /// Zone the lookup was made in
        zone: String,
    },

    /// The legacy string form of a command could not be parsed
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// No connection is registered for the physical identity
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Message channel error
    #[error("Channel error: {0}")]
    ChannelError(String),
}
