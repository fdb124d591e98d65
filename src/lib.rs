//! Rust library for controlling Onkyo and Pioneer AV receivers over eISCP
//!
//! This library provides an async API for discovering receivers on the local
//! network and controlling them over the eISCP (Ethernet Integra Serial
//! Control Protocol) TCP transport. It supports:
//!
//! - Discovery via UDP broadcast
//! - Framing and parsing of eISCP packets
//! - Translation between symbolic commands (`volume`, `input-selector`, ...)
//!   and raw ISCP telegrams for the main zone, zone 2 and zone 3
//! - Rate-limited command sending, one command at a time per receiver
//! - Automatic reconnection with escalating timeouts and background retries
//! - Sharing one connection between all zones of a receiver
//! - Cached zone state with deduplicated state polling
//!
//! # Quick Start
//!
//! ```no_run
//! use eiscp_avr::{discover, AvrConnection, Command, DiscoveryOptions};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Find a receiver
//!     let devices = discover(&DiscoveryOptions::default()).await?;
//!     let Some(device) = devices.first() else {
//!         return Ok(());
//!     };
//!     println!("Found {} at {}", device.model, device.host);
//!
//!     // Connect to it
//!     let connection = AvrConnection::new(eiscp_avr::ConnectionConfig {
//!         host: Some(device.host.clone()),
//!         port: device.port,
//!         model: Some(device.model.clone()),
//!         ..Default::default()
//!     });
//!     let mut messages = connection.take_messages()?;
//!     connection.connect().await?;
//!     connection.wait_for_connect(Duration::from_secs(3)).await?;
//!
//!     // Control it
//!     connection.send(&Command::new("system-power", "on")).await?;
//!     connection.send(&"zone2.volume=30".parse::<Command>()?).await?;
//!
//!     // Watch what it reports
//!     while let Some(message) = messages.recv().await {
//!         println!("{:?} {} = {:?}", message.zone, message.command, message.argument);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Multiple Zones
//!
//! [`ConnectCoordinator`] takes a list of configured zones, opens one
//! connection per physical receiver and keeps each zone's state current:
//!
//! ```no_run
//! use eiscp_avr::{ConnectCoordinator, LogPublisher, ReconnectConfig, Zone, ZoneConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let zones = vec![
//!         ZoneConfig::new("TX-NR686", "192.168.1.40", Zone::Main),
//!         ZoneConfig::new("TX-NR686", "192.168.1.40", Zone::Zone2),
//!     ];
//!     let publisher = Arc::new(LogPublisher);
//!     let coordinator = ConnectCoordinator::new(&ReconnectConfig::default(), publisher);
//!     coordinator.connect(&zones).await;
//!
//!     let main = zones[0].zone_identity();
//!     println!("{:?}", coordinator.state(&main));
//! }
//! ```
//!
//! # Architecture
//!
//! The library is organized into several layers:
//!
//! - **Coordinator**: Zone binding, message routing and state polling
//! - **Manager**: One registered connection per physical receiver
//! - **Reconnect**: Retry policy for lost or failed connections
//! - **Connection**: TCP transport, reader task and command queue
//! - **Translator**: Symbolic commands to and from ISCP telegrams
//! - **Protocol**: eISCP packet framing
//! - **Types**: Domain types and data structures

mod command;
mod commands;
mod config;
mod connection;
mod coordinator;
mod discovery;
mod error;
mod manager;
pub mod protocol;
mod queue;
mod reconnect;
mod subscription;
mod translator;
mod types;
mod zone_state;

// Public exports
pub use command::Command;
pub use commands::{CommandSpec, CommandTable, ValueSpec};
pub use config::{ConnectionConfig, DiscoveryOptions, EiscpConfig, ReconnectConfig, ZoneConfig};
pub use connection::AvrConnection;
pub use coordinator::ConnectCoordinator;
pub use discovery::discover;
pub use error::{EiscpError, Result};
pub use manager::{ConnectionManager, PhysicalConnection};
pub use queue::{CommandQueue, QueueHandle};
pub use reconnect::{ReconnectOutcome, Reconnectable, ReconnectionManager};
pub use subscription::MessageReceiver;
pub use translator::Translator;
pub use types::{
    Argument, ConnectionState, DecodedMessage, DeviceInfo, DiscoveredDevice, Metadata,
    PhysicalIdentity, Zone, ZoneCommands, ZoneIdentity, ZoneState, DEFAULT_PORT, UNKNOWN,
};
pub use zone_state::{
    CommandSink, LogPublisher, StatePublisher, ZoneBinding, ZoneStateTracker, QUERY_WINDOW,
};
