//! Connection orchestration for a set of configured zones.
//!
//! [`ConnectCoordinator`] maps configured zones onto one transport connection
//! per physical receiver, binds each zone to that connection, keeps the zone
//! state cache current from the receiver's telegrams and polls zone state
//! after connecting.

use futures_util::future::join_all;
use serde_json::Map;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::command::Command;
use crate::config::{ReconnectConfig, ZoneConfig};
use crate::error::{EiscpError, Result};
use crate::manager::{ConnectionManager, PhysicalConnection};
use crate::subscription::MessageReceiver;
use crate::types::{Argument, DecodedMessage, PhysicalIdentity, ZoneIdentity, ZoneState};
use crate::zone_state::{StatePublisher, ZoneBinding, ZoneStateTracker};

#[derive(Clone)]
struct ZoneEntry {
    binding: ZoneBinding,
    config: ZoneConfig,
}

type Bindings = Arc<Mutex<BTreeMap<ZoneIdentity, ZoneEntry>>>;

/// Connects configured zones and keeps their state in sync
///
/// # Example
///
/// ```no_run
/// use eiscp_avr::{ConnectCoordinator, EiscpConfig, LogPublisher};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = EiscpConfig::from_json(r#"{
///         "zones": [
///             { "model": "TX-NR686", "host": "192.168.1.40" },
///             { "model": "TX-NR686", "host": "192.168.1.40", "zone": "zone2" }
///         ]
///     }"#)?;
///
///     let coordinator = ConnectCoordinator::new(&config.reconnect, Arc::new(LogPublisher));
///     if coordinator.connect(&config.zones).await {
///         println!("{} zone(s) bound", coordinator.zones().len());
///     }
///     Ok(())
/// }
/// ```
pub struct ConnectCoordinator {
    manager: Arc<ConnectionManager>,
    tracker: Arc<ZoneStateTracker>,
    publisher: Arc<dyn StatePublisher>,
    bindings: Bindings,
    routers: Mutex<HashMap<PhysicalIdentity, JoinHandle<()>>>,
}

impl ConnectCoordinator {
    pub fn new(reconnect: &ReconnectConfig, publisher: Arc<dyn StatePublisher>) -> Self {
        Self {
            manager: Arc::new(ConnectionManager::new(reconnect)),
            tracker: Arc::new(ZoneStateTracker::new()),
            publisher,
            bindings: Arc::new(Mutex::new(BTreeMap::new())),
            routers: Mutex::new(HashMap::new()),
        }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn tracker(&self) -> &ZoneStateTracker {
        &self.tracker
    }

    /// Bind and connect every zone in `zones`
    ///
    /// Zones on the same receiver share one connection; the first config
    /// listed for a receiver decides its transport settings. Returns whether
    /// any zone is bound afterwards. Receivers that cannot be reached stay
    /// bound and are retried in the background.
    pub async fn connect(&self, zones: &[ZoneConfig]) -> bool {
        let devices = group_by_device(zones);
        let mut polled = HashSet::new();

        for (identity, device_zones) in &devices {
            if !self.manager.contains(identity) {
                let physical = self
                    .manager
                    .create_and_connect(
                        identity.clone(),
                        device_zones[0].connection_config(),
                        self.ready_callback(identity),
                    )
                    .await;
                self.start_router(&physical);
            } else if !self.manager.is_connected(identity) {
                match self.manager.attempt_reconnection(identity).await {
                    Ok(outcome) if outcome.success => {
                        for zone in device_zones {
                            self.bind(zone);
                        }
                        poll_zones(&self.tracker, bindings_for(&self.bindings, identity)).await;
                        polled.insert(identity.clone());
                    }
                    Ok(outcome) => {
                        tracing::warn!(
                            device = %identity,
                            "Still unreachable after {} attempt(s)",
                            outcome.attempts
                        );
                    }
                    Err(e) => tracing::warn!(device = %identity, "Reconnection failed: {}", e),
                }
            }
        }

        for (_, device_zones) in &devices {
            for zone in device_zones {
                self.bind(zone);
            }
        }

        // Receivers still offline are polled by their ready callback
        let pending: Vec<Vec<ZoneBinding>> = devices
            .iter()
            .filter(|(identity, _)| {
                !polled.contains(identity) && self.manager.is_connected(identity)
            })
            .map(|(identity, _)| bindings_for(&self.bindings, identity))
            .filter(|bindings| !bindings.is_empty())
            .collect();
        join_all(
            pending
                .into_iter()
                .map(|bindings| poll_zones(&self.tracker, bindings)),
        )
        .await;

        !self.bindings.lock().unwrap().is_empty()
    }

    /// Send a command to a bound zone
    ///
    /// The command is retargeted at the zone.
    pub async fn send_command(&self, id: &ZoneIdentity, command: Command) -> Result<()> {
        let binding = self.binding(id)?;
        let command = command.in_zone(id.zone);
        binding.sink.send_command(&command).await
    }

    /// Switch a zone to the network input and open a network service
    pub async fn select_network_service(&self, id: &ZoneIdentity, service: &str) -> Result<()> {
        let entry = self.entry(id)?;
        let selector = Command::new(id.zone.commands().selector, "net").in_zone(id.zone);
        entry.binding.sink.send_command(&selector).await?;

        // The network menu ignores commands until it has opened
        sleep(entry.config.net_menu_delay()).await;

        let service = Command::new("net-service", service);
        entry.binding.sink.send_command(&service).await
    }

    /// Currently bound zones
    pub fn zones(&self) -> Vec<ZoneIdentity> {
        self.bindings.lock().unwrap().keys().cloned().collect()
    }

    pub fn state(&self, id: &ZoneIdentity) -> ZoneState {
        self.tracker.state(id)
    }

    /// Unbind one zone; its receiver stays connected
    pub fn remove_zone(&self, id: &ZoneIdentity) -> bool {
        let removed = self.bindings.lock().unwrap().remove(id).is_some();
        if removed {
            self.tracker.clear_zone(id);
            tracing::info!(zone = %id, "Zone removed");
        }
        removed
    }

    /// Close every connection and forget all zones
    pub fn disconnect(&self) {
        self.manager.clear_all_connections();
        for (_, router) in self.routers.lock().unwrap().drain() {
            router.abort();
        }
        self.bindings.lock().unwrap().clear();
        self.tracker.clear_all();
    }

    fn binding(&self, id: &ZoneIdentity) -> Result<ZoneBinding> {
        self.entry(id).map(|entry| entry.binding)
    }

    fn entry(&self, id: &ZoneIdentity) -> Result<ZoneEntry> {
        self.bindings
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| EiscpError::UnknownDevice(id.to_string()))
    }

    fn bind(&self, zone: &ZoneConfig) {
        let id = zone.zone_identity();
        let Some(physical) = self.manager.get(&zone.physical_identity()) else {
            tracing::warn!(zone = %id, "No connection to bind to");
            return;
        };

        let mut bindings = self.bindings.lock().unwrap();
        if bindings.contains_key(&id) {
            return;
        }

        tracing::info!(zone = %id, "Binding zone");
        let binding = ZoneBinding {
            id: id.clone(),
            entity_id: zone.entity_id(),
            sink: Arc::new(physical.connection().clone()),
            publisher: self.publisher.clone(),
            threshold: zone.threshold(),
        };
        bindings.insert(
            id,
            ZoneEntry {
                binding,
                config: zone.clone(),
            },
        );
    }

    /// Poll the receiver's zones each time a background reconnect succeeds
    fn ready_callback(&self, identity: &PhysicalIdentity) -> impl Fn() + Send + Sync + 'static {
        let bindings = self.bindings.clone();
        let tracker = self.tracker.clone();
        let identity = identity.clone();

        move || {
            let device_bindings = bindings_for(&bindings, &identity);
            if device_bindings.is_empty() {
                return;
            }
            let tracker = tracker.clone();
            tokio::spawn(async move {
                poll_zones(&tracker, device_bindings).await;
            });
        }
    }

    fn start_router(&self, physical: &PhysicalConnection) {
        let messages = match physical.connection().take_messages() {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(device = %physical.identity(), "Cannot route messages: {}", e);
                return;
            }
        };

        let router = tokio::spawn(route_messages(
            messages,
            physical.identity().clone(),
            self.bindings.clone(),
            self.tracker.clone(),
        ));
        if let Some(old) = self
            .routers
            .lock()
            .unwrap()
            .insert(physical.identity().clone(), router)
        {
            old.abort();
        }
    }
}

impl Drop for ConnectCoordinator {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Receivers in first-seen order with their distinct zones
fn group_by_device(zones: &[ZoneConfig]) -> Vec<(PhysicalIdentity, Vec<&ZoneConfig>)> {
    let mut devices: Vec<(PhysicalIdentity, Vec<&ZoneConfig>)> = Vec::new();

    for zone in zones {
        let identity = zone.physical_identity();
        match devices.iter_mut().find(|(id, _)| *id == identity) {
            Some((_, device_zones)) => {
                if !device_zones.iter().any(|z| z.zone == zone.zone) {
                    device_zones.push(zone);
                }
            }
            None => devices.push((identity, vec![zone])),
        }
    }

    devices
}

fn bindings_for(
    bindings: &Mutex<BTreeMap<ZoneIdentity, ZoneEntry>>,
    identity: &PhysicalIdentity,
) -> Vec<ZoneBinding> {
    bindings
        .lock()
        .unwrap()
        .values()
        .filter(|entry| {
            entry.binding.id.model == identity.model && entry.binding.id.host == identity.host
        })
        .map(|entry| entry.binding.clone())
        .collect()
}

/// Poll one receiver's zones one after another, a threshold apart
async fn poll_zones(tracker: &ZoneStateTracker, bindings: Vec<ZoneBinding>) {
    let count = bindings.len();
    for (index, binding) in bindings.iter().enumerate() {
        tracker.query_avr_state(binding).await;
        if index + 1 < count {
            sleep(binding.threshold).await;
        }
    }
}

async fn route_messages(
    mut messages: MessageReceiver,
    identity: PhysicalIdentity,
    bindings: Bindings,
    tracker: Arc<ZoneStateTracker>,
) {
    while let Some(message) = messages.recv().await {
        if message.command == "undefined" {
            continue;
        }

        let id = ZoneIdentity::new(
            identity.model.clone(),
            identity.host.clone(),
            message.zone.unwrap_or_default(),
        );
        let binding = bindings.lock().unwrap().get(&id).map(|entry| entry.binding.clone());
        let Some(binding) = binding else {
            tracing::debug!(zone = %id, "No binding for {}", message.command);
            continue;
        };

        apply_message(&tracker, &binding, &message);

        match serde_json::to_value(&message.argument) {
            Ok(value) => {
                let mut attributes = Map::new();
                attributes.insert(message.command.clone(), value);
                binding.publisher.publish(&binding.entity_id, attributes);
            }
            Err(e) => tracing::warn!("Failed to serialize {}: {}", message.command, e),
        }
    }

    tracing::debug!(device = %identity, "Message routing stopped");
}

/// Update cached zone state from a telegram
fn apply_message(tracker: &ZoneStateTracker, binding: &ZoneBinding, message: &DecodedMessage) {
    let Some(value) = argument_text(&message.argument) else {
        return;
    };

    match message.command.as_str() {
        "system-power" | "power" => {
            tracker.set_power_state(&binding.id, &value);
        }
        "input-selector" | "selector" => {
            tracker.set_source(binding, &value);
        }
        "audio-selector" => {
            tracker.set_sub_source(binding, &value);
        }
        "audio-information" => {
            if let Some(format) = value.split(',').nth(1) {
                tracker.set_audio_format(&binding.id, format.trim());
            }
        }
        _ => {}
    }
}

fn argument_text(argument: &Argument) -> Option<String> {
    match argument {
        Argument::Text(text) => Some(text.clone()),
        Argument::Number(n) => Some(n.to_string()),
        Argument::List(items) => items.first().cloned(),
        Argument::Metadata(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Zone;
    use crate::zone_state::{CommandSink, LogPublisher};
    use futures_util::future::BoxFuture;

    struct NullSink;

    impl CommandSink for NullSink {
        fn send_command<'a>(&'a self, _command: &'a Command) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn binding(zone: Zone) -> ZoneBinding {
        ZoneBinding {
            id: ZoneIdentity::new("TX-NR609", "10.0.0.5", zone),
            entity_id: "avr".to_string(),
            sink: Arc::new(NullSink),
            publisher: Arc::new(LogPublisher),
            threshold: std::time::Duration::from_millis(1),
        }
    }

    fn message(command: &str, argument: Argument) -> DecodedMessage {
        DecodedMessage {
            command: command.to_string(),
            argument,
            zone: Some(Zone::Main),
        }
    }

    #[test]
    fn groups_zones_by_receiver() {
        let zones = vec![
            ZoneConfig::new("TX-NR609", "10.0.0.5", Zone::Main),
            ZoneConfig::new("TX-RZ50", "10.0.0.6", Zone::Main),
            ZoneConfig::new("TX-NR609", "10.0.0.5", Zone::Zone2),
            ZoneConfig::new("TX-NR609", "10.0.0.5", Zone::Main),
        ];

        let devices = group_by_device(&zones);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].0, PhysicalIdentity::new("TX-NR609", "10.0.0.5"));
        assert_eq!(devices[0].1.len(), 2);
        assert_eq!(devices[1].1.len(), 1);
    }

    #[tokio::test]
    async fn telegrams_update_zone_state() {
        let tracker = ZoneStateTracker::new();
        let b = binding(Zone::Main);

        apply_message(&tracker, &b, &message("system-power", "on".into()));
        apply_message(&tracker, &b, &message("input-selector", "NET".into()));
        apply_message(&tracker, &b, &message("audio-selector", "hdmi".into()));
        apply_message(
            &tracker,
            &b,
            &message("audio-information", "HDMI 1,PCM,48 kHz,2.0 ch".into()),
        );

        let state = tracker.state(&b.id);
        assert_eq!(state.power_state, "on");
        assert_eq!(state.source, "net");
        assert_eq!(state.sub_source, "hdmi");
        assert_eq!(state.audio_format, "pcm");
    }

    #[tokio::test]
    async fn zone2_power_uses_zone_command_name() {
        let tracker = ZoneStateTracker::new();
        let b = binding(Zone::Zone2);

        apply_message(&tracker, &b, &message("power", "standby".into()));
        apply_message(&tracker, &b, &message("volume", Argument::Number(40)));

        let state = tracker.state(&b.id);
        assert_eq!(state.power_state, "standby");
        assert_eq!(state.source, crate::types::UNKNOWN);
    }

    #[tokio::test]
    async fn unbound_zone_commands_fail() {
        let coordinator =
            ConnectCoordinator::new(&ReconnectConfig::default(), Arc::new(LogPublisher));
        let id = ZoneIdentity::new("TX-NR609", "10.0.0.5", Zone::Main);

        assert!(matches!(
            coordinator.send_command(&id, Command::query("volume")).await,
            Err(EiscpError::UnknownDevice(_))
        ));
        assert!(!coordinator.remove_zone(&id));
    }
}
