use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{ConnectionConfig, ReconnectConfig};
use crate::connection::AvrConnection;
use crate::error::{EiscpError, Result};
use crate::reconnect::{ReconnectOutcome, Reconnectable, ReconnectionManager};
use crate::types::{ConnectionState, PhysicalIdentity};

type ReadyCallback = Arc<dyn Fn() + Send + Sync>;
type Registry = Arc<Mutex<HashMap<PhysicalIdentity, Arc<PhysicalConnection>>>>;

/// How long the first connect may take before falling back to background retries
const INITIAL_CONNECT_TIMEOUT: Duration = Duration::from_millis(3000);

/// The single transport connection to one physical receiver
pub struct PhysicalConnection {
    identity: PhysicalIdentity,
    connection: AvrConnection,
    config: ConnectionConfig,
}

impl PhysicalConnection {
    pub fn identity(&self) -> &PhysicalIdentity {
        &self.identity
    }

    pub fn connection(&self) -> &AvrConnection {
        &self.connection
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }
}

/// Registry of physical connections, one per receiver
///
/// Zones on the same receiver share the registered connection; the registry
/// never holds two connections for one identity.
pub struct ConnectionManager {
    connections: Registry,
    reconnection: ReconnectionManager,
    connect_timeout: Duration,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(&ReconnectConfig::default())
    }
}

impl ConnectionManager {
    pub fn new(reconnect: &ReconnectConfig) -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            reconnection: ReconnectionManager::new(reconnect),
            connect_timeout: INITIAL_CONNECT_TIMEOUT,
        }
    }

    pub fn reconnection(&self) -> &ReconnectionManager {
        &self.reconnection
    }

    /// Create the connection for `identity` and try to connect it
    ///
    /// If a connection is already registered it is returned untouched. A
    /// connection that fails to come up is still registered and returned;
    /// background retries keep trying until it connects, and
    /// `on_receiver_ready` runs once it does. The same happens whenever the
    /// receiver drops an established link.
    pub async fn create_and_connect<F>(
        &self,
        identity: PhysicalIdentity,
        config: ConnectionConfig,
        on_receiver_ready: F,
    ) -> Arc<PhysicalConnection>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let on_receiver_ready: ReadyCallback = Arc::new(on_receiver_ready);

        let physical = {
            let mut connections = self.connections.lock().unwrap();
            if let Some(existing) = connections.get(&identity) {
                tracing::warn!(device = %identity, "Connection already exists, reusing it");
                return existing.clone();
            }

            let physical = Arc::new(PhysicalConnection {
                identity: identity.clone(),
                connection: AvrConnection::new(config.clone()),
                config,
            });
            connections.insert(identity.clone(), physical.clone());
            physical
        };

        self.spawn_link_watcher(&physical, on_receiver_ready.clone());

        let result = physical.connection.try_connect(self.connect_timeout).await;
        match result {
            Ok(()) => {
                tracing::info!(device = %identity, "Receiver ready");
                on_receiver_ready();
            }
            Err(e) => {
                tracing::warn!(device = %identity, "Initial connect failed: {}", e);
                self.reconnection.schedule_reconnection(
                    identity,
                    physical.connection.clone(),
                    || false,
                    move || on_receiver_ready(),
                );
            }
        }

        physical
    }

    /// Run one reconnection pass for a registered receiver
    ///
    /// A success also cancels any background retry for it.
    pub async fn attempt_reconnection(
        &self,
        identity: &PhysicalIdentity,
    ) -> Result<ReconnectOutcome> {
        let physical = self
            .get(identity)
            .ok_or_else(|| EiscpError::UnknownDevice(identity.to_string()))?;

        let outcome = self
            .reconnection
            .attempt_reconnection(identity, &physical.connection)
            .await;
        if outcome.success {
            self.reconnection.cancel_scheduled_reconnection(identity);
        }
        Ok(outcome)
    }

    pub fn get(&self, identity: &PhysicalIdentity) -> Option<Arc<PhysicalConnection>> {
        self.connections.lock().unwrap().get(identity).cloned()
    }

    pub fn contains(&self, identity: &PhysicalIdentity) -> bool {
        self.connections.lock().unwrap().contains_key(identity)
    }

    pub fn is_connected(&self, identity: &PhysicalIdentity) -> bool {
        self.get(identity).is_some_and(|p| p.is_connected())
    }

    pub fn identities(&self) -> Vec<PhysicalIdentity> {
        self.connections.lock().unwrap().keys().cloned().collect()
    }

    /// Close every socket, stop background retries and empty the registry
    pub fn clear_all_connections(&self) {
        self.reconnection.cancel_all_scheduled_reconnections();

        let connections: Vec<_> = self.connections.lock().unwrap().drain().collect();
        for (identity, physical) in connections {
            tracing::info!(device = %identity, "Closing connection");
            physical.connection.disconnect();
        }
    }

    pub fn disconnect_all(&self) {
        self.clear_all_connections();
    }

    /// Log state changes and schedule a reconnection when the link is lost
    ///
    /// Any successful connect cancels the scheduled reconnection. The watcher
    /// stops once the receiver is no longer registered.
    fn spawn_link_watcher(&self, physical: &PhysicalConnection, on_receiver_ready: ReadyCallback) {
        let identity = physical.identity.clone();
        let mut state_rx = physical.connection.subscribe_state();
        let mut lost_rx = physical.connection.subscribe_link_lost();
        let connections = self.connections.clone();
        let reconnection = self.reconnection.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *state_rx.borrow_and_update();
                        tracing::debug!(device = %identity, "Connection state: {:?}", state);
                        // Connected some other way while a retry was pending
                        if state == ConnectionState::Connected
                            && reconnection.cancel_scheduled_reconnection(&identity)
                        {
                            on_receiver_ready();
                        }
                    }
                    lost = lost_rx.changed() => {
                        if lost.is_err() {
                            break;
                        }
                        lost_rx.borrow_and_update();

                        let registered = connections.lock().unwrap().get(&identity).cloned();
                        let Some(physical) = registered else {
                            break;
                        };
                        if physical.is_connected() || reconnection.is_scheduled(&identity) {
                            continue;
                        }

                        tracing::warn!(
                            device = %identity,
                            "Connection lost, scheduling reconnection"
                        );
                        let ready = on_receiver_ready.clone();
                        reconnection.schedule_reconnection(
                            identity.clone(),
                            physical.connection.clone(),
                            || false,
                            move || ready(),
                        );
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    fn config_for(port: u16) -> ConnectionConfig {
        ConnectionConfig {
            host: Some("127.0.0.1".to_string()),
            model: Some("TX-NR609".to_string()),
            port,
            send_delay_ms: 10,
            ..Default::default()
        }
    }

    fn identity() -> PhysicalIdentity {
        PhysicalIdentity::new("TX-NR609", "127.0.0.1")
    }

    #[tokio::test]
    async fn connects_once_and_reuses_existing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepts = Arc::new(AtomicUsize::new(0));
        let counter = accepts.clone();
        tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                sockets.push(socket);
            }
        });

        let manager = ConnectionManager::default();
        let ready = Arc::new(AtomicUsize::new(0));

        let r = ready.clone();
        let first = manager
            .create_and_connect(identity(), config_for(port), move || {
                r.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        let r = ready.clone();
        let second = manager
            .create_and_connect(identity(), config_for(port), move || {
                r.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert!(Arc::ptr_eq(&first, &second));
        assert!(manager.is_connected(&identity()));
        assert_eq!(manager.identities(), vec![identity()]);
        assert_eq!(ready.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(accepts.load(Ordering::SeqCst), 1);

        manager.clear_all_connections();
        assert!(!manager.contains(&identity()));
        assert!(!first.is_connected());
    }

    #[tokio::test]
    async fn failed_connect_is_registered_and_scheduled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let manager = ConnectionManager::default();
        let physical = manager
            .create_and_connect(identity(), config_for(port), || {})
            .await;

        assert!(!physical.is_connected());
        assert!(manager.contains(&identity()));
        assert!(manager.reconnection().is_scheduled(&identity()));

        manager.disconnect_all();
        assert!(!manager.reconnection().is_scheduled(&identity()));
        assert!(manager.identities().is_empty());
    }

    #[tokio::test]
    async fn reconnecting_unknown_device_fails() {
        let manager = ConnectionManager::default();
        let result = manager.attempt_reconnection(&identity()).await;
        assert!(matches!(result, Err(EiscpError::UnknownDevice(_))));
    }
}
