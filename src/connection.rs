use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::command::Command;
use crate::config::{ConnectionConfig, DiscoveryOptions};
use crate::discovery::discover;
use crate::error::{EiscpError, Result};
use crate::protocol;
use crate::queue::CommandQueue;
use crate::reconnect::Reconnectable;
use crate::subscription::MessageReceiver;
use crate::translator::{self, Translator};
use crate::types::{ConnectionState, DecodedMessage, DeviceInfo};
use crate::zone_state::CommandSink;

/// Upper bound on a single TCP connect
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Decoded messages buffered before the consumer falls behind
const MESSAGE_BUFFER: usize = 256;

/// An open socket: writer queue plus reader task
struct Link {
    queue: CommandQueue,
    reader: JoinHandle<()>,
    generation: u64,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

struct Inner {
    config: ConnectionConfig,
    device: Mutex<Option<DeviceInfo>>,
    state_tx: watch::Sender<ConnectionState>,
    link: Mutex<Option<Link>>,
    translator: Mutex<Translator>,
    message_tx: mpsc::Sender<DecodedMessage>,
    message_rx: Mutex<Option<mpsc::Receiver<DecodedMessage>>>,
    /// Counts sockets lost after connecting
    lost_tx: watch::Sender<u64>,
    /// Bumped by every connect and disconnect; stale sockets compare against it
    generation: AtomicU64,
}

/// TCP connection to one physical receiver
///
/// Cloning is cheap and every clone drives the same socket. The connection
/// outlives individual sockets: after a disconnect it can be connected again
/// and keeps its message channel.
///
/// # Example
///
/// ```no_run
/// use eiscp_avr::{AvrConnection, Command, ConnectionConfig};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let connection = AvrConnection::new(ConnectionConfig {
///         host: Some("192.168.1.40".to_string()),
///         model: Some("TX-NR686".to_string()),
///         ..Default::default()
///     });
///     let mut messages = connection.take_messages()?;
///
///     connection.connect().await?;
///     connection.wait_for_connect(Duration::from_secs(3)).await?;
///     connection.send(&Command::new("volume", "40")).await?;
///
///     while let Some(message) = messages.recv().await {
///         println!("{} = {:?}", message.command, message.argument);
///     }
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct AvrConnection {
    inner: Arc<Inner>,
}

impl AvrConnection {
    pub fn new(config: ConnectionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (message_tx, message_rx) = mpsc::channel(MESSAGE_BUFFER);
        let (lost_tx, _) = watch::channel(0);

        Self {
            inner: Arc::new(Inner {
                config,
                device: Mutex::new(None),
                state_tx,
                link: Mutex::new(None),
                translator: Mutex::new(Translator::new()),
                message_tx,
                message_rx: Mutex::new(Some(message_rx)),
                lost_tx,
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Start connecting
    ///
    /// Resolves the receiver (running discovery when host or model is not
    /// configured) and returns as soon as the connect is under way; use
    /// [`wait_for_connect`](Self::wait_for_connect) to wait for the socket.
    /// Calling this while connected or connecting leaves the socket alone.
    pub async fn connect(&self) -> Result<DeviceInfo> {
        self.start_connect(false).await
    }

    async fn start_connect(&self, retry_on_failure: bool) -> Result<DeviceInfo> {
        let device = self.resolve_device().await?;

        let started = self.inner.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            tracing::debug!(device = %device.identity(), "Already connected or connecting");
            return Ok(device);
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(establish(
            Arc::downgrade(&self.inner),
            device.clone(),
            generation,
            retry_on_failure,
        ));

        Ok(device)
    }

    /// Wait until the connection is up
    ///
    /// Does not cancel a connect in progress when the wait expires.
    pub async fn wait_for_connect(&self, wait: Duration) -> Result<()> {
        let mut state_rx = self.inner.state_tx.subscribe();
        let connected = timeout(wait, async move {
            state_rx
                .wait_for(|state| *state == ConnectionState::Connected)
                .await
                .is_ok()
        })
        .await;

        match connected {
            Ok(true) => Ok(()),
            Ok(false) => Err(EiscpError::NotConnected),
            Err(_) => Err(EiscpError::ConnectionTimeout(wait)),
        }
    }

    /// Close the socket; no-op when not connected
    pub fn disconnect(&self) {
        let closed = {
            let mut link = self.inner.link.lock().unwrap();
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            let closed = link.take();
            self.inner.state_tx.send_if_modified(|state| {
                let changed = *state != ConnectionState::Disconnected;
                *state = ConnectionState::Disconnected;
                changed
            });
            closed
        };

        if closed.is_some() {
            if let Some(device) = self.device() {
                tracing::info!(device = %device.identity(), "Disconnected");
            }
        }
    }

    /// Translate a command and send it
    pub async fn send(&self, command: &Command) -> Result<()> {
        let wire = self.inner.translator.lock().unwrap().command_to_wire(command)?;
        self.send_raw(&wire).await
    }

    /// Send a raw ISCP message such as `"PWR01"`
    ///
    /// Completes once the frame is written and the send delay has passed.
    pub async fn send_raw(&self, message: &str) -> Result<()> {
        let handle = {
            let link = self.inner.link.lock().unwrap();
            match link.as_ref() {
                Some(link) if self.state() == ConnectionState::Connected => link.queue.handle(),
                _ => return Err(EiscpError::NotConnected),
            }
        };

        tracing::debug!("Sending: {}", message);
        handle.send(protocol::encode(message)).await
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch connection state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Watch for sockets that the receiver closed or that failed
    ///
    /// The value counts such losses; a requested [`disconnect`](Self::disconnect)
    /// is not one.
    pub fn subscribe_link_lost(&self) -> watch::Receiver<u64> {
        self.inner.lost_tx.subscribe()
    }

    /// Receiver this connection talks to, once resolved
    pub fn device(&self) -> Option<DeviceInfo> {
        self.inner.device.lock().unwrap().clone()
    }

    /// Take the stream of decoded messages
    ///
    /// There is one receiver per connection; later calls fail.
    pub fn take_messages(&self) -> Result<MessageReceiver> {
        self.inner
            .message_rx
            .lock()
            .unwrap()
            .take()
            .map(MessageReceiver::new)
            .ok_or_else(|| EiscpError::ChannelError("message receiver already taken".to_string()))
    }

    async fn resolve_device(&self) -> Result<DeviceInfo> {
        let cached = self.inner.device.lock().unwrap().clone();
        if let Some(device) = cached {
            return Ok(device);
        }

        let config = &self.inner.config;
        let device = match (&config.host, &config.model) {
            (Some(host), Some(model)) => DeviceInfo {
                host: host.clone(),
                port: config.port,
                model: model.clone(),
            },
            (host, _) => {
                // A known host is asked directly; otherwise broadcast
                let options = DiscoveryOptions {
                    address: host.clone().unwrap_or_else(|| config.discovery.address.clone()),
                    devices: 1,
                    ..config.discovery.clone()
                };
                tracing::info!("Receiver not fully configured, running discovery");
                discover(&options)
                    .await?
                    .first()
                    .map(|found| found.device_info())
                    .ok_or(EiscpError::DiscoveryFailed)?
            }
        };

        *self.inner.device.lock().unwrap() = Some(device.clone());
        Ok(device)
    }
}

impl Inner {
    /// Socket for `generation` went away on its own
    fn on_closed(self: &Arc<Self>, generation: u64) {
        let closed = {
            let mut link = self.link.lock().unwrap();
            if link.as_ref().map(|l| l.generation) != Some(generation) {
                return;
            }
            let closed = link.take();
            self.state_tx.send_replace(ConnectionState::Disconnected);
            closed
        };
        self.lost_tx.send_modify(|lost| *lost += 1);

        if self.config.reconnect_on_close {
            self.schedule_retry(generation);
        }

        // Aborts the reader, which may be the caller
        drop(closed);
    }

    /// Connect attempt for `generation` failed
    ///
    /// A failed retry arms the next one, so a lost receiver is retried until
    /// it answers or the connection is disconnected.
    fn on_connect_failed(self: &Arc<Self>, generation: u64, retry: bool) {
        let current = {
            let link = self.link.lock().unwrap();
            let current = self.generation.load(Ordering::SeqCst) == generation && link.is_none();
            if current {
                self.state_tx.send_replace(ConnectionState::Disconnected);
            }
            current
        };

        if current && retry && self.config.reconnect_on_close {
            self.schedule_retry(generation);
        }
    }

    /// Connect again after `reconnect_sleep` unless `generation` is superseded
    fn schedule_retry(self: &Arc<Self>, generation: u64) {
        let delay = self.config.reconnect_sleep();
        tracing::info!("Reconnecting in {:?}", delay);
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            // Skip if someone disconnected or connected in the meantime
            if inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            let connection = AvrConnection { inner };
            if let Err(e) = connection.start_connect(true).await {
                tracing::warn!("Reconnect after close failed: {}", e);
            }
        });
    }
}

async fn establish(inner: Weak<Inner>, device: DeviceInfo, generation: u64, retry: bool) {
    let address = format!("{}:{}", device.host, device.port);
    tracing::info!(device = %device.identity(), "Connecting to {}", address);

    let result = timeout(CONNECT_TIMEOUT, TcpStream::connect(&address)).await;
    let Some(inner) = inner.upgrade() else {
        return;
    };

    let stream = match result {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::warn!(device = %device.identity(), "Failed to connect to {}: {}", address, e);
            inner.on_connect_failed(generation, retry);
            return;
        }
        Err(_) => {
            tracing::warn!(device = %device.identity(), "Connect to {} timed out", address);
            inner.on_connect_failed(generation, retry);
            return;
        }
    };

    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Failed to set TCP_NODELAY: {}", e);
    }
    let (read_half, write_half) = stream.into_split();

    let mut link = inner.link.lock().unwrap();
    if inner.generation.load(Ordering::SeqCst) != generation {
        tracing::debug!(device = %device.identity(), "Connect superseded, dropping socket");
        return;
    }

    let queue = CommandQueue::spawn(write_half, inner.config.send_delay());
    let reader = tokio::spawn(read_loop(
        read_half,
        Arc::downgrade(&inner),
        inner.message_tx.clone(),
        generation,
    ));
    *link = Some(Link {
        queue,
        reader,
        generation,
    });
    inner.state_tx.send_replace(ConnectionState::Connected);
    drop(link);

    tracing::info!(device = %device.identity(), "Connected to {}", address);
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    inner: Weak<Inner>,
    messages: mpsc::Sender<DecodedMessage>,
    generation: u64,
) {
    loop {
        match protocol::read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                let message = protocol::decode(&frame);
                let prefix: String = message.chars().take(3).collect();
                if translator::is_ignored(&prefix) {
                    continue;
                }

                let Some(shared) = inner.upgrade() else {
                    return;
                };
                let decoded = shared.translator.lock().unwrap().wire_to_command(&message);
                tracing::debug!("Received: {} -> {}", message, decoded.command);

                if let Err(mpsc::error::TrySendError::Full(dropped)) = messages.try_send(decoded) {
                    tracing::warn!("Message buffer full, dropping {}", dropped.command);
                }
            }
            Ok(None) => {
                tracing::info!("Receiver closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!("Connection error: {}", e);
                break;
            }
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.on_closed(generation);
    }
}

impl Reconnectable for AvrConnection {
    fn try_connect(&self, wait: Duration) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.connect().await?;
            self.wait_for_connect(wait).await
        })
    }
}

impl CommandSink for AvrConnection {
    fn send_command<'a>(&'a self, command: &'a Command) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.send(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    /// Port with nothing listening on it
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn send_while_disconnected_fails() {
        let connection = AvrConnection::new(config_for(closed_port().await));

        assert!(matches!(
            connection.send(&Command::new("system-power", "on")).await,
            Err(EiscpError::NotConnected)
        ));
        assert!(matches!(connection.send_raw("PWR01").await, Err(EiscpError::NotConnected)));
    }

    #[tokio::test]
    async fn unknown_command_is_rejected_before_sending() {
        let connection = AvrConnection::new(config_for(closed_port().await));

        assert!(matches!(
            connection.send(&Command::new("no-such-command", "on")).await,
            Err(EiscpError::UnknownCommand { .. })
        ));
    }

    #[tokio::test]
    async fn messages_can_be_taken_once() {
        let connection = AvrConnection::new(config_for(closed_port().await));

        assert!(connection.take_messages().is_ok());
        assert!(matches!(connection.take_messages(), Err(EiscpError::ChannelError(_))));
    }

    #[tokio::test]
    async fn refused_connect_times_out_and_returns_to_disconnected() {
        let connection = AvrConnection::new(config_for(closed_port().await));

        let device = connection.connect().await.unwrap();
        assert_eq!(device.model, "TX-NR609");

        let result = connection.wait_for_connect(Duration::from_millis(300)).await;
        assert!(matches!(result, Err(EiscpError::ConnectionTimeout(_))));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn connect_reaches_connected_and_disconnect_resets() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            socket
        });

        let connection = AvrConnection::new(config_for(port));
        connection.connect().await.unwrap();
        connection.wait_for_connect(Duration::from_secs(2)).await.unwrap();
        assert!(connection.is_connected());

        // A second connect keeps the existing socket
        connection.connect().await.unwrap();
        assert!(connection.is_connected());

        connection.send_raw("PWRQSTN").await.unwrap();

        connection.disconnect();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        connection.disconnect();

        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn only_remote_close_counts_as_lost() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connection = AvrConnection::new(config_for(port));
        let mut lost = connection.subscribe_link_lost();

        connection.connect().await.unwrap();
        let (socket, _) = listener.accept().await.unwrap();
        connection.wait_for_connect(Duration::from_secs(2)).await.unwrap();
        drop(socket);

        timeout(Duration::from_secs(2), lost.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*lost.borrow_and_update(), 1);
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        connection.connect().await.unwrap();
        let (_socket, _) = listener.accept().await.unwrap();
        connection.wait_for_connect(Duration::from_secs(2)).await.unwrap();
        connection.disconnect();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!lost.has_changed().unwrap());
    }
}
