use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep_until, timeout_at, Instant};

use crate::config::DiscoveryOptions;
use crate::error::Result;
use crate::protocol;
use crate::types::{DiscoveredDevice, DEFAULT_PORT};

/// Query sent to every receiver on the network (`x` addresses all unit types)
const DISCOVERY_QUERY: &str = "!xECNQSTN";

/// Pause after a failed receive before listening again
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Find receivers with a UDP broadcast
///
/// Collects answers until `options.devices` receivers have responded or
/// `options.timeout_secs` has elapsed, whichever comes first. An empty list is
/// not an error.
///
/// # Example
///
/// ```no_run
/// use eiscp_avr::{discover, DiscoveryOptions};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let options = DiscoveryOptions { devices: 5, ..Default::default() };
///     for device in discover(&options).await? {
///         println!("{} at {}:{}", device.model, device.host, device.port);
///     }
///     Ok(())
/// }
/// ```
pub async fn discover(options: &DiscoveryOptions) -> Result<Vec<DiscoveredDevice>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true)?;

    let target = format!("{}:{}", options.address, options.port);
    tracing::info!("Sending discovery query to {}", target);
    socket
        .send_to(&protocol::encode(DISCOVERY_QUERY), target.as_str())
        .await?;

    let deadline = Instant::now() + options.timeout();
    let mut devices: Vec<DiscoveredDevice> = Vec::new();
    let mut buf = [0u8; 1024];

    while devices.len() < options.devices && Instant::now() < deadline {
        let (len, from) = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                // ICMP unreachable and similar; keep listening until the deadline
                tracing::debug!("Discovery receive error: {}", e);
                sleep_until((Instant::now() + RECV_ERROR_BACKOFF).min(deadline)).await;
                continue;
            }
            Err(_) => break,
        };

        let message = protocol::decode(&buf[..len]);
        match parse_response(&message, from) {
            Some(device) => {
                if devices.iter().any(|d| d.host == device.host && d.port == device.port) {
                    continue;
                }
                tracing::info!("Discovered {} at {}:{}", device.model, device.host, device.port);
                devices.push(device);
            }
            None => tracing::debug!("Ignoring discovery reply from {}: {:?}", from, message),
        }
    }

    tracing::info!("Discovery finished with {} receiver(s)", devices.len());
    Ok(devices)
}

/// Parse `ECN<model>/<port>/<area>/<mac>` sent by `from`
fn parse_response(message: &str, from: SocketAddr) -> Option<DiscoveredDevice> {
    let info = message.strip_prefix("ECN")?;
    // Our own query, looped back by the broadcast
    if info.trim() == "QSTN" {
        return None;
    }
    let mut fields = info.split('/');

    let model = fields.next()?.trim().to_string();
    if model.is_empty() {
        return None;
    }
    let port = fields
        .next()
        .and_then(|p| p.trim().parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let area_code = fields.next().unwrap_or_default().trim().to_string();
    let mac = fields
        .next()
        .map(|m| m.chars().take(12).collect())
        .unwrap_or_default();

    Some(DiscoveredDevice {
        host: from.ip().to_string(),
        port,
        model,
        area_code,
        mac,
    })
}
