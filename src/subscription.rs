use tokio::sync::mpsc;

use crate::error::{EiscpError, Result};
use crate::types::DecodedMessage;

/// Receiver for decoded messages from one receiver connection
///
/// There is exactly one `MessageReceiver` per connection; it stays valid
/// across reconnects and ends only when the connection itself is dropped.
pub struct MessageReceiver {
    rx: mpsc::Receiver<DecodedMessage>,
}

impl MessageReceiver {
    pub(crate) fn new(rx: mpsc::Receiver<DecodedMessage>) -> Self {
        Self { rx }
    }

    /// Receive the next decoded message
    ///
    /// Returns `None` once the connection has been dropped.
    pub async fn recv(&mut self) -> Option<DecodedMessage> {
        self.rx.recv().await
    }

    /// Try to receive a message without blocking
    ///
    /// Returns `Ok(None)` if no message is available.
    pub fn try_recv(&mut self) -> Result<Option<DecodedMessage>> {
        match self.rx.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(EiscpError::ChannelError(
                "connection dropped".to_string(),
            )),
        }
    }
}
