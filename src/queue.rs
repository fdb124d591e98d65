//! Outbound command queue.
//!
//! Receivers process one telegram at a time and silently drop telegrams that
//! arrive too close together, so every write is followed by a fixed pause
//! before the next one is issued.

use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{EiscpError, Result};

struct Job {
    frame: Vec<u8>,
    reply: oneshot::Sender<Result<()>>,
}

/// Cloneable handle for submitting frames to a [`CommandQueue`]
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::UnboundedSender<Job>,
}

impl QueueHandle {
    /// Queue a frame and wait until it has been written and the send delay has elapsed
    ///
    /// Fails with [`EiscpError::NotConnected`] if the queue has shut down,
    /// including for frames that were still waiting when the socket went away.
    pub async fn send(&self, frame: Vec<u8>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Job { frame, reply })
            .map_err(|_| EiscpError::NotConnected)?;

        rx.await.map_err(|_| EiscpError::NotConnected)?
    }
}

/// Single-writer FIFO bound to one socket
///
/// Dropping the queue stops the writer task and closes the write half.
pub struct CommandQueue {
    handle: QueueHandle,
    task: JoinHandle<()>,
}

impl CommandQueue {
    /// Spawn the writer task over `writer`
    pub fn spawn<W>(writer: W, send_delay: Duration) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_writer(writer, rx, send_delay));

        Self {
            handle: QueueHandle { tx },
            task,
        }
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_writer<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Job>, send_delay: Duration)
where
    W: AsyncWrite + Unpin,
{
    while let Some(job) = rx.recv().await {
        let written = async {
            writer.write_all(&job.frame).await?;
            writer.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                tokio::time::sleep(send_delay).await;
                let _ = job.reply.send(Ok(()));
            }
            Err(e) => {
                tracing::warn!("Failed to write command: {}", e);
                let _ = job.reply.send(Err(e.into()));
                break;
            }
        }
    }

    // Remaining jobs fail with NotConnected when rx is dropped
    tracing::debug!("Command queue writer stopped");
}
