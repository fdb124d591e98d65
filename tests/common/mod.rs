#![allow(dead_code)]

use eiscp_avr::protocol;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Clone)]
enum Control {
    Send(String),
    Close,
}

/// Receiver stand-in on loopback
///
/// Records every telegram it receives and answers the ones listed in its
/// reply table.
pub struct FakeReceiver {
    pub port: u16,
    frames: Arc<Mutex<Vec<(Instant, String)>>>,
    accepts: Arc<AtomicUsize>,
    control: broadcast::Sender<Control>,
}

impl FakeReceiver {
    pub async fn start() -> Self {
        Self::with_replies(&[]).await
    }

    pub async fn with_replies(replies: &[(&str, &str)]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::listen(listener, replies)
    }

    /// Start on a port chosen earlier, such as one a client already retries
    pub async fn start_on(port: u16) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        Self::listen(listener, &[])
    }

    fn listen(listener: TcpListener, replies: &[(&str, &str)]) -> Self {
        let port = listener.local_addr().unwrap().port();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let accepts = Arc::new(AtomicUsize::new(0));
        let (control, _) = broadcast::channel(16);
        let replies: Arc<HashMap<String, String>> = Arc::new(
            replies
                .iter()
                .map(|(query, reply)| (query.to_string(), reply.to_string()))
                .collect(),
        );

        let frames_task = frames.clone();
        let accepts_task = accepts.clone();
        let control_task = control.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                // Subscribe before counting so a counted client sees every push
                let control_rx = control_task.subscribe();
                accepts_task.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(socket, frames_task.clone(), replies.clone(), control_rx));
            }
        });

        Self {
            port,
            frames,
            accepts,
            control,
        }
    }

    /// Messages received so far, without framing
    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().unwrap().iter().map(|(_, m)| m.clone()).collect()
    }

    pub fn frame_times(&self) -> Vec<Instant> {
        self.frames.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }

    pub fn clear_frames(&self) {
        self.frames.lock().unwrap().clear();
    }

    pub fn accepts(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }

    /// Send a telegram to every connected client
    pub fn push(&self, message: &str) {
        let _ = self.control.send(Control::Send(message.to_string()));
    }

    /// Close every client connection; the listener keeps accepting
    pub fn drop_clients(&self) {
        let _ = self.control.send(Control::Close);
    }

    /// Wait until `count` connections have been accepted
    pub async fn wait_for_clients(&self, count: usize, limit: Duration) -> bool {
        wait_until(limit, || self.accepts() >= count).await
    }

    /// Wait until `count` frames have arrived
    pub async fn wait_for_frames(&self, count: usize, limit: Duration) -> bool {
        wait_until(limit, || self.frames.lock().unwrap().len() >= count).await
    }
}

async fn serve(
    socket: TcpStream,
    frames: Arc<Mutex<Vec<(Instant, String)>>>,
    replies: Arc<HashMap<String, String>>,
    mut control: broadcast::Receiver<Control>,
) {
    let (mut reader, mut writer) = socket.into_split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<String>();

    let reader_task = tokio::spawn(async move {
        while let Ok(Some(frame)) = protocol::read_frame(&mut reader).await {
            let message = protocol::decode(&frame);
            frames.lock().unwrap().push((Instant::now(), message.clone()));
            if let Some(reply) = replies.get(&message) {
                let _ = reply_tx.send(reply.clone());
            }
        }
    });

    loop {
        let outgoing = tokio::select! {
            reply = reply_rx.recv() => match reply {
                Some(reply) => reply,
                None => break,
            },
            control = control.recv() => match control {
                Ok(Control::Send(message)) => message,
                Ok(Control::Close) | Err(_) => break,
            },
        };
        if writer.write_all(&receiver_frame(&outgoing)).await.is_err() {
            break;
        }
    }

    reader_task.abort();
}

/// Frame the way a receiver does: `!1<message>` followed by EOF CR LF
pub fn receiver_frame(message: &str) -> Vec<u8> {
    protocol::encode(&format!("!1{}\x1a", message))
}

/// UDP responder answering discovery queries
pub struct FakeResponder {
    pub port: u16,
    queries: Arc<AtomicUsize>,
}

impl FakeResponder {
    /// Answer each query with `answers` copies of the ECN reply
    pub async fn start(model: &str, tcp_port: u16, answers: usize) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let queries = Arc::new(AtomicUsize::new(0));
        let reply = protocol::encode(&format!("!1ECN{}/{}/DX/0009B0123456\x1a", model, tcp_port));

        let counter = queries.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                if protocol::decode(&buf[..len]) != "ECNQSTN" {
                    continue;
                }
                counter.fetch_add(1, Ordering::SeqCst);
                for _ in 0..answers {
                    let _ = socket.send_to(&reply, from).await;
                }
            }
        });

        Self { port, queries }
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

/// Poll `check` every 10 ms until it holds or `limit` passes
pub async fn wait_until<F>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
