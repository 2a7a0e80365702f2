//! Local TCP transport between the kernel and the interpreter.
//!
//! The kernel binds an ephemeral loopback port *before* spawning the
//! interpreter and passes the port on its command line; the interpreter
//! connects back exactly once. After that, a reader task decodes frames and
//! forwards them as [`TransportEvent`]s, so connection loss arrives as an
//! event rather than as a failed call.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Mutex as StdMutex;

use log::{debug, error, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection::{send_frame, FramedReader};
use crate::protocol::{Request, Response};

/// Events produced by the connection's reader task.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A well-formed response frame.
    Response(Response),
    /// The far end closed the socket or the stream became unreadable.
    Closed { reason: String },
}

/// Listening socket awaiting the interpreter's single connection.
pub struct Listener {
    listener: TcpListener,
    port: u16,
}

impl Listener {
    /// Bind an ephemeral port on 127.0.0.1.
    pub async fn bind() -> std::io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let port = listener.local_addr()?.port();
        debug!("[transport] Listening on 127.0.0.1:{}", port);
        Ok(Self { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept the interpreter's connection. Consumes the listener: one
    /// connection per process lifetime.
    pub async fn accept(self) -> std::io::Result<TcpStream> {
        let (stream, addr) = self.listener.accept().await?;
        info!(
            "[transport] Interpreter connected from {} on port {}",
            addr, self.port
        );
        Ok(stream)
    }
}

/// An established connection to the interpreter.
pub struct Connection {
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
    peer: Option<SocketAddr>,
}

impl Connection {
    /// Take ownership of `stream` and start the reader task.
    pub fn open(stream: TcpStream) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let peer = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!("[transport] set_nodelay failed: {}", e);
        }
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(read_loop(read_half, tx));

        (
            Self {
                writer: tokio::sync::Mutex::new(Some(write_half)),
                reader_task: StdMutex::new(Some(reader_task)),
                peer,
            },
            rx,
        )
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Write one request frame.
    pub async fn send(&self, request: &Request) -> std::io::Result<()> {
        let data = serde_json::to_vec(request)?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "connection closed")
        })?;
        send_frame(writer, &data).await
    }

    /// Release the socket. Safe to call more than once.
    pub async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.abort_reader();
    }

    fn abort_reader(&self) {
        let task = self
            .reader_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.abort_reader();
    }
}

async fn read_loop(read_half: OwnedReadHalf, events: mpsc::UnboundedSender<TransportEvent>) {
    let mut reader = FramedReader::new(read_half);
    loop {
        match reader.next_frame().await {
            Ok(Some(frame)) => match serde_json::from_slice::<Response>(&frame) {
                Ok(response) => {
                    if events.send(TransportEvent::Response(response)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(
                        "[transport] Dropping malformed response ({} bytes): {}",
                        frame.len(),
                        e
                    );
                }
            },
            Ok(None) => {
                info!("[transport] Interpreter closed the connection");
                let _ = events.send(TransportEvent::Closed {
                    reason: "closed by interpreter".to_string(),
                });
                break;
            }
            Err(e) => {
                error!("[transport] Read error: {}", e);
                let _ = events.send(TransportEvent::Closed {
                    reason: e.to_string(),
                });
                break;
            }
        }
    }
}
