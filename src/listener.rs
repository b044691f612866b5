//! Telemetry listener
//!
//! The robot scripts open TCP connections back to the PC and write their
//! progress as newline-terminated text. Any number of connections may be open
//! at once (the robot typically reconnects once per cycle), so each accepted
//! socket gets its own reader task and all of them feed one shared channel.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use crate::error::BindError;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Something the listener observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// One complete text line from a connected peer, without its terminator
    Line { peer: SocketAddr, text: String },
    /// Bind failures and per-connection read errors
    Diagnostic(String),
}

struct ActiveListener {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct TelemetryListener {
    bind_host: String,
    events: mpsc::Sender<ListenerEvent>,
    active: Option<ActiveListener>,
}

impl TelemetryListener {
    pub fn new(bind_host: &str, events: mpsc::Sender<ListenerEvent>) -> Self {
        Self {
            bind_host: bind_host.to_string(),
            events,
            active: None,
        }
    }

    /// Create a listener together with the receiving end of its event channel
    pub fn with_channel(bind_host: &str, capacity: usize) -> (Self, mpsc::Receiver<ListenerEvent>) {
        let (events, receiver) = mpsc::channel(capacity);
        (Self::new(bind_host, events), receiver)
    }

    pub fn is_listening(&self) -> bool {
        self.active.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.active.as_ref().map(|active| active.local_addr)
    }

    /// Bind and start accepting connections
    ///
    /// Calling this while already listening does nothing. A bind failure is
    /// also reported on the event channel, and the listener stays stopped so
    /// the call can be retried.
    pub async fn start(&mut self, port: u16) -> Result<SocketAddr, BindError> {
        if let Some(active) = &self.active {
            debug!("Telemetry listener already running on {}", active.local_addr);
            return Ok(active.local_addr);
        }

        let listener = match TcpListener::bind((self.bind_host.as_str(), port)).await {
            Ok(listener) => listener,
            Err(source) => {
                let error = BindError {
                    addr: format!("{}:{}", self.bind_host, port),
                    source,
                };
                error!("{}", error);
                let _ = self.events.send(ListenerEvent::Diagnostic(error.to_string())).await;
                return Err(error);
            }
        };

        let local_addr = listener.local_addr().map_err(|source| BindError {
            addr: format!("{}:{}", self.bind_host, port),
            source,
        })?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(listener, self.events.clone(), shutdown_rx));

        info!("Telemetry listener bound on {}", local_addr);
        self.active = Some(ActiveListener {
            local_addr,
            shutdown,
            task,
        });
        Ok(local_addr)
    }

    /// Stop accepting and reading, then release the socket
    ///
    /// Returns once every reader has unwound; nothing is emitted afterwards.
    pub async fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        let _ = active.shutdown.send(true);
        if let Err(e) = active.task.await {
            if e.is_panic() {
                error!("Telemetry accept loop panicked: {}", e);
            }
        }
        info!("Telemetry listener on {} stopped", active.local_addr);
    }
}

impl Drop for TelemetryListener {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    events: mpsc::Sender<ListenerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut readers = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    info!("Telemetry connection from {}", peer);
                    readers.spawn(read_connection(socket, peer, events.clone()));
                }
                Err(e) => accept_failed(&events, e).await,
            },
            Some(finished) = readers.join_next(), if !readers.is_empty() => {
                if let Err(e) = finished {
                    if e.is_panic() {
                        error!("Telemetry reader panicked: {}", e);
                    }
                }
            }
        }
    }

    // Aborts every reader and waits for them, so no line escapes after stop
    readers.shutdown().await;
    drop(listener);
}

/// Report an accept error, then pause so a persistent failure (EMFILE) cannot spin
async fn accept_failed(events: &mpsc::Sender<ListenerEvent>, error: std::io::Error) {
    warn!("Failed to accept telemetry connection: {}", error);
    let _ = events
        .send(ListenerEvent::Diagnostic(format!("accept failed: {}", error)))
        .await;
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

async fn read_connection(socket: TcpStream, peer: SocketAddr, events: mpsc::Sender<ListenerEvent>) {
    let mut reader = BufReader::new(socket);
    let mut buffer = Vec::new();

    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer).await {
            Ok(0) => {
                info!("Telemetry connection from {} closed", peer);
                break;
            }
            Ok(_) => {
                let text = decode_line(&buffer);
                if events.send(ListenerEvent::Line { peer, text }).await.is_err() {
                    debug!("Telemetry consumer gone, dropping connection from {}", peer);
                    break;
                }
            }
            Err(e) => {
                warn!("Read error on telemetry connection from {}: {}", peer, e);
                let _ = events
                    .send(ListenerEvent::Diagnostic(format!("read error from {}: {}", peer, e)))
                    .await;
                break;
            }
        }
    }
}

/// Decode one raw line, replacing invalid UTF-8 and dropping the terminator
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::io::AsyncWriteExt;

    async fn next_line(events: &mut mpsc::Receiver<ListenerEvent>) -> String {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for telemetry")
            .expect("listener channel closed");
        match event {
            ListenerEvent::Line { text, .. } => text,
            other => panic!("expected a line, got {:?}", other),
        }
    }

    #[test]
    fn decodes_lines_leniently() {
        assert_eq!(decode_line(b"RUN a END\r\n"), "RUN a END");
        assert_eq!(decode_line(b"partial"), "partial");
        assert_eq!(decode_line(b"bad \xff byte\n"), "bad \u{fffd} byte");
    }

    #[tokio::test]
    async fn accept_errors_are_reported_and_backed_off() {
        let (events, mut receiver) = mpsc::channel(4);
        let started = Instant::now();
        let error = std::io::Error::new(std::io::ErrorKind::Other, "too many open files");
        accept_failed(&events, error).await;

        assert!(started.elapsed() >= ACCEPT_BACKOFF);
        match receiver.try_recv() {
            Ok(ListenerEvent::Diagnostic(message)) => {
                assert!(message.contains("too many open files"))
            }
            other => panic!("expected a diagnostic, got {:?}", other),
        }
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn reads_from_concurrent_connections() {
        let (mut listener, mut events) = TelemetryListener::with_channel("127.0.0.1", 16);
        let addr = listener.start(0).await.unwrap();

        // First peer sends half a line and stays connected
        let mut slow = TcpStream::connect(addr).await.unwrap();
        slow.write_all(b"STEP EyesLocate").await.unwrap();

        let mut fast = TcpStream::connect(addr).await.unwrap();
        fast.write_all(b"RUN blaa_26 END\n").await.unwrap();
        assert_eq!(next_line(&mut events).await, "RUN blaa_26 END");

        slow.write_all(b" DONE cnt=2\r\n").await.unwrap();
        assert_eq!(next_line(&mut events).await, "STEP EyesLocate DONE cnt=2");

        // A closed peer does not disturb the others
        drop(fast);
        slow.write_all(b"STEP Place DONE color=RED\n").await.unwrap();
        assert_eq!(next_line(&mut events).await, "STEP Place DONE color=RED");

        listener.stop().await;
    }

    #[tokio::test]
    async fn trailing_partial_line_is_emitted_on_close() {
        let (mut listener, mut events) = TelemetryListener::with_channel("127.0.0.1", 16);
        let addr = listener.start(0).await.unwrap();

        let mut peer = TcpStream::connect(addr).await.unwrap();
        peer.write_all(b"first\nlast").await.unwrap();
        peer.shutdown().await.unwrap();
        drop(peer);

        assert_eq!(next_line(&mut events).await, "first");
        assert_eq!(next_line(&mut events).await, "last");
        listener.stop().await;
    }

    #[tokio::test]
    async fn second_start_is_a_no_op() {
        let (mut listener, _events) = TelemetryListener::with_channel("127.0.0.1", 16);
        let first = listener.start(0).await.unwrap();
        let second = listener.start(0).await.unwrap();
        assert_eq!(first, second);
        assert!(listener.is_listening());
        listener.stop().await;
        assert!(!listener.is_listening());
    }

    #[tokio::test]
    async fn stop_without_start_is_harmless() {
        let (mut listener, _events) = TelemetryListener::with_channel("127.0.0.1", 16);
        listener.stop().await;
        listener.stop().await;
        assert!(listener.local_addr().is_none());
    }

    #[tokio::test]
    async fn bind_failure_is_reported_and_retryable() {
        let occupant = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupant.local_addr().unwrap().port();

        let (mut listener, mut events) = TelemetryListener::with_channel("127.0.0.1", 16);
        let err = listener.start(port).await.unwrap_err();
        assert!(err.addr.ends_with(&port.to_string()));
        assert!(!listener.is_listening());

        match events.recv().await {
            Some(ListenerEvent::Diagnostic(message)) => assert!(message.contains("Failed to bind")),
            other => panic!("expected a diagnostic, got {:?}", other),
        }

        drop(occupant);
        listener.start(port).await.unwrap();
        assert!(listener.is_listening());
        listener.stop().await;
    }

    #[tokio::test]
    async fn stop_silences_open_connections_and_allows_restart() {
        let (mut listener, mut events) = TelemetryListener::with_channel("127.0.0.1", 16);
        let addr = listener.start(0).await.unwrap();

        let mut peer = TcpStream::connect(addr).await.unwrap();
        peer.write_all(b"before stop\nhalf a li").await.unwrap();
        assert_eq!(next_line(&mut events).await, "before stop");

        listener.stop().await;

        // Whatever the peer sends now goes nowhere
        let _ = peer.write_all(b"ne\nafter stop\n").await;
        let quiet = tokio::time::timeout(Duration::from_millis(200), events.recv()).await;
        assert!(quiet.is_err(), "received {:?} after stop", quiet);

        let restarted = listener.start(addr.port()).await.unwrap();
        assert_eq!(restarted.port(), addr.port());

        let mut again = TcpStream::connect(restarted).await.unwrap();
        again.write_all(b"RUN groen_26 END\n").await.unwrap();
        assert_eq!(next_line(&mut events).await, "RUN groen_26 END");
        listener.stop().await;
    }
}
