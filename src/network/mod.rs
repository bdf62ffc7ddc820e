//! Network module - Handles TCP communication between sender and receiver
//!
//! Provides:
//! - Server for accepting uploads (one receiver task per connection)
//! - Client for sending a single file
//! - Connection wrapper with optional I/O deadlines and byte counters

mod client;
mod connection;
mod receiver;
mod server;

pub use client::Client;
pub use server::Server;

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::protocol::{DEFAULT_CHUNK_SIZE, DEFAULT_HOST, DEFAULT_PORT};

/// Capacity of the event channel handed out by `take_event_receiver`
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Slots intermediate progress updates leave free for lifecycle events
const PROGRESS_HEADROOM: usize = 16;

/// A host/port pair, resolved lazily
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolve to the first matching socket address
    pub async fn resolve(&self) -> std::io::Result<SocketAddr> {
        resolve_host(&self.host, self.port).await
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Address to listen on or connect to
    pub endpoint: Endpoint,
    /// Size of the buffer used to stream file bodies
    pub chunk_size: usize,
    /// Client connect timeout
    pub connect_timeout: Option<Duration>,
    /// Per-operation read/write deadline; `None` waits forever
    pub io_timeout: Option<Duration>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            connect_timeout: Some(Duration::from_millis(5000)),
            io_timeout: None,
        }
    }
}

impl NetworkConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            ..Default::default()
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = Some(timeout);
        self
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let mut addrs = lookup_host((host, port)).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}

/// Bytes moved so far against the declared total
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub transferred: u64,
    pub total: u64,
}

impl Progress {
    pub fn new(transferred: u64, total: u64) -> Self {
        Self { transferred, total }
    }

    /// Fraction complete in `[0, 1]`; an empty transfer counts as complete
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.transferred as f64 / self.total as f64
        }
    }

    pub fn percent(&self) -> f64 {
        self.fraction() * 100.0
    }

    pub fn is_complete(&self) -> bool {
        self.transferred >= self.total
    }
}

/// Events emitted by the server and the client
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Listener bound
    Listening { bind_addr: SocketAddr },
    /// A connection was accepted (server) or established (client)
    Connected { peer: SocketAddr },
    /// Header exchanged, body about to stream
    Started {
        peer: SocketAddr,
        filename: String,
        total: u64,
    },
    /// Body bytes moved
    Progress {
        peer: SocketAddr,
        filename: String,
        progress: Progress,
    },
    /// Transfer finished
    Completed {
        peer: SocketAddr,
        filename: String,
        bytes: u64,
        path: PathBuf,
    },
    /// Transfer aborted
    Failed { peer: SocketAddr, reason: String },
}

/// Event sender shared by the server, its receivers and the client.
///
/// Lifecycle events and the final progress update wait for channel space.
/// Intermediate progress updates are skipped once the channel is nearly
/// full, so a slow consumer sees fewer of them but always learns how a
/// transfer ended. A disabled sink discards everything.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<TransferEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::Receiver<TransferEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub async fn emit(&self, event: TransferEvent) {
        let tx = match &self.tx {
            Some(tx) => tx,
            None => return,
        };

        match &event {
            TransferEvent::Progress { progress, .. } if !progress.is_complete() => {
                if tx.capacity() <= PROGRESS_HEADROOM {
                    tracing::trace!("Event channel busy, skipping progress update");
                    return;
                }
                if let Err(e) = tx.try_send(event) {
                    tracing::trace!("Dropping progress update: {}", e);
                }
            }
            _ => {
                if tx.send(event).await.is_err() {
                    tracing::trace!("Event receiver dropped");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_fraction() {
        assert_eq!(Progress::new(0, 0).fraction(), 1.0);
        assert_eq!(Progress::new(1, 4).percent(), 25.0);
        assert!(Progress::new(4, 4).is_complete());
        assert!(!Progress::new(3, 4).is_complete());
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::default().to_string(), "127.0.0.1:8080");
        assert_eq!(Endpoint::new("::1", 9000).to_string(), "[::1]:9000");
    }

    #[test]
    fn test_chunk_size_clamped() {
        let config = NetworkConfig::default().with_chunk_size(0);
        assert_eq!(config.chunk_size, 1);
    }

    #[tokio::test]
    async fn test_resolve_loopback() {
        let addr = Endpoint::new("127.0.0.1", 4242).resolve().await.unwrap();
        assert_eq!(addr, "127.0.0.1:4242".parse::<SocketAddr>().unwrap());
    }

    fn progress_event(peer: SocketAddr, transferred: u64, total: u64) -> TransferEvent {
        TransferEvent::Progress {
            peer,
            filename: "flood.bin".to_string(),
            progress: Progress::new(transferred, total),
        }
    }

    #[tokio::test]
    async fn test_progress_flood_keeps_room_for_outcome() {
        let (sink, mut rx) = EventSink::channel();
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();

        for i in 0..EVENT_CHANNEL_CAPACITY as u64 + 100 {
            sink.emit(progress_event(peer, i, 10_000)).await;
        }
        sink.emit(progress_event(peer, 10_000, 10_000)).await;
        sink.emit(TransferEvent::Completed {
            peer,
            filename: "flood.bin".to_string(),
            bytes: 10_000,
            path: PathBuf::from("flood.bin"),
        })
        .await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }

        assert_eq!(events.len(), EVENT_CHANNEL_CAPACITY - PROGRESS_HEADROOM + 2);
        assert!(matches!(
            &events[events.len() - 2],
            TransferEvent::Progress { progress, .. } if progress.is_complete()
        ));
        assert!(matches!(events.last(), Some(TransferEvent::Completed { bytes: 10_000, .. })));
    }

    #[tokio::test]
    async fn test_emit_without_consumer_returns() {
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();

        let (sink, rx) = EventSink::channel();
        drop(rx);
        for _ in 0..EVENT_CHANNEL_CAPACITY + 10 {
            sink.emit(TransferEvent::Connected { peer }).await;
        }

        let disabled = EventSink::disabled();
        assert!(!disabled.is_enabled());
        disabled.emit(TransferEvent::Connected { peer }).await;
    }
}
