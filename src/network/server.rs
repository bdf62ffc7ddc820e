//! Filedrop Server
//!
//! Owns the listening socket and hands every accepted connection to its own
//! receiver task. Tasks are never awaited; their outcome is only logged and
//! emitted as an event.

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};

use super::connection::{Connection, ConnectionError};
use super::receiver::{ReceiveError, Receiver};
use super::{EventSink, NetworkConfig, TransferEvent};
use crate::storage::StorageRoot;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Filedrop Server
pub struct Server {
    /// Server configuration
    config: NetworkConfig,
    /// Per-connection receive logic
    receiver: Receiver,
    /// Event sender
    events: EventSink,
    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Whether the accept loop is running
    running: Arc<RwLock<bool>>,
    /// Address actually bound
    local_addr: Option<SocketAddr>,
}

impl Server {
    /// Create a new server storing uploads under `storage`.
    /// Events are discarded until someone subscribes.
    pub fn new(config: NetworkConfig, storage: StorageRoot) -> Self {
        let events = EventSink::disabled();
        let receiver = Receiver::new(storage, config.chunk_size, events.clone());

        Self {
            config,
            receiver,
            events,
            shutdown_tx: None,
            running: Arc::new(RwLock::new(false)),
            local_addr: None,
        }
    }

    /// Subscribe to server events (can only be called once, before `start`).
    ///
    /// The receiver must be drained: lifecycle events wait for space, so an
    /// receiver that is held but never read eventually stalls connection tasks.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<TransferEvent>> {
        if self.events.is_enabled() || self.local_addr.is_some() {
            return None;
        }

        let (events, event_rx) = EventSink::channel();
        self.receiver = Receiver::new(
            self.receiver.storage().clone(),
            self.config.chunk_size,
            events.clone(),
        );
        self.events = events;
        Some(event_rx)
    }

    /// Bind the listener and spawn the accept loop
    pub async fn start(&mut self) -> ServerResult<()> {
        {
            let running = self.running.read().await;
            if *running {
                return Err(ServerError::AlreadyRunning);
            }
        }

        let endpoint = &self.config.endpoint;
        let bind_addr = endpoint.resolve().await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to resolve {}: {}", endpoint, e))
        })?;
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);
        tracing::info!("Server listening on {}", local_addr);
        tracing::info!("Storing uploads in {}", self.receiver.storage().path().display());

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        {
            let mut running = self.running.write().await;
            *running = true;
        }

        self.events
            .emit(TransferEvent::Listening {
                bind_addr: local_addr,
            })
            .await;

        let receiver = self.receiver.clone();
        let events = self.events.clone();
        let io_timeout = self.config.io_timeout;
        let running = self.running.clone();

        // Spawn the accept loop
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                tracing::info!("New connection from {}", addr);
                                events.emit(TransferEvent::Connected { peer: addr }).await;

                                let conn = Connection::new(stream, addr, io_timeout);
                                let receiver = receiver.clone();
                                let events = events.clone();

                                tokio::spawn(async move {
                                    handle_connection(conn, receiver, events).await;
                                });
                            }
                            Err(e) => {
                                tracing::error!("Failed to accept connection: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Server shutdown requested");
                        break;
                    }
                }
            }

            let mut running = running.write().await;
            *running = false;
        });

        Ok(())
    }

    /// Stop accepting; transfers already in flight run to completion
    pub async fn stop(&mut self) -> ServerResult<()> {
        {
            let running = self.running.read().await;
            if !*running {
                return Err(ServerError::NotRunning);
            }
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }

        Ok(())
    }

    /// Check if the server is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Address the listener is bound to, once started (also after `stop`)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

/// Run one receiver to completion and report the outcome
async fn handle_connection(conn: Connection, receiver: Receiver, events: EventSink) {
    let peer = conn.remote_addr();

    match receiver.receive(conn).await {
        Ok(received) => {
            events
                .emit(TransferEvent::Completed {
                    peer,
                    filename: received.filename,
                    bytes: received.bytes,
                    path: received.path,
                })
                .await;
        }
        Err(ReceiveError::Connection(ConnectionError::Protocol(e))) if e.is_clean_close() => {
            tracing::debug!("Connection from {} closed without a request", peer);
        }
        Err(e) => {
            tracing::error!("Transfer from {} failed: {}", peer, e);
            events
                .emit(TransferEvent::Failed {
                    peer,
                    reason: e.to_string(),
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Client, Endpoint};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    async fn start_server(root: &Path) -> (Server, SocketAddr) {
        let config = NetworkConfig::new(Endpoint::new("127.0.0.1", 0));
        let mut server = Server::new(config, StorageRoot::new(root));
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();
        (server, addr)
    }

    /// Started server with its event receiver
    async fn start_subscribed(root: &Path) -> (Server, SocketAddr, mpsc::Receiver<TransferEvent>) {
        let config = NetworkConfig::new(Endpoint::new("127.0.0.1", 0));
        let mut server = Server::new(config, StorageRoot::new(root));
        let events = server.take_event_receiver().unwrap();
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();
        (server, addr, events)
    }

    fn client_for(addr: SocketAddr) -> Client {
        Client::new(NetworkConfig::new(Endpoint::new("127.0.0.1", addr.port())))
    }

    /// Poll until `path` holds exactly `expected`
    async fn wait_for_file(path: &Path, expected: &[u8]) {
        let poll = async {
            loop {
                if let Ok(data) = std::fs::read(path) {
                    if data == expected {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(10), poll)
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {}", path.display()));
    }

    /// Next Completed or Failed event
    async fn next_outcome(events: &mut mpsc::Receiver<TransferEvent>) -> TransferEvent {
        let wait = async {
            loop {
                match events.recv().await {
                    Some(event @ (TransferEvent::Completed { .. } | TransferEvent::Failed { .. })) => {
                        return event;
                    }
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .expect("timed out waiting for transfer outcome")
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_server_creation() {
        let dir = tempdir().unwrap();
        let server = Server::new(NetworkConfig::default(), StorageRoot::new(dir.path()));
        assert!(!server.is_running().await);
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_start_stop() {
        let dir = tempdir().unwrap();
        let (mut server, _) = start_server(dir.path()).await;
        assert!(server.is_running().await);
        assert!(matches!(server.start().await, Err(ServerError::AlreadyRunning)));

        server.stop().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!server.is_running().await);
        assert!(matches!(server.stop().await, Err(ServerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let dir = tempdir().unwrap();
        let (_server, addr) = start_server(dir.path()).await;

        let config = NetworkConfig::new(Endpoint::new("127.0.0.1", addr.port()));
        let mut second = Server::new(config, StorageRoot::new(dir.path()));
        assert!(matches!(second.start().await, Err(ServerError::BindFailed(_))));
    }

    #[tokio::test]
    async fn test_send_receive_boundary_sizes() {
        let storage = tempdir().unwrap();
        let source = tempdir().unwrap();
        let (_server, addr) = start_server(storage.path()).await;
        let client = client_for(addr);

        for size in [0usize, 1, 4095, 4096, 4097, 3 * 1024 * 1024 + 17] {
            let name = format!("file-{}.bin", size);
            let contents = pattern(size);
            std::fs::write(source.path().join(&name), &contents).unwrap();

            let report = client.send(source.path().join(&name)).await.unwrap();
            assert_eq!(report.filename, name);
            assert_eq!(report.declared, size as u64);
            assert_eq!(report.sent, size as u64);

            wait_for_file(&storage.path().join(&name), &contents).await;
        }
    }

    #[tokio::test]
    async fn test_completed_event() {
        let storage = tempdir().unwrap();
        let source = tempdir().unwrap();
        let (mut server, addr, mut events) = start_subscribed(storage.path()).await;
        assert!(server.take_event_receiver().is_none());

        std::fs::write(source.path().join("car.jpg"), [1u8, 2, 3]).unwrap();
        client_for(addr).send(source.path().join("car.jpg")).await.unwrap();

        match next_outcome(&mut events).await {
            TransferEvent::Completed {
                filename,
                bytes,
                path,
                ..
            } => {
                assert_eq!(filename, "car.jpg");
                assert_eq!(bytes, 3);
                assert_eq!(path, storage.path().join("car.jpg"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(std::fs::read(storage.path().join("car.jpg")).unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_failed_transfer_does_not_stop_accepting() {
        let storage = tempdir().unwrap();
        let source = tempdir().unwrap();
        let (_server, addr, mut events) = start_subscribed(storage.path()).await;

        // Header promises 100 bytes, only 2 arrive
        let mut raw = TcpStream::connect(addr).await.unwrap();
        raw.write_all(&[0, 0, 0, 5, b'b', b'r', b'o', b'k', b'e', 0, 0, 0, 100, 1, 2])
            .await
            .unwrap();
        raw.shutdown().await.unwrap();
        drop(raw);

        match next_outcome(&mut events).await {
            TransferEvent::Failed { reason, .. } => assert!(reason.contains("Truncated")),
            other => panic!("unexpected event: {:?}", other),
        }

        std::fs::write(source.path().join("after.txt"), b"still here").unwrap();
        client_for(addr).send(source.path().join("after.txt")).await.unwrap();
        wait_for_file(&storage.path().join("after.txt"), b"still here").await;
    }

    #[tokio::test]
    async fn test_outcome_survives_undrained_progress() {
        let storage = tempdir().unwrap();
        let source = tempdir().unwrap();
        let (_server, addr, mut events) = start_subscribed(storage.path()).await;

        let contents = pattern(3 * 1024 * 1024);
        std::fs::write(source.path().join("big.bin"), &contents).unwrap();
        client_for(addr).send(source.path().join("big.bin")).await.unwrap();
        wait_for_file(&storage.path().join("big.bin"), &contents).await;

        // Nothing was read while hundreds of progress updates were emitted
        match next_outcome(&mut events).await {
            TransferEvent::Completed { filename, bytes, .. } => {
                assert_eq!(filename, "big.bin");
                assert_eq!(bytes, contents.len() as u64);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_subscribe_after_start_is_refused() {
        let dir = tempdir().unwrap();
        let (mut server, _) = start_server(dir.path()).await;
        assert!(server.take_event_receiver().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_uploads_are_independent() {
        let storage = tempdir().unwrap();
        let source = tempdir().unwrap();
        let (_server, addr) = start_server(storage.path()).await;

        // A stalled peer holds its connection open without finishing
        let mut stalled = TcpStream::connect(addr).await.unwrap();
        stalled
            .write_all(&[0, 0, 0, 9, b's', b't', b'a', b'l', b'l', b'e', b'd', b'.', b'x', 0, 0, 1, 0])
            .await
            .unwrap();

        let first = pattern(256 * 1024);
        let second = pattern(5000);
        std::fs::write(source.path().join("first.bin"), &first).unwrap();
        std::fs::write(source.path().join("second.bin"), &second).unwrap();

        let client = client_for(addr);
        let (a, b) = tokio::join!(
            client.send(source.path().join("first.bin")),
            client.send(source.path().join("second.bin"))
        );
        a.unwrap();
        b.unwrap();

        wait_for_file(&storage.path().join("first.bin"), &first).await;
        wait_for_file(&storage.path().join("second.bin"), &second).await;
        drop(stalled);
    }

    #[tokio::test]
    async fn test_io_timeout_releases_stalled_peer() {
        let storage = tempdir().unwrap();
        let config = NetworkConfig::new(Endpoint::new("127.0.0.1", 0))
            .with_io_timeout(Duration::from_millis(100));
        let mut server = Server::new(config, StorageRoot::new(storage.path()));
        let mut events = server.take_event_receiver().unwrap();
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let mut stalled = TcpStream::connect(addr).await.unwrap();
        stalled.write_all(&[0, 0, 0, 3, b'a']).await.unwrap();

        match next_outcome(&mut events).await {
            TransferEvent::Failed { reason, .. } => assert!(reason.contains("timeout")),
            other => panic!("unexpected event: {:?}", other),
        }
        drop(stalled);
    }
}
