//! Filedrop Client
//!
//! Sends a single local file to a filedrop server over one connection.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;

use super::connection::{Connection, ConnectionError};
use super::{EventSink, NetworkConfig, Progress, TransferEvent};
use crate::protocol::{CodecError, Header};
use crate::storage::{SourceFile, StorageError};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Source file error: {0}")]
    Source(#[from] StorageError),

    #[error("No usable filename in {0}")]
    InvalidFilename(PathBuf),

    #[error("Encoding error: {0}")]
    Encoding(#[from] CodecError),

    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        source: ConnectionError,
    },

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Short transfer: declared {declared} bytes, sent {sent}")]
    ShortTransfer { declared: u64, sent: u64 },
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Outcome of a completed send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    /// Name transmitted in the header
    pub filename: String,
    /// Address the file was sent to
    pub server_addr: SocketAddr,
    /// Content length declared in the header
    pub declared: u64,
    /// Body bytes actually written
    pub sent: u64,
}

/// Filedrop Client
pub struct Client {
    /// Client configuration
    config: NetworkConfig,
    /// Event sender
    events: EventSink,
}

impl Client {
    /// Create a new client. Events are discarded until someone subscribes.
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            events: EventSink::disabled(),
        }
    }

    /// Subscribe to transfer events (can only be called once).
    ///
    /// The receiver must be drained: lifecycle events wait for space.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<TransferEvent>> {
        if self.events.is_enabled() {
            return None;
        }

        let (events, event_rx) = EventSink::channel();
        self.events = events;
        Some(event_rx)
    }

    /// Open `path` and send it
    pub async fn send(&self, path: impl AsRef<Path>) -> ClientResult<SendReport> {
        let source = SourceFile::open(path.as_ref()).await?;
        self.send_source(source).await
    }

    /// Send an already opened file.
    ///
    /// The declared length is the size captured when the file was opened.
    /// If the file shrinks before the body is fully streamed the connection
    /// is still closed, then `ShortTransfer` is returned.
    pub async fn send_source(&self, mut source: SourceFile) -> ClientResult<SendReport> {
        let filename = source
            .file_name()
            .ok_or_else(|| ClientError::InvalidFilename(source.path().to_path_buf()))?
            .to_string();
        let header = Header::new(filename.clone(), source.size())?;
        let declared = u64::from(header.content_length);

        let mut conn = self.connect().await?;
        let server_addr = conn.remote_addr();

        conn.write_header(&header).await?;

        tracing::info!("Sending file: {} ({} bytes)", filename, declared);
        self.events.emit(TransferEvent::Started {
            peer: server_addr,
            filename: filename.clone(),
            total: declared,
        })
        .await;

        let sent = self
            .stream_body(&mut source, &mut conn, &filename, declared)
            .await?;
        let closed = conn.close().await;

        if sent != declared {
            return Err(ClientError::ShortTransfer { declared, sent });
        }
        closed?;

        tracing::info!("File sent successfully: {} ({} bytes)", filename, sent);
        tracing::debug!("{} bytes written to {}", conn.stats().bytes_sent, server_addr);
        self.events.emit(TransferEvent::Completed {
            peer: server_addr,
            filename: filename.clone(),
            bytes: sent,
            path: source.path().to_path_buf(),
        })
        .await;

        Ok(SendReport {
            filename,
            server_addr,
            declared,
            sent,
        })
    }

    async fn connect(&self) -> ClientResult<Connection> {
        let endpoint = &self.config.endpoint;
        let connect_err = |source: ConnectionError| ClientError::Connect {
            endpoint: endpoint.to_string(),
            source,
        };

        let addr = endpoint
            .resolve()
            .await
            .map_err(|e| connect_err(e.into()))?;

        tracing::info!("Connecting to {}", addr);
        let conn = Connection::connect(addr, self.config.connect_timeout, self.config.io_timeout)
            .await
            .map_err(connect_err)?;

        self.events.emit(TransferEvent::Connected { peer: addr }).await;
        Ok(conn)
    }

    /// Copy file bytes to the connection until EOF or `declared` is reached
    async fn stream_body(
        &self,
        source: &mut SourceFile,
        conn: &mut Connection,
        filename: &str,
        declared: u64,
    ) -> ClientResult<u64> {
        let mut buf = vec![0u8; self.config.chunk_size.max(1)];
        let mut sent = 0u64;

        while sent < declared {
            let want = (declared - sent).min(buf.len() as u64) as usize;
            let n = source.read_chunk(&mut buf[..want]).await?;
            if n == 0 {
                break;
            }

            conn.write_chunk(&buf[..n]).await?;
            sent += n as u64;

            self.events.emit(TransferEvent::Progress {
                peer: conn.remote_addr(),
                filename: filename.to_string(),
                progress: Progress::new(sent, declared),
            })
            .await;
        }

        Ok(sent)
    }
}
