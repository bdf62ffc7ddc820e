//! Transfer receiver
//!
//! Handles one accepted connection: decode the header, then stream exactly
//! the declared number of body bytes into a fresh file under the storage
//! root.

use std::path::PathBuf;
use thiserror::Error;

use super::connection::{Connection, ConnectionError};
use super::{EventSink, Progress, TransferEvent};
use crate::protocol::base_name;
use crate::storage::{StorageError, StorageRoot};

/// Receive errors
#[derive(Error, Debug)]
pub enum ReceiveError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Invalid filename: {0:?}")]
    InvalidFilename(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Truncated transfer: expected {expected} bytes, received {received}")]
    Truncated { expected: u64, received: u64 },
}

pub type ReceiveResult<T> = Result<T, ReceiveError>;

/// Outcome of a completed receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    /// Normalized base name the file was stored under
    pub filename: String,
    /// Full destination path
    pub path: PathBuf,
    /// Body bytes written
    pub bytes: u64,
}

/// Per-connection receive logic, cloned into each connection task
#[derive(Debug, Clone)]
pub struct Receiver {
    storage: StorageRoot,
    chunk_size: usize,
    events: EventSink,
}

impl Receiver {
    pub fn new(storage: StorageRoot, chunk_size: usize, events: EventSink) -> Self {
        Self {
            storage,
            chunk_size: chunk_size.max(1),
            events,
        }
    }

    pub fn storage(&self) -> &StorageRoot {
        &self.storage
    }

    /// Receive one request. The connection is consumed and closed either way.
    pub async fn receive(&self, mut conn: Connection) -> ReceiveResult<Received> {
        let peer = conn.remote_addr();
        let header = conn.read_header().await?;

        let filename = base_name(&header.filename)
            .ok_or_else(|| ReceiveError::InvalidFilename(header.filename.clone()))?
            .to_string();
        let total = u64::from(header.content_length);

        if filename != header.filename {
            tracing::debug!("Normalized {:?} to {:?}", header.filename, filename);
        }
        tracing::info!("Receiving file: {} ({} bytes) from {}", filename, total, peer);
        self.events.emit(TransferEvent::Started {
            peer,
            filename: filename.clone(),
            total,
        })
        .await;

        self.storage.ensure().await?;
        let mut file = self.storage.create(&filename).await?;

        let mut buf = vec![0u8; self.chunk_size];
        let mut received = 0u64;

        while received < total {
            let want = (total - received).min(buf.len() as u64) as usize;
            let n = conn.read_chunk(&mut buf[..want]).await?;
            if n == 0 {
                // Partial file stays on disk
                if let Err(e) = file.finish().await {
                    tracing::warn!("Failed to flush partial upload from {}: {}", peer, e);
                }
                return Err(ReceiveError::Truncated {
                    expected: total,
                    received,
                });
            }

            file.write_chunk(&buf[..n]).await?;
            received += n as u64;

            self.events.emit(TransferEvent::Progress {
                peer,
                filename: filename.clone(),
                progress: Progress::new(received, total),
            })
            .await;
        }

        let path = file.path().to_path_buf();
        let bytes = file.finish().await?;
        if let Err(e) = conn.close().await {
            tracing::warn!("Failed to close connection from {}: {}", peer, e);
        }

        tracing::info!("File received successfully: {} ({} bytes)", path.display(), bytes);
        tracing::debug!("{} bytes read from {}", conn.stats().bytes_received, peer);

        Ok(Received {
            filename,
            path,
            bytes,
        })
    }
}
