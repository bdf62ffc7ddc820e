//! Connection handling for filedrop
//!
//! Wraps one TCP stream for the lifetime of exactly one request:
//! - Header encoding/decoding
//! - Raw body chunk reads and writes
//! - Optional per-operation deadlines
//! - Byte counters

use bytes::BytesMut;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::{decode_header, CodecError, Header};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Connection timeout after {0:?}")]
    Timeout(Duration),
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Stream established, request in progress
    Open,
    /// Write half shut down; no further use
    Closed,
}

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
}

/// A single-request connection to a remote filedrop peer
pub struct Connection {
    /// Remote peer address
    remote_addr: SocketAddr,
    /// The TCP stream
    stream: TcpStream,
    /// Deadline applied to each read/write
    io_timeout: Option<Duration>,
    /// Header write buffer
    write_buf: BytesMut,
    /// Connection state
    state: ConnectionState,
    /// Statistics
    stats: ConnectionStats,
}

impl Connection {
    /// Create a new connection from an established TCP stream
    pub fn new(stream: TcpStream, remote_addr: SocketAddr, io_timeout: Option<Duration>) -> Self {
        Self {
            remote_addr,
            stream,
            io_timeout,
            write_buf: BytesMut::with_capacity(256),
            state: ConnectionState::Open,
            stats: ConnectionStats::default(),
        }
    }

    /// Dial a remote address
    pub async fn connect(
        addr: SocketAddr,
        connect_timeout: Option<Duration>,
        io_timeout: Option<Duration>,
    ) -> ConnectionResult<Self> {
        let stream = with_deadline(connect_timeout, TcpStream::connect(addr)).await??;
        Ok(Self::new(stream, addr, io_timeout))
    }

    /// Get the remote address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Get connection statistics
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Read and decode the request header
    pub async fn read_header(&mut self) -> ConnectionResult<Header> {
        let header = with_deadline(self.io_timeout, decode_header(&mut self.stream)).await??;
        self.stats.bytes_received += header.encoded_len() as u64;
        Ok(header)
    }

    /// Encode and send the request header
    pub async fn write_header(&mut self, header: &Header) -> ConnectionResult<()> {
        self.write_buf.clear();
        header.encode(&mut self.write_buf)?;

        with_deadline(self.io_timeout, self.stream.write_all(&self.write_buf)).await??;
        self.stats.bytes_sent += self.write_buf.len() as u64;

        Ok(())
    }

    /// Read up to `buf.len()` body bytes; 0 means the peer closed
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> ConnectionResult<usize> {
        let n = with_deadline(self.io_timeout, self.stream.read(buf)).await??;
        self.stats.bytes_received += n as u64;
        Ok(n)
    }

    /// Write all of `buf`
    pub async fn write_chunk(&mut self, buf: &[u8]) -> ConnectionResult<()> {
        with_deadline(self.io_timeout, self.stream.write_all(buf)).await??;
        self.stats.bytes_sent += buf.len() as u64;
        Ok(())
    }

    /// Flush and shut down the write half
    pub async fn close(&mut self) -> ConnectionResult<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        self.state = ConnectionState::Closed;

        with_deadline(self.io_timeout, async {
            self.stream.flush().await?;
            self.stream.shutdown().await
        })
        .await??;

        Ok(())
    }
}

/// Run `fut`, failing with `Timeout` if a deadline is set and passes first
async fn with_deadline<F, T>(deadline: Option<Duration>, fut: F) -> ConnectionResult<T>
where
    F: Future<Output = T>,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| ConnectionError::Timeout(limit)),
        None => Ok(fut.await),
    }
}
