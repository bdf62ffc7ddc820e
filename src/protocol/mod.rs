//! Protocol module - Defines the wire protocol for filedrop transfers
//!
//! One request per connection, all integers big-endian:
//! - 4 bytes filename length (N)
//! - N bytes filename (UTF-8)
//! - 4 bytes content length (M)
//! - M bytes file content
//!
//! No acknowledgement, checksum or trailer follows the content.

mod codec;
mod header;

pub use codec::*;
pub use header::*;

/// Default port for filedrop communication
pub const DEFAULT_PORT: u16 = 8080;

/// Default host for both the listener and the client
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default chunk size for streaming file bodies
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Size of each length prefix on the wire
pub const LENGTH_FIELD_SIZE: usize = 4;
