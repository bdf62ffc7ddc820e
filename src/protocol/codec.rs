//! Protocol codec for encoding/decoding transfer headers
//!
//! Handles framing of the request prefix. Content bytes are streamed by the
//! sender and receiver directly and never pass through the codec.

use bytes::{BufMut, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::header::length_field;
use super::{Header, HeaderField, LENGTH_FIELD_SIZE};

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Stream closed before any header bytes arrived")]
    Empty,

    #[error("Truncated {field}: expected {expected} bytes, received {received}")]
    Truncated {
        field: HeaderField,
        expected: u64,
        received: u64,
    },

    #[error("Filename is not valid UTF-8")]
    InvalidFilename,

    #[error("Filename too long: {0} bytes (max: {})", u32::MAX)]
    FilenameTooLong(usize),

    #[error("Content too large: {0} bytes (max: {})", u32::MAX)]
    ContentTooLarge(u64),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// True when the peer closed without starting a request
    pub fn is_clean_close(&self) -> bool {
        matches!(self, CodecError::Empty)
    }
}

/// Encode a header into a buffer
pub fn encode_header(name: &str, content_length: u32, buf: &mut BytesMut) -> Result<(), CodecError> {
    let name_len = length_field(name.len(), HeaderField::Filename)?;

    buf.reserve(2 * LENGTH_FIELD_SIZE + name.len());
    buf.put_u32(name_len);
    buf.put_slice(name.as_bytes());
    buf.put_u32(content_length);

    Ok(())
}

impl Header {
    /// Encode this header into a buffer
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        encode_header(&self.filename, self.content_length, buf)
    }
}

/// Decode a header from the front of a stream.
///
/// Consumes exactly the header bytes; the reader is left positioned at the
/// first content byte. Either a whole header is returned or an error, never
/// a partial result.
pub async fn decode_header<R>(reader: &mut R) -> Result<Header, CodecError>
where
    R: AsyncRead + Unpin,
{
    let name_len = read_length(reader, HeaderField::FilenameLength, false).await?;

    // Grows with the bytes actually received rather than trusting the prefix
    let mut name = Vec::new();
    (&mut *reader)
        .take(u64::from(name_len))
        .read_to_end(&mut name)
        .await?;

    if name.len() < name_len as usize {
        return Err(CodecError::Truncated {
            field: HeaderField::Filename,
            expected: u64::from(name_len),
            received: name.len() as u64,
        });
    }

    let content_length = read_length(reader, HeaderField::ContentLength, true).await?;
    let filename = String::from_utf8(name).map_err(|_| CodecError::InvalidFilename)?;

    Ok(Header {
        filename,
        content_length,
    })
}

async fn read_length<R>(reader: &mut R, field: HeaderField, started: bool) -> Result<u32, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; LENGTH_FIELD_SIZE];
    let mut filled = 0;

    while filled < raw.len() {
        let n = reader.read(&mut raw[filled..]).await?;
        if n == 0 {
            if filled == 0 && !started {
                return Err(CodecError::Empty);
            }
            return Err(CodecError::Truncated {
                field,
                expected: LENGTH_FIELD_SIZE as u64,
                received: filled as u64,
            });
        }
        filled += n;
    }

    Ok(u32::from_be_bytes(raw))
}
