//! Transfer request header
//!
//! The fixed-shape prefix of every upload, plus filename normalization.

use std::fmt;

use super::{CodecError, LENGTH_FIELD_SIZE};

/// Header fields, in wire order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderField {
    FilenameLength,
    Filename,
    ContentLength,
}

impl fmt::Display for HeaderField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HeaderField::FilenameLength => "filename length",
            HeaderField::Filename => "filename",
            HeaderField::ContentLength => "content length",
        };
        f.write_str(name)
    }
}

/// Decoded (or about to be encoded) transfer request header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Filename as sent by the peer, not yet normalized
    pub filename: String,
    /// Number of content bytes following the header
    pub content_length: u32,
}

impl Header {
    /// Build a header, checking both lengths fit their 32-bit fields
    pub fn new(filename: impl Into<String>, content_length: u64) -> Result<Self, CodecError> {
        let filename = filename.into();
        length_field(filename.len(), HeaderField::Filename)?;

        let content_length = u32::try_from(content_length)
            .map_err(|_| CodecError::ContentTooLarge(content_length))?;

        Ok(Self {
            filename,
            content_length,
        })
    }

    /// Number of bytes the encoded header occupies on the wire
    pub fn encoded_len(&self) -> usize {
        2 * LENGTH_FIELD_SIZE + self.filename.len()
    }
}

/// Convert a byte length into its 32-bit wire field
pub(crate) fn length_field(len: usize, field: HeaderField) -> Result<u32, CodecError> {
    u32::try_from(len).map_err(|_| match field {
        HeaderField::Filename | HeaderField::FilenameLength => CodecError::FilenameTooLong(len),
        HeaderField::ContentLength => CodecError::ContentTooLarge(len as u64),
    })
}

/// Strip every directory component from `raw`, keeping the final segment.
///
/// Both `/` and `\` count as separators regardless of platform, since the
/// name comes from a remote peer. Returns `None` when nothing usable is
/// left (empty, `.`, `..`, or a name containing NUL).
pub fn base_name(raw: &str) -> Option<&str> {
    let name = raw
        .split(|c: char| c == '/' || c == '\\')
        .rev()
        .find(|segment| !segment.is_empty())?;

    if name == "." || name == ".." || name.contains('\0') {
        return None;
    }

    Some(name)
}
