//! # Skim file codecs
//!
//! Two on-disk encodings share this module: the legacy length-tagged binary
//! layout ([`binary`]) and the columnar attribute-tagged interchange
//! container ([`columnar`]). Both are expressed as explicit state machines
//! over a counting cursor, so corruption errors can report a byte offset.

pub mod binary;
pub mod columnar;

use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::{CubeError, ZoneIndexError};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Corrupt skim file at byte {offset}: {reason}")]
    CorruptFormat { reason: String, offset: u64 },
    #[error("Expected matrix {0} is missing from the container.")]
    MissingMatrix(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    ZoneIndex(#[from] ZoneIndexError),
    #[error(transparent)]
    Cube(#[from] CubeError),
}

/// The outcome of attempting to read an optional tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TagMatch {
    Matched,
    /// Something else is at the cursor; the cursor was rewound.
    Mismatch,
    /// Clean end of stream at the cursor.
    Eof,
}

/// A counting cursor over a seekable byte source.
///
/// Tracks the byte offset of everything read so corruption errors can point
/// at the offending section, and supports one-tag lookahead via rewind.
pub(crate) struct TagReader<R> {
    inner: R,
    offset: u64,
}

impl<R: Read + Seek> TagReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, offset: 0 }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn corrupt(&self, reason: impl Into<String>) -> CodecError {
        CodecError::CorruptFormat {
            reason: reason.into(),
            offset: self.offset,
        }
    }

    /// Attempts to match `tag` at the cursor. On mismatch the cursor is
    /// rewound to where it was.
    pub fn try_tag(&mut self, tag: &[u8]) -> Result<TagMatch, CodecError> {
        let mut buffer = [0u8; 8];
        let buffer = &mut buffer[..tag.len()];
        let start = self.offset;
        let read = read_available(&mut self.inner, buffer)?;
        if read == 0 {
            return Ok(TagMatch::Eof);
        }
        self.offset += read as u64;
        if read == tag.len() && buffer == tag {
            return Ok(TagMatch::Matched);
        }
        self.inner.seek(SeekFrom::Start(start))?;
        self.offset = start;
        Ok(TagMatch::Mismatch)
    }

    /// Requires `tag` at the cursor.
    ///
    /// # Errors
    ///
    /// A mismatch or end of stream is a [`CodecError::CorruptFormat`] naming
    /// the expected tag.
    pub fn expect_tag(&mut self, tag: &[u8]) -> Result<(), CodecError> {
        match self.try_tag(tag)? {
            TagMatch::Matched => Ok(()),
            TagMatch::Mismatch | TagMatch::Eof => Err(self.corrupt(format!(
                "expected tag {:?}",
                String::from_utf8_lossy(tag)
            ))),
        }
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        let value = self
            .inner
            .read_u32::<LittleEndian>()
            .map_err(|e| self.truncated(&e))?;
        self.offset += 4;
        Ok(value)
    }

    pub fn read_f32(&mut self) -> Result<f32, CodecError> {
        let value = self
            .inner
            .read_f32::<LittleEndian>()
            .map_err(|e| self.truncated(&e))?;
        self.offset += 4;
        Ok(value)
    }

    pub fn read_f64(&mut self) -> Result<f64, CodecError> {
        let value = self
            .inner
            .read_f64::<LittleEndian>()
            .map_err(|e| self.truncated(&e))?;
        self.offset += 8;
        Ok(value)
    }

    /// Reads up to `count` little-endian f32 values, stopping early at end
    /// of stream. Callers decide whether a short block is recoverable.
    pub fn read_f32_block_partial(&mut self, count: usize) -> Result<Vec<f32>, CodecError> {
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            match self.inner.read_f32::<LittleEndian>() {
                Ok(value) => {
                    self.offset += 4;
                    values.push(value);
                }
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(values)
    }

    /// Reads a u32-length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let length = self.read_u32()? as usize;
        let mut bytes = vec![0u8; length];
        self.inner
            .read_exact(&mut bytes)
            .map_err(|e| self.truncated(&e))?;
        self.offset += length as u64;
        String::from_utf8(bytes).map_err(|_| self.corrupt("string payload is not valid UTF-8"))
    }

    fn truncated(&self, source: &std::io::Error) -> CodecError {
        if source.kind() == ErrorKind::UnexpectedEof {
            self.corrupt("payload is truncated")
        } else {
            CodecError::Io(std::io::Error::new(source.kind(), source.to_string()))
        }
    }
}

/// Reads as many bytes as available into `buffer`, returning the count.
/// Unlike `read_exact`, a short read is not an error.
fn read_available<R: Read>(reader: &mut R, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// The write-side counterpart of [`TagReader`].
pub(crate) struct TagWriter<W> {
    inner: W,
}

impl<W: Write> TagWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn tag(&mut self, tag: &[u8]) -> Result<(), CodecError> {
        self.inner.write_all(tag)?;
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<(), CodecError> {
        self.inner.write_u32::<LittleEndian>(value)?;
        Ok(())
    }

    pub fn write_f32(&mut self, value: f32) -> Result<(), CodecError> {
        self.inner.write_f32::<LittleEndian>(value)?;
        Ok(())
    }

    pub fn write_f64(&mut self, value: f64) -> Result<(), CodecError> {
        self.inner.write_f64::<LittleEndian>(value)?;
        Ok(())
    }

    /// Writes a u32-length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) -> Result<(), CodecError> {
        #[allow(clippy::cast_possible_truncation)]
        self.write_u32(value.len() as u32)?;
        self.inner.write_all(value.as_bytes())?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), CodecError> {
        self.inner.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_try_tag_rewinds_on_mismatch() {
        let mut reader = TagReader::new(Cursor::new(b"BINT\x02\x00\x00\x00".to_vec()));
        assert_eq!(reader.try_tag(b"BZON").unwrap(), TagMatch::Mismatch);
        assert_eq!(reader.offset(), 0);
        assert_eq!(reader.try_tag(b"BINT").unwrap(), TagMatch::Matched);
        assert_eq!(reader.read_u32().unwrap(), 2);
    }

    #[test]
    fn test_try_tag_reports_eof() {
        let mut reader = TagReader::new(Cursor::new(Vec::new()));
        assert_eq!(reader.try_tag(b"BMAT").unwrap(), TagMatch::Eof);
    }

    #[test]
    fn test_expect_tag_reports_offset() {
        let mut reader = TagReader::new(Cursor::new(b"XXXXEZON".to_vec()));
        reader.try_tag(b"XXXX").unwrap();
        let err = reader.expect_tag(b"BZON").unwrap_err();
        match err {
            CodecError::CorruptFormat { offset, .. } => assert_eq!(offset, 4),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_partial_f32_block_stops_at_eof() {
        let mut bytes = Vec::new();
        {
            let mut writer = TagWriter::new(&mut bytes);
            writer.write_f32(1.0).unwrap();
            writer.write_f32(2.0).unwrap();
        }
        let mut reader = TagReader::new(Cursor::new(bytes));
        let block = reader.read_f32_block_partial(4).unwrap();
        assert_eq!(block, vec![1.0, 2.0]);
    }

    #[test]
    fn test_string_round_trip() {
        let mut bytes = Vec::new();
        TagWriter::new(&mut bytes).write_string("walk_bus_360_ivt").unwrap();
        let mut reader = TagReader::new(Cursor::new(bytes));
        assert_eq!(reader.read_string().unwrap(), "walk_bus_360_ivt");
    }
}
