//! Owned byte buffer with big-endian field access and splicing
//!
//! Every container edit in this crate goes through [`BinaryCursor`]: reads are
//! bounds-checked and report [`Error::Malformed`] instead of panicking, and the
//! only way to change the buffer length is [`BinaryCursor::splice`].

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder};
use std::ops::Range;

/// Big-endian reader/writer over an exclusively owned buffer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinaryCursor {
    buf: Vec<u8>,
}

impl BinaryCursor {
    /// Take ownership of `buf`
    pub fn new(buf: Vec<u8>) -> Self {
        Self { buf }
    }

    /// Current contents
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Give the buffer back to the caller
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Borrow `len` bytes starting at `pos`
    pub fn bytes(&self, pos: usize, len: usize) -> Result<&[u8]> {
        pos.checked_add(len)
            .and_then(|end| self.buf.get(pos..end))
            .ok_or_else(|| {
                Error::malformed(pos, format!("need {} bytes, buffer has {}", len, self.buf.len()))
            })
    }

    /// Borrow an absolute byte range
    pub fn slice(&self, range: Range<usize>) -> Result<&[u8]> {
        let len = range.end.checked_sub(range.start).ok_or_else(|| {
            Error::malformed(range.start, "range end precedes start")
        })?;
        self.bytes(range.start, len)
    }

    pub fn read_u8(&self, pos: usize) -> Result<u8> {
        Ok(self.bytes(pos, 1)?[0])
    }

    pub fn read_u16(&self, pos: usize) -> Result<u16> {
        Ok(BigEndian::read_u16(self.bytes(pos, 2)?))
    }

    pub fn read_u24(&self, pos: usize) -> Result<u32> {
        Ok(BigEndian::read_u24(self.bytes(pos, 3)?))
    }

    pub fn read_u32(&self, pos: usize) -> Result<u32> {
        Ok(BigEndian::read_u32(self.bytes(pos, 4)?))
    }

    pub fn read_u64(&self, pos: usize) -> Result<u64> {
        Ok(BigEndian::read_u64(self.bytes(pos, 8)?))
    }

    /// Read an unsigned integer of `width` bytes (0..=8); width 0 reads as 0
    pub fn read_uint(&self, pos: usize, width: usize) -> Result<u64> {
        read_uint(&self.buf, pos, width)
    }

    /// Read a four-character code
    pub fn read_fourcc(&self, pos: usize) -> Result<[u8; 4]> {
        let mut code = [0u8; 4];
        code.copy_from_slice(self.bytes(pos, 4)?);
        Ok(code)
    }

    fn bytes_mut(&mut self, pos: usize, len: usize) -> Result<&mut [u8]> {
        let have = self.buf.len();
        match pos.checked_add(len) {
            Some(end) if end <= have => Ok(&mut self.buf[pos..end]),
            _ => Err(Error::malformed(
                pos,
                format!("need {} bytes to write, buffer has {}", len, have),
            )),
        }
    }

    pub fn write_u8(&mut self, pos: usize, value: u8) -> Result<()> {
        self.bytes_mut(pos, 1)?[0] = value;
        Ok(())
    }

    pub fn write_u16(&mut self, pos: usize, value: u16) -> Result<()> {
        BigEndian::write_u16(self.bytes_mut(pos, 2)?, value);
        Ok(())
    }

    pub fn write_u32(&mut self, pos: usize, value: u32) -> Result<()> {
        BigEndian::write_u32(self.bytes_mut(pos, 4)?, value);
        Ok(())
    }

    pub fn write_u64(&mut self, pos: usize, value: u64) -> Result<()> {
        BigEndian::write_u64(self.bytes_mut(pos, 8)?, value);
        Ok(())
    }

    /// Write `value` into a `width`-byte field, failing if it does not fit
    pub fn write_uint(&mut self, pos: usize, width: usize, value: u64) -> Result<()> {
        check_fits(pos, width, value)?;
        if width == 0 {
            return Ok(());
        }
        BigEndian::write_uint(self.bytes_mut(pos, width)?, value, width);
        Ok(())
    }

    /// Overwrite bytes in place without changing the length
    pub fn overwrite(&mut self, pos: usize, data: &[u8]) -> Result<()> {
        self.bytes_mut(pos, data.len())?.copy_from_slice(data);
        Ok(())
    }

    /// Replace `remove` bytes at `pos` with `insert`, returning the length delta
    pub fn splice(&mut self, pos: usize, remove: usize, insert: &[u8]) -> Result<i64> {
        let end = pos
            .checked_add(remove)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                Error::malformed(pos, format!("cannot remove {} bytes past end of buffer", remove))
            })?;
        self.buf.splice(pos..end, insert.iter().copied());
        Ok(insert.len() as i64 - remove as i64)
    }

    /// Insert bytes at `pos`
    pub fn insert(&mut self, pos: usize, data: &[u8]) -> Result<i64> {
        self.splice(pos, 0, data)
    }

    /// Remove an absolute byte range
    pub fn remove(&mut self, range: Range<usize>) -> Result<i64> {
        let len = range.end.saturating_sub(range.start);
        self.splice(range.start, len, &[])
    }
}

/// Read a `width`-byte big-endian unsigned integer from a raw slice
pub(crate) fn read_uint(buf: &[u8], pos: usize, width: usize) -> Result<u64> {
    if width > 8 {
        return Err(Error::malformed(pos, format!("field width {} exceeds 8 bytes", width)));
    }
    if width == 0 {
        return Ok(0);
    }
    let bytes = pos
        .checked_add(width)
        .and_then(|end| buf.get(pos..end))
        .ok_or_else(|| Error::malformed(pos, format!("truncated {}-byte field", width)))?;
    Ok(BigEndian::read_uint(bytes, width))
}

/// Append `value` as a `width`-byte big-endian field
pub(crate) fn push_uint(out: &mut Vec<u8>, width: usize, value: u64) -> Result<()> {
    check_fits(out.len(), width, value)?;
    if width > 0 {
        let mut tmp = [0u8; 8];
        BigEndian::write_uint(&mut tmp[..width], value, width);
        out.extend_from_slice(&tmp[..width]);
    }
    Ok(())
}

fn check_fits(pos: usize, width: usize, value: u64) -> Result<()> {
    let fits = match width {
        0 => value == 0,
        1..=7 => value < (1u64 << (width * 8)),
        8 => true,
        _ => false,
    };
    if fits {
        Ok(())
    } else {
        Err(Error::unsupported(format!(
            "value {} does not fit a {}-byte field at offset {}",
            value, width, pos
        )))
    }
}
