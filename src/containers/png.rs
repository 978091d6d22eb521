//! PNG chunk stream decoding

use super::bmff::{fourcc_str, FourCC};
use crate::{
    cursor::push_uint,
    error::{Error, Result},
};
use byteorder::{BigEndian, ByteOrder};
use std::ops::Range;

// PNG signature
pub const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

// length(4) + type(4) + crc(4)
pub const CHUNK_OVERHEAD: usize = 12;

/// Largest chunk length allowed by the PNG specification (2^31 - 1)
pub const MAX_CHUNK_LENGTH: usize = 0x7FFF_FFFF;

// Chunk types
pub const IHDR: FourCC = *b"IHDR";
pub const PLTE: FourCC = *b"PLTE";
pub const IDAT: FourCC = *b"IDAT";
pub const IEND: FourCC = *b"IEND";
pub const ICCP: FourCC = *b"iCCP";
pub const EXIF: FourCC = *b"eXIf";
pub const ACTL: FourCC = *b"acTL";

/// Position of a chunk inside the buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkSpan {
    pub chunk_type: FourCC,
    /// Absolute offset of the length field
    pub offset: usize,
    /// Declared data length (excludes header and CRC)
    pub length: usize,
}

impl ChunkSpan {
    pub fn is(&self, chunk_type: FourCC) -> bool {
        self.chunk_type == chunk_type
    }

    pub fn data_start(&self) -> usize {
        self.offset + 8
    }

    pub fn data_range(&self) -> Range<usize> {
        self.data_start()..self.position()
    }

    /// Offset right after header and data, where the CRC lives
    pub fn position(&self) -> usize {
        self.data_start() + self.length
    }

    pub fn end(&self) -> usize {
        self.position() + 4
    }

    pub fn total_size(&self) -> usize {
        self.length + CHUNK_OVERHEAD
    }
}

/// Transient view of one chunk
#[derive(Clone, Copy, Debug)]
pub struct Chunk<'a> {
    pub span: ChunkSpan,
    pub data: &'a [u8],
    pub crc: u32,
}

impl Chunk<'_> {
    pub fn chunk_type(&self) -> FourCC {
        self.span.chunk_type
    }

    /// Whether the stored CRC matches `crc32(type ++ data)`
    pub fn crc_matches(&self) -> bool {
        self.crc == crc(&self.span.chunk_type, self.data)
    }
}

/// Lazy scan over the chunk sequence
///
/// Stops after `IEND` or when fewer than 12 bytes remain.
#[derive(Clone, Debug)]
pub struct Chunks<'a> {
    buf: &'a [u8],
    pos: usize,
    done: bool,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Result<Chunk<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let buf: &'a [u8] = self.buf;
        let pos = self.pos;
        if buf.len().saturating_sub(pos) < CHUNK_OVERHEAD {
            self.done = true;
            return None;
        }

        let length = BigEndian::read_u32(&buf[pos..pos + 4]) as usize;
        let mut chunk_type = [0u8; 4];
        chunk_type.copy_from_slice(&buf[pos + 4..pos + 8]);

        // Validate chunk length to prevent reads past the buffer
        if length > MAX_CHUNK_LENGTH || length > buf.len() - pos - CHUNK_OVERHEAD {
            self.done = true;
            return Some(Err(Error::malformed(
                pos,
                format!(
                    "{} chunk length {} overruns buffer",
                    fourcc_str(&chunk_type),
                    length
                ),
            )));
        }

        let span = ChunkSpan {
            chunk_type,
            offset: pos,
            length,
        };
        let crc = BigEndian::read_u32(&buf[span.position()..span.end()]);
        self.pos = span.end();
        if span.is(IEND) {
            self.done = true;
        }

        Some(Ok(Chunk {
            span,
            data: &buf[span.data_range()],
            crc,
        }))
    }
}

impl std::iter::FusedIterator for Chunks<'_> {}

/// Stateless chunk decoder
pub struct ChunkDecoder;

impl ChunkDecoder {
    /// Chunks following the 8-byte signature
    pub fn decode(buf: &[u8]) -> Chunks<'_> {
        Chunks {
            buf,
            pos: PNG_SIGNATURE.len(),
            done: false,
        }
    }

    /// First chunk of the given type
    pub fn find(buf: &[u8], chunk_type: FourCC) -> Result<Option<ChunkSpan>> {
        for chunk in Self::decode(buf) {
            let chunk = chunk?;
            if chunk.span.is(chunk_type) {
                return Ok(Some(chunk.span));
            }
        }
        Ok(None)
    }
}

/// Calculate CRC32 for PNG chunk
pub fn crc(chunk_type: &[u8], data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(chunk_type);
    hasher.update(data);
    hasher.finalize()
}

/// Serialize a chunk with proper CRC
pub fn build_chunk(chunk_type: FourCC, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() > MAX_CHUNK_LENGTH {
        return Err(Error::DataTooLarge {
            size: data.len(),
            max: MAX_CHUNK_LENGTH,
        });
    }
    let mut out = Vec::with_capacity(data.len() + CHUNK_OVERHEAD);
    push_uint(&mut out, 4, data.len() as u64)?;
    out.extend_from_slice(&chunk_type);
    out.extend_from_slice(data);
    push_uint(&mut out, 4, u64::from(crc(&chunk_type, data)))?;
    Ok(out)
}
