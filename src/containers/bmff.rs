//! BMFF (ISO Base Media File Format) box decoding
//!
//! Supports the box layout shared by AVIF, HEIF and HEIC.
//!
//! Reference: ISO/IEC 14496-12:2022 § 4.2

use crate::{
    cursor::push_uint,
    error::{Error, Result},
};
use byteorder::{BigEndian, ByteOrder};
use std::ops::Range;

/// Four-character box or chunk type
pub type FourCC = [u8; 4];

// BMFF constants
pub const HEADER_SIZE: usize = 8; // 4 byte size + 4 byte type
pub const HEADER_SIZE_LARGE: usize = 16; // 4 byte size + 4 byte type + 8 byte large size
pub const FULL_BOX_HEADER: usize = 4; // version(1) + flags(3)

/// Box type enum for the boxes this crate inspects
macro_rules! boxtype {
    ($( $name:ident => $value:literal ),* $(,)?) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub enum BoxType {
            $( $name, )*
            Unknown(FourCC),
        }

        impl From<FourCC> for BoxType {
            fn from(t: FourCC) -> BoxType {
                match &t {
                    $( $value => BoxType::$name, )*
                    _ => BoxType::Unknown(t),
                }
            }
        }

        impl From<BoxType> for FourCC {
            fn from(t: BoxType) -> FourCC {
                match t {
                    $( BoxType::$name => *$value, )*
                    BoxType::Unknown(t) => t,
                }
            }
        }
    }
}

boxtype! {
    Ftyp => b"ftyp",
    Meta => b"meta",
    Hdlr => b"hdlr",
    Pitm => b"pitm",
    Iinf => b"iinf",
    Infe => b"infe",
    Iloc => b"iloc",
    Iref => b"iref",
    Idat => b"idat",
    Iprp => b"iprp",
    Ipco => b"ipco",
    Ipma => b"ipma",
    Ispe => b"ispe",
    Pixi => b"pixi",
    AuxC => b"auxC",
    Colr => b"colr",
    Mdat => b"mdat",
    Moov => b"moov",
    Trak => b"trak",
    Mdia => b"mdia",
    Minf => b"minf",
    Stbl => b"stbl",
    Stsz => b"stsz",
    Free => b"free",
}

impl BoxType {
    pub fn fourcc(self) -> FourCC {
        self.into()
    }
}

/// Position of a box inside the buffer
///
/// Plain copyable offsets, so it can be carried across a mutation; the bytes
/// it describes are only meaningful until the next edit before it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoxSpan {
    pub fourcc: FourCC,
    /// Absolute offset of the size field
    pub offset: usize,
    /// Declared total size including the header
    pub size: usize,
    /// 8, or 16 for boxes using a 64-bit largesize
    pub header_len: usize,
}

impl BoxSpan {
    pub fn box_type(&self) -> BoxType {
        BoxType::from(self.fourcc)
    }

    pub fn is(&self, box_type: BoxType) -> bool {
        self.fourcc == box_type.fourcc()
    }

    pub fn end(&self) -> usize {
        self.offset + self.size
    }

    pub fn payload_start(&self) -> usize {
        self.offset + self.header_len
    }

    pub fn payload_range(&self) -> Range<usize> {
        self.payload_start()..self.end()
    }

    /// Range holding child boxes; full boxes skip their version/flags word
    pub fn children_range(&self, full_box: bool) -> Range<usize> {
        let skip = if full_box { FULL_BOX_HEADER } else { 0 };
        (self.payload_start() + skip).min(self.end())..self.end()
    }

    pub fn large_size(&self) -> bool {
        self.header_len == HEADER_SIZE_LARGE
    }
}

/// Transient view of one box: header fields plus a borrowed payload
#[derive(Clone, Copy, Debug)]
pub struct BoxRecord<'a> {
    pub span: BoxSpan,
    pub payload: &'a [u8],
}

impl<'a> BoxRecord<'a> {
    pub fn fourcc(&self) -> FourCC {
        self.span.fourcc
    }

    pub fn box_type(&self) -> BoxType {
        self.span.box_type()
    }

    pub fn offset(&self) -> usize {
        self.span.offset
    }

    pub fn size(&self) -> usize {
        self.span.size
    }

    /// Version and flags of a full box
    pub fn full_box_header(&self) -> Result<(u8, u32)> {
        if self.payload.len() < FULL_BOX_HEADER {
            return Err(Error::malformed(
                self.span.payload_start(),
                format!("{} box too short for version/flags", fourcc_str(&self.span.fourcc)),
            ));
        }
        Ok((self.payload[0], BigEndian::read_u24(&self.payload[1..4])))
    }
}

/// Lazy scan over sibling boxes in `[pos, end)`
///
/// Yields an error once and then stops when a header is inconsistent.
#[derive(Clone, Debug)]
pub struct Boxes<'a> {
    buf: &'a [u8],
    pos: usize,
    end: usize,
    done: bool,
}

impl<'a> Boxes<'a> {
    fn read_header(&self) -> Result<Option<BoxSpan>> {
        let pos = self.pos;
        let remaining = self.end - pos;
        if remaining < HEADER_SIZE {
            // Trailing padding shorter than a header
            return Ok(None);
        }

        let size = BigEndian::read_u32(&self.buf[pos..pos + 4]) as u64;
        let mut fourcc = [0u8; 4];
        fourcc.copy_from_slice(&self.buf[pos + 4..pos + 8]);

        // Break on size zero: end of the sibling list
        if size == 0 {
            return Ok(None);
        }

        let (size, header_len) = if size == 1 {
            if remaining < HEADER_SIZE_LARGE {
                return Err(Error::malformed(pos, "truncated 64-bit box header"));
            }
            (
                BigEndian::read_u64(&self.buf[pos + 8..pos + 16]),
                HEADER_SIZE_LARGE,
            )
        } else {
            (size, HEADER_SIZE)
        };

        if size < header_len as u64 {
            return Err(Error::malformed(
                pos,
                format!("{} box size {} smaller than its header", fourcc_str(&fourcc), size),
            ));
        }
        if size > remaining as u64 {
            return Err(Error::malformed(
                pos,
                format!(
                    "{} box size {} overruns its container ({} bytes left)",
                    fourcc_str(&fourcc),
                    size,
                    remaining
                ),
            ));
        }

        Ok(Some(BoxSpan {
            fourcc,
            offset: pos,
            size: size as usize,
            header_len,
        }))
    }
}

impl<'a> Iterator for Boxes<'a> {
    type Item = Result<BoxRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_header() {
            Ok(Some(span)) => {
                let buf: &'a [u8] = self.buf;
                self.pos = span.end();
                Some(Ok(BoxRecord {
                    span,
                    payload: &buf[span.payload_range()],
                }))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl std::iter::FusedIterator for Boxes<'_> {}

/// Stateless box decoder
///
/// Each call starts an independent scan; nothing is cached between calls.
pub struct BoxDecoder;

impl BoxDecoder {
    /// Top-level boxes of the whole buffer
    pub fn decode(buf: &[u8]) -> Boxes<'_> {
        Self::decode_range(buf, 0..buf.len())
    }

    /// Sibling boxes inside an absolute byte range (a parent's child area)
    pub fn decode_range(buf: &[u8], range: Range<usize>) -> Boxes<'_> {
        let end = range.end.min(buf.len());
        let pos = range.start.min(end);
        Boxes {
            buf,
            pos,
            end,
            done: false,
        }
    }

    /// Child boxes of `parent`
    pub fn children<'a>(buf: &'a [u8], parent: &BoxSpan, full_box: bool) -> Boxes<'a> {
        Self::decode_range(buf, parent.children_range(full_box))
    }

    /// Offset just past the last child of `parent` that a scan reaches
    ///
    /// Stops where the sibling list ends, so trailing padding inside the
    /// parent stays behind anything appended here.
    pub fn children_end(buf: &[u8], parent: &BoxSpan, full_box: bool) -> Result<usize> {
        let mut end = parent.children_range(full_box).start;
        for record in Self::children(buf, parent, full_box) {
            end = record?.span.end();
        }
        Ok(end)
    }

    /// First box of the given type within `range`
    pub fn find(buf: &[u8], range: Range<usize>, box_type: BoxType) -> Result<Option<BoxSpan>> {
        for record in Self::decode_range(buf, range) {
            let record = record?;
            if record.span.is(box_type) {
                return Ok(Some(record.span));
            }
        }
        Ok(None)
    }

    /// First child of `parent` with the given type
    pub fn find_child(
        buf: &[u8],
        parent: &BoxSpan,
        full_box: bool,
        box_type: BoxType,
    ) -> Result<Option<BoxSpan>> {
        Self::find(buf, parent.children_range(full_box), box_type)
    }

    /// Walk a path of nested boxes from the top level
    ///
    /// Returns every box on the path, outermost first, or `None` as soon as a
    /// step is missing. `meta` is the only full box among the containers walked.
    pub fn find_path(buf: &[u8], path: &[BoxType]) -> Result<Option<Vec<BoxSpan>>> {
        let mut found: Vec<BoxSpan> = Vec::with_capacity(path.len());
        for box_type in path {
            let range = match found.last() {
                Some(parent) => parent.children_range(parent.is(BoxType::Meta)),
                None => 0..buf.len(),
            };
            match Self::find(buf, range, *box_type)? {
                Some(span) => found.push(span),
                None => return Ok(None),
            }
        }
        Ok(Some(found))
    }
}

/// Serialize a plain box
pub fn build_box(box_type: BoxType, payload: &[u8]) -> Result<Vec<u8>> {
    let size = HEADER_SIZE + payload.len();
    if size > u32::MAX as usize {
        return Err(Error::DataTooLarge {
            size,
            max: u32::MAX as usize,
        });
    }
    let mut out = Vec::with_capacity(size);
    push_uint(&mut out, 4, size as u64)?;
    out.extend_from_slice(&box_type.fourcc());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Serialize a full box (version + 24-bit flags ahead of the payload)
pub fn build_full_box(box_type: BoxType, version: u8, flags: u32, payload: &[u8]) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(FULL_BOX_HEADER + payload.len());
    body.push(version);
    push_uint(&mut body, 3, u64::from(flags & 0x00FF_FFFF))?;
    body.extend_from_slice(payload);
    build_box(box_type, &body)
}

/// Printable form of a four-character code
pub fn fourcc_str(fourcc: &FourCC) -> String {
    String::from_utf8_lossy(fourcc).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_box(fourcc: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = ((8 + payload.len()) as u32).to_be_bytes().to_vec();
        out.extend_from_slice(fourcc);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_decode_top_level() {
        let mut data = raw_box(b"ftyp", b"avif\0\0\0\0avifmif1");
        data.extend(raw_box(b"mdat", &[1, 2, 3]));

        let boxes: Vec<_> = BoxDecoder::decode(&data).collect::<Result<_>>().unwrap();
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].box_type(), BoxType::Ftyp);
        assert_eq!(boxes[1].offset(), 24);
        assert_eq!(boxes[1].payload, &[1, 2, 3]);
    }

    #[test]
    fn test_decode_is_restartable() {
        let data = raw_box(b"free", &[0; 4]);
        let first: Vec<_> = BoxDecoder::decode(&data).map(|b| b.unwrap().span).collect();
        let second: Vec<_> = BoxDecoder::decode(&data).map(|b| b.unwrap().span).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_zero_size_ends_list() {
        let mut data = raw_box(b"free", &[]);
        data.extend_from_slice(&[0u8; 12]);
        data.extend(raw_box(b"mdat", &[]));
        let boxes: Vec<_> = BoxDecoder::decode(&data).collect::<Result<_>>().unwrap();
        assert_eq!(boxes.len(), 1);
    }

    #[test]
    fn test_short_trailing_padding_tolerated() {
        let mut data = raw_box(b"free", &[]);
        data.extend_from_slice(&[0xAB; 5]);
        let boxes: Vec<_> = BoxDecoder::decode(&data).collect::<Result<_>>().unwrap();
        assert_eq!(boxes.len(), 1);
    }

    #[test]
    fn test_overrun_is_malformed() {
        let mut data = raw_box(b"mdat", &[1, 2, 3]);
        data[3] = 0x40;
        let mut iter = BoxDecoder::decode(&data);
        assert!(matches!(iter.next(), Some(Err(Error::Malformed { offset: 0, .. }))));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_large_size_header() {
        let mut data = vec![0, 0, 0, 1];
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&20u64.to_be_bytes());
        data.extend_from_slice(&[9, 9, 9, 9]);
        let record = BoxDecoder::decode(&data).next().unwrap().unwrap();
        assert!(record.span.large_size());
        assert_eq!(record.size(), 20);
        assert_eq!(record.payload, &[9, 9, 9, 9]);
    }

    #[test]
    fn test_find_path_descends_meta() {
        let ipco = raw_box(b"ipco", &raw_box(b"ispe", &[0; 12]));
        let iprp = raw_box(b"iprp", &ipco);
        let mut meta_payload = vec![0, 0, 0, 0];
        meta_payload.extend(iprp);
        let data = raw_box(b"meta", &meta_payload);

        let path = BoxDecoder::find_path(&data, &[BoxType::Meta, BoxType::Iprp, BoxType::Ipco])
            .unwrap()
            .unwrap();
        assert_eq!(path.len(), 3);
        assert_eq!(path[1].offset, 12);
        assert_eq!(path[2].offset, 20);
        assert!(BoxDecoder::find_path(&data, &[BoxType::Meta, BoxType::Iinf])
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_children_end_stops_before_padding() {
        let mut meta_payload = vec![0, 0, 0, 0];
        meta_payload.extend(raw_box(b"hdlr", &[0; 4]));
        meta_payload.extend_from_slice(&[0; 8]);
        let data = raw_box(b"meta", &meta_payload);
        let meta = BoxDecoder::decode(&data).next().unwrap().unwrap().span;

        assert_eq!(meta.end(), 32);
        assert_eq!(BoxDecoder::children_end(&data, &meta, true).unwrap(), 24);

        let empty = raw_box(b"ipco", &[]);
        let ipco = BoxDecoder::decode(&empty).next().unwrap().unwrap().span;
        assert_eq!(BoxDecoder::children_end(&empty, &ipco, false).unwrap(), 8);
    }

    #[test]
    fn test_build_full_box() {
        let built = build_full_box(BoxType::Iinf, 0, 0, &[0, 0]).unwrap();
        assert_eq!(built, vec![0, 0, 0, 14, b'i', b'i', b'n', b'f', 0, 0, 0, 0, 0, 0]);
    }
}
