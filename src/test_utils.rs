//! Test utilities for building small images in memory.
//!
//! The builders produce structurally valid files with exactly the boxes or
//! chunks a test asks for, so tests can assert on byte-level layout without
//! shipping binary fixtures.
//!
//! # Usage
//!
//! ```no_run
//! use image_meta_io::test_utils::*;
//!
//! # fn example() -> image_meta_io::Result<()> {
//! let avif = AvifBuilder::new(64, 32).icc(vec![0x42; 128]).build();
//! check_bmff_sizes(&avif)?;
//!
//! let png = PngBuilder::new(8, 8).chunk(*b"tEXt", b"k\0v".to_vec()).build();
//! # Ok(())
//! # }
//! ```

use crate::{
    containers::bmff::{BoxDecoder, BoxRecord, FourCC},
    Error, Result,
};

/// Plain box: size(4) type(4) payload
pub fn bmff_box(fourcc: FourCC, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&((8 + payload.len()) as u32).to_be_bytes());
    out.extend_from_slice(&fourcc);
    out.extend_from_slice(payload);
    out
}

/// Full box: plain box whose payload starts with version(1) flags(3)
pub fn full_box(fourcc: FourCC, version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + payload.len());
    body.push(version);
    body.extend_from_slice(&flags.to_be_bytes()[1..]);
    body.extend_from_slice(payload);
    bmff_box(fourcc, &body)
}

/// PNG chunk with a correct CRC
#[cfg(feature = "png")]
pub fn png_chunk(chunk_type: FourCC, data: &[u8]) -> Vec<u8> {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&chunk_type);
    hasher.update(data);
    let mut out = Vec::with_capacity(12 + data.len());
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(&chunk_type);
    out.extend_from_slice(data);
    out.extend_from_slice(&hasher.finalize().to_be_bytes());
    out
}

/// Minimal PNG: IHDR, extra chunks, one IDAT, IEND
#[cfg(feature = "png")]
#[derive(Debug, Clone)]
pub struct PngBuilder {
    width: u32,
    height: u32,
    bit_depth: u8,
    color_type: u8,
    chunks: Vec<(FourCC, Vec<u8>)>,
}

#[cfg(feature = "png")]
impl PngBuilder {
    /// 8-bit truecolor by default
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            bit_depth: 8,
            color_type: 2,
            chunks: Vec::new(),
        }
    }

    pub fn color_type(mut self, color_type: u8) -> Self {
        self.color_type = color_type;
        self
    }

    pub fn bit_depth(mut self, bit_depth: u8) -> Self {
        self.bit_depth = bit_depth;
        self
    }

    /// Chunk placed between IHDR and IDAT, in call order
    pub fn chunk(mut self, chunk_type: FourCC, data: Vec<u8>) -> Self {
        self.chunks.push((chunk_type, data));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut ihdr = Vec::with_capacity(13);
        ihdr.extend_from_slice(&self.width.to_be_bytes());
        ihdr.extend_from_slice(&self.height.to_be_bytes());
        ihdr.extend_from_slice(&[self.bit_depth, self.color_type, 0, 0, 0]);

        let mut out = crate::containers::png::PNG_SIGNATURE.to_vec();
        out.extend(png_chunk(*b"IHDR", &ihdr));
        for (chunk_type, data) in &self.chunks {
            out.extend(png_chunk(*chunk_type, data));
        }
        out.extend(png_chunk(*b"IDAT", &[0x78, 0x01, 0x03, 0x00, 0x00, 0x00, 0x00, 0x01]));
        out.extend(png_chunk(*b"IEND", &[]));
        out
    }
}

const PRIMARY_ITEM: u16 = 1;
const EXIF_ITEM: u16 = 2;
const ALPHA_URN: &str = "urn:mpeg:mpegB:cicp:systems:auxiliary:alpha";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExifPlacement {
    Mdat,
    Idat,
}

/// Still AVIF with one primary `av01` item in `mdat`
///
/// Layout: `ftyp`, `meta` (hdlr, pitm, iinf, iloc, iprp, idat, iref), optional
/// `moov`, `mdat`. Item offsets are absolute and computed after layout.
#[derive(Debug, Clone)]
pub struct AvifBuilder {
    major: FourCC,
    compatible: Vec<FourCC>,
    width: u32,
    height: u32,
    minimal: bool,
    pixi: Option<Vec<u8>>,
    alpha: bool,
    icc: Option<(FourCC, Vec<u8>)>,
    exif: Option<(Vec<u8>, ExifPlacement)>,
    frames: Option<u32>,
    with_pitm: bool,
    with_ipma: bool,
    base_offsets: bool,
    image_data: Vec<u8>,
}

impl AvifBuilder {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            major: *b"avif",
            compatible: vec![*b"avif", *b"mif1", *b"miaf"],
            width,
            height,
            minimal: false,
            pixi: None,
            alpha: false,
            icc: None,
            exif: None,
            frames: None,
            with_pitm: true,
            with_ipma: true,
            base_offsets: false,
            image_data: vec![0xAA; 16],
        }
    }

    /// `ftyp` plus a `meta` holding only `hdlr`, an empty `iinf` and an empty `iloc`
    pub fn minimal() -> Self {
        Self {
            minimal: true,
            ..Self::new(0, 0)
        }
    }

    pub fn brands(mut self, major: FourCC, compatible: &[FourCC]) -> Self {
        self.major = major;
        self.compatible = compatible.to_vec();
        self
    }

    /// Bits per channel, one entry per channel
    pub fn pixi(mut self, depths: &[u8]) -> Self {
        self.pixi = Some(depths.to_vec());
        self
    }

    /// Alpha `auxC` property
    pub fn alpha(mut self) -> Self {
        self.alpha = true;
        self
    }

    /// `colr`/`prof` property associated with the primary item
    pub fn icc(self, data: Vec<u8>) -> Self {
        self.icc_subtype(*b"prof", data)
    }

    pub fn icc_subtype(mut self, subtype: FourCC, data: Vec<u8>) -> Self {
        self.icc = Some((subtype, data));
        self
    }

    /// Exif item stored in `mdat` after the image data
    pub fn exif(mut self, tiff: Vec<u8>) -> Self {
        self.exif = Some((tiff, ExifPlacement::Mdat));
        self
    }

    /// Exif item stored in `meta/idat` (construction method 1)
    pub fn exif_in_idat(mut self, tiff: Vec<u8>) -> Self {
        self.exif = Some((tiff, ExifPlacement::Idat));
        self
    }

    /// Image sequence brand plus a `moov` track with `frames` samples
    pub fn animated(mut self, frames: u32) -> Self {
        self.major = *b"avis";
        self.compatible = vec![*b"avis", *b"avif", *b"msf1", *b"mif1"];
        self.frames = Some(frames);
        self
    }

    pub fn without_pitm(mut self) -> Self {
        self.with_pitm = false;
        self
    }

    pub fn without_ipma(mut self) -> Self {
        self.with_ipma = false;
        self
    }

    /// `iloc` version 1 with absolute positions in base_offset and zero extent offsets
    pub fn base_offsets(mut self) -> Self {
        self.base_offsets = true;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let ftyp = self.ftyp();
        let moov = self.moov();
        // Sizes do not depend on offset values, so lay out once with zeros
        let probe = self.meta(0);
        let mdat_payload = ftyp.len() + probe.len() + moov.len() + 8;

        let mut out = ftyp;
        out.extend(self.meta(mdat_payload as u32));
        out.extend(moov);
        if !self.minimal {
            out.extend(bmff_box(*b"mdat", &self.mdat_payload()));
        }
        out
    }

    fn ftyp(&self) -> Vec<u8> {
        let mut payload = self.major.to_vec();
        payload.extend_from_slice(&0u32.to_be_bytes());
        for brand in &self.compatible {
            payload.extend_from_slice(brand);
        }
        bmff_box(*b"ftyp", &payload)
    }

    fn exif_item_payload(&self) -> Option<(Vec<u8>, ExifPlacement)> {
        self.exif.as_ref().map(|(tiff, placement)| {
            let mut payload = 0u32.to_be_bytes().to_vec();
            payload.extend_from_slice(tiff);
            (payload, *placement)
        })
    }

    fn mdat_payload(&self) -> Vec<u8> {
        let mut payload = self.image_data.clone();
        if let Some((exif, ExifPlacement::Mdat)) = self.exif_item_payload() {
            payload.extend(exif);
        }
        payload
    }

    fn meta(&self, mdat_payload: u32) -> Vec<u8> {
        let mut hdlr = vec![0; 4];
        hdlr.extend_from_slice(b"pict");
        hdlr.extend_from_slice(&[0; 12]);
        hdlr.push(0);
        let mut children = full_box(*b"hdlr", 0, 0, &hdlr);

        if self.minimal {
            children.extend(full_box(*b"iinf", 0, 0, &0u16.to_be_bytes()));
            children.extend(full_box(*b"iloc", 0, 0, &[0x44, 0x00, 0x00, 0x00]));
            return full_box(*b"meta", 0, 0, &children);
        }

        if self.with_pitm {
            children.extend(full_box(*b"pitm", 0, 0, &PRIMARY_ITEM.to_be_bytes()));
        }
        children.extend(self.iinf());
        children.extend(self.iloc(mdat_payload));
        children.extend(self.iprp());
        if let Some((exif, ExifPlacement::Idat)) = self.exif_item_payload() {
            children.extend(bmff_box(*b"idat", &exif));
        }
        if self.exif.is_some() && self.with_pitm {
            let mut cdsc = EXIF_ITEM.to_be_bytes().to_vec();
            cdsc.extend_from_slice(&1u16.to_be_bytes());
            cdsc.extend_from_slice(&PRIMARY_ITEM.to_be_bytes());
            children.extend(full_box(*b"iref", 0, 0, &bmff_box(*b"cdsc", &cdsc)));
        }
        full_box(*b"meta", 0, 0, &children)
    }

    fn iinf(&self) -> Vec<u8> {
        let infe = |item_id: u16, item_type: &[u8; 4]| {
            let mut body = item_id.to_be_bytes().to_vec();
            body.extend_from_slice(&[0, 0]);
            body.extend_from_slice(item_type);
            body.push(0);
            full_box(*b"infe", 2, 0, &body)
        };
        let mut count = 1u16;
        let mut entries = infe(PRIMARY_ITEM, b"av01");
        if self.exif.is_some() {
            count += 1;
            entries.extend(infe(EXIF_ITEM, b"Exif"));
        }
        let mut payload = count.to_be_bytes().to_vec();
        payload.extend(entries);
        full_box(*b"iinf", 0, 0, &payload)
    }

    fn iloc(&self, mdat_payload: u32) -> Vec<u8> {
        let version = if self.base_offsets || matches!(self.exif, Some((_, ExifPlacement::Idat))) {
            1
        } else {
            0
        };
        let base_size: u8 = if self.base_offsets { 4 } else { 0 };

        // (item_id, construction_method, absolute or idat-relative offset, length)
        let mut items = vec![(PRIMARY_ITEM, 0u16, mdat_payload, self.image_data.len() as u32)];
        if let Some((exif, placement)) = self.exif_item_payload() {
            match placement {
                ExifPlacement::Mdat => items.push((
                    EXIF_ITEM,
                    0,
                    mdat_payload + self.image_data.len() as u32,
                    exif.len() as u32,
                )),
                ExifPlacement::Idat => items.push((EXIF_ITEM, 1, 0, exif.len() as u32)),
            }
        }

        let mut payload = vec![0x44, base_size << 4];
        payload.extend_from_slice(&(items.len() as u16).to_be_bytes());
        for (item_id, method, offset, length) in items {
            payload.extend_from_slice(&item_id.to_be_bytes());
            if version >= 1 {
                payload.extend_from_slice(&method.to_be_bytes());
            }
            payload.extend_from_slice(&0u16.to_be_bytes());
            let extent_offset = if self.base_offsets {
                payload.extend_from_slice(&offset.to_be_bytes());
                0
            } else {
                offset
            };
            payload.extend_from_slice(&1u16.to_be_bytes());
            payload.extend_from_slice(&extent_offset.to_be_bytes());
            payload.extend_from_slice(&length.to_be_bytes());
        }
        full_box(*b"iloc", version, 0, &payload)
    }

    fn iprp(&self) -> Vec<u8> {
        let mut ispe = self.width.to_be_bytes().to_vec();
        ispe.extend_from_slice(&self.height.to_be_bytes());
        let mut properties = full_box(*b"ispe", 0, 0, &ispe);
        let mut associated = vec![1u8];

        if let Some(depths) = &self.pixi {
            let mut pixi = vec![depths.len() as u8];
            pixi.extend_from_slice(depths);
            properties.extend(full_box(*b"pixi", 0, 0, &pixi));
            associated.push(associated.len() as u8 + 1);
        }
        if let Some((subtype, data)) = &self.icc {
            let mut colr = subtype.to_vec();
            colr.extend_from_slice(data);
            properties.extend(bmff_box(*b"colr", &colr));
            associated.push(associated.len() as u8 + 1);
        }
        if self.alpha {
            let mut urn = ALPHA_URN.as_bytes().to_vec();
            urn.push(0);
            properties.extend(full_box(*b"auxC", 0, 0, &urn));
        }

        let mut children = bmff_box(*b"ipco", &properties);
        if self.with_ipma {
            let mut ipma = 1u32.to_be_bytes().to_vec();
            ipma.extend_from_slice(&PRIMARY_ITEM.to_be_bytes());
            ipma.push(associated.len() as u8);
            ipma.extend(associated);
            children.extend(full_box(*b"ipma", 0, 0, &ipma));
        }
        bmff_box(*b"iprp", &children)
    }

    fn moov(&self) -> Vec<u8> {
        let frames = match self.frames {
            Some(frames) => frames,
            None => return Vec::new(),
        };
        let mut stsz = 0u32.to_be_bytes().to_vec();
        stsz.extend_from_slice(&frames.to_be_bytes());
        for _ in 0..frames {
            stsz.extend_from_slice(&(self.image_data.len() as u32).to_be_bytes());
        }
        let stbl = bmff_box(*b"stbl", &full_box(*b"stsz", 0, 0, &stsz));
        let minf = bmff_box(*b"minf", &stbl);
        let mdia = bmff_box(*b"mdia", &minf);
        let trak = bmff_box(*b"trak", &mdia);
        bmff_box(*b"moov", &trak)
    }
}

/// Offset of the first child inside a container box, `None` for leaves
fn children_start(record: &BoxRecord) -> Option<usize> {
    let start = record.span.payload_start();
    match &record.fourcc() {
        b"meta" | b"iref" => Some(start + 4),
        b"iinf" => {
            let count_width = if record.payload.first() == Some(&0) { 2 } else { 4 };
            Some(start + 4 + count_width)
        }
        b"iprp" | b"ipco" | b"moov" | b"trak" | b"mdia" | b"minf" | b"stbl" | b"dinf" => {
            Some(start)
        }
        _ => None,
    }
}

fn check_level(buf: &[u8], start: usize, end: usize) -> Result<()> {
    let mut pos = start;
    for record in BoxDecoder::decode_range(buf, start..end) {
        let record = record?;
        if record.offset() != pos {
            return Err(Error::malformed(pos, "gap before box"));
        }
        pos = record.span.end();
        if let Some(first_child) = children_start(&record) {
            check_level(buf, first_child, record.span.end())?;
        }
    }
    if pos != end {
        return Err(Error::malformed(
            pos,
            format!("children stop {} bytes short of their parent", end - pos),
        ));
    }
    Ok(())
}

/// Verify every container's size equals its header plus its children, and
/// that top-level boxes tile the whole buffer
pub fn check_bmff_sizes(buf: &[u8]) -> Result<()> {
    check_level(buf, 0, buf.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_output_is_consistent() {
        check_bmff_sizes(&AvifBuilder::minimal().build()).unwrap();
        let avif = AvifBuilder::new(3, 3)
            .pixi(&[8, 8, 8])
            .icc(vec![1; 20])
            .alpha()
            .exif(b"MM\0*".to_vec())
            .animated(2)
            .build();
        check_bmff_sizes(&avif).unwrap();
    }

    #[test]
    fn test_size_check_catches_stale_parent() {
        let mut avif = AvifBuilder::new(3, 3).build();
        // Grow the file without touching any size field
        avif.extend_from_slice(&[0; 3]);
        assert!(check_bmff_sizes(&avif).is_err());
    }
}
