//! PNG metadata handler
//!
//! PNG chunks are flat, so an edit only has to splice whole chunks and write a
//! fresh CRC; there are no ancestor sizes or absolute pointers to repair.

use super::{ContainerIO, HandlerOptions, MetadataHandler};
use crate::{
    containers::{
        png::{
            build_chunk, ChunkDecoder, ChunkSpan, ACTL, EXIF, ICCP, IHDR, PLTE, PNG_SIGNATURE,
        },
        Container,
    },
    cursor::BinaryCursor,
    error::{Error, Result},
    info::{ColorProfile, ColorSpace, ExifData, ImageInfo},
    MediaType, MAX_SEGMENT_SIZE,
};
use byteorder::{BigEndian, ByteOrder};
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use std::io::{Read, Write};

const TRNS: [u8; 4] = *b"tRNS";

// IHDR: width(4) height(4) depth(1) color_type(1) compression(1) filter(1) interlace(1)
const IHDR_LEN: usize = 13;

// iCCP keyword length limits
const MAX_KEYWORD_LEN: usize = 79;

/// PNG image with an editable `iCCP` profile and `eXIf` block
#[derive(Debug, Clone)]
pub struct PngHandler {
    cursor: BinaryCursor,
    options: HandlerOptions,
}

impl PngHandler {
    /// Take ownership of PNG bytes; the signature must be present
    pub fn new(buf: Vec<u8>) -> Result<Self> {
        Self::with_options(buf, HandlerOptions::default())
    }

    pub fn with_options(buf: Vec<u8>, options: HandlerOptions) -> Result<Self> {
        if !buf.starts_with(PNG_SIGNATURE) {
            return Err(Error::InvalidFormat("Not a PNG file".into()));
        }
        Ok(Self {
            cursor: BinaryCursor::new(buf),
            options,
        })
    }

    pub fn options(&self) -> &HandlerOptions {
        &self.options
    }

    fn buf(&self) -> &[u8] {
        self.cursor.as_bytes()
    }

    /// IHDR must be the first chunk
    fn ihdr(&self) -> Result<ChunkSpan> {
        let first = ChunkDecoder::decode(self.buf())
            .next()
            .transpose()?
            .ok_or_else(|| Error::malformed(PNG_SIGNATURE.len(), "missing IHDR chunk"))?;
        if !first.span.is(IHDR) || first.data.len() < IHDR_LEN {
            return Err(Error::malformed(first.span.offset, "first chunk is not a valid IHDR"));
        }
        Ok(first.span)
    }

    fn is_animated(&self) -> Result<bool> {
        Ok(ChunkDecoder::find(self.buf(), ACTL)?.is_some())
    }

    fn ensure_editable(&self) -> Result<()> {
        if self.is_animated()? {
            return Err(Error::unsupported("metadata edits on animated PNG"));
        }
        Ok(())
    }

    /// Replace an existing chunk or insert a new one right after IHDR
    fn put_chunk(&mut self, existing: Option<ChunkSpan>, chunk: &[u8]) -> Result<()> {
        let delta = match existing {
            Some(span) => self.cursor.splice(span.offset, span.total_size(), chunk)?,
            None => {
                let ihdr = self.ihdr()?;
                self.cursor.insert(ihdr.end(), chunk)?
            }
        };
        log::debug!("PNG chunk written, length changed by {}", delta);
        Ok(())
    }

    /// Remove every chunk of a type; a no-op when there is none
    fn remove_chunk(&mut self, chunk_type: [u8; 4]) -> Result<()> {
        while let Some(span) = ChunkDecoder::find(self.buf(), chunk_type)? {
            self.cursor.remove(span.offset..span.end())?;
            log::debug!("removed {} bytes of PNG chunk", span.total_size());
        }
        Ok(())
    }
}

impl ContainerIO for PngHandler {
    fn container_type() -> Container {
        Container::Png
    }

    fn supported_media_types() -> &'static [MediaType] {
        &[MediaType::Png]
    }

    fn extensions() -> &'static [&'static str] {
        &["png"]
    }

    fn mime_types() -> &'static [&'static str] {
        &["image/png"]
    }

    fn detect(header: &[u8]) -> Option<Container> {
        if header.len() >= 8 && &header[0..8] == PNG_SIGNATURE {
            return Some(Container::Png);
        }
        None
    }
}

fn color_model(color_type: u8, offset: usize) -> Result<(ColorSpace, bool)> {
    match color_type {
        0 => Ok((ColorSpace::Grayscale, false)),
        2 => Ok((ColorSpace::Rgb, false)),
        3 => Ok((ColorSpace::Palette, false)),
        4 => Ok((ColorSpace::Grayscale, true)),
        6 => Ok((ColorSpace::Rgb, true)),
        other => Err(Error::malformed(offset, format!("unknown PNG color type {}", other))),
    }
}

/// Parse `name\0 method compressed` from an iCCP payload
fn decode_iccp(data: &[u8], offset: usize) -> Result<ColorProfile> {
    let nul = data
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::malformed(offset, "iCCP profile name is not terminated"))?;
    let name: String = data[..nul].iter().map(|b| char::from(*b)).collect();

    let method = *data
        .get(nul + 1)
        .ok_or_else(|| Error::malformed(offset, "iCCP chunk has no compression method"))?;
    if method != 0 {
        return Err(Error::malformed(
            offset,
            format!("unknown iCCP compression method {}", method),
        ));
    }

    let mut profile = Vec::new();
    ZlibDecoder::new(&data[nul + 2..])
        .take(MAX_SEGMENT_SIZE as u64 + 1)
        .read_to_end(&mut profile)?;
    if profile.len() > MAX_SEGMENT_SIZE {
        return Err(Error::DataTooLarge {
            size: profile.len(),
            max: MAX_SEGMENT_SIZE,
        });
    }
    Ok(ColorProfile::named(name, profile))
}

/// Latin-1 keyword bytes, 1 to 79 long, without NUL
fn encode_keyword(name: &str) -> Result<Vec<u8>> {
    let bytes = name
        .chars()
        .map(|c| match u32::from(c) {
            0 => None,
            code @ 1..=0xFF => Some(code as u8),
            _ => None,
        })
        .collect::<Option<Vec<u8>>>()
        .ok_or_else(|| {
            Error::InvalidInput(format!("profile name {:?} is not NUL-free Latin-1", name))
        })?;
    if bytes.is_empty() || bytes.len() > MAX_KEYWORD_LEN {
        return Err(Error::InvalidInput(format!(
            "profile name must be 1-{} bytes, got {}",
            MAX_KEYWORD_LEN,
            bytes.len()
        )));
    }
    Ok(bytes)
}

impl MetadataHandler for PngHandler {
    fn media_type(&self) -> Result<MediaType> {
        Ok(MediaType::Png)
    }

    fn as_bytes(&self) -> &[u8] {
        self.buf()
    }

    fn into_bytes(self) -> Vec<u8> {
        self.cursor.into_inner()
    }

    fn info(&self) -> Result<ImageInfo> {
        let ihdr = self.ihdr()?;
        let header = self.cursor.slice(ihdr.data_range())?;
        let (color_space, mut has_alpha_channel) = color_model(header[9], ihdr.data_start() + 9)?;

        let mut info = ImageInfo {
            mime_type: MediaType::Png.to_mime(),
            width: BigEndian::read_u32(&header[0..4]),
            height: BigEndian::read_u32(&header[4..8]),
            color_space,
            color_depth: header[8],
            color_number: None,
            has_alpha_channel,
            is_animation: false,
            animation_frames: None,
            animation_repeat_count: None,
        };

        for chunk in ChunkDecoder::decode(self.buf()) {
            let chunk = chunk?;
            match chunk.chunk_type() {
                PLTE => {
                    if chunk.data.len() % 3 != 0 {
                        return Err(Error::malformed(
                            chunk.span.offset,
                            format!("PLTE length {} is not a multiple of 3", chunk.data.len()),
                        ));
                    }
                    info.color_number = Some((chunk.data.len() / 3) as u32);
                }
                ACTL => {
                    if chunk.data.len() < 8 {
                        return Err(Error::malformed(chunk.span.offset, "acTL chunk too short"));
                    }
                    info.is_animation = true;
                    info.animation_frames = Some(BigEndian::read_u32(&chunk.data[0..4]));
                    info.animation_repeat_count = Some(BigEndian::read_u32(&chunk.data[4..8]));
                }
                TRNS => has_alpha_channel = true,
                _ => {}
            }
        }
        info.has_alpha_channel = has_alpha_channel;
        Ok(info)
    }

    fn supports_color_profile(&self) -> bool {
        true
    }

    fn supports_exif_data(&self) -> bool {
        true
    }

    fn has_color_profile(&self) -> Result<bool> {
        Ok(ChunkDecoder::find(self.buf(), ICCP)?.is_some())
    }

    fn color_profile(&self) -> Result<Option<ColorProfile>> {
        match ChunkDecoder::find(self.buf(), ICCP)? {
            Some(span) => Ok(Some(decode_iccp(
                self.cursor.slice(span.data_range())?,
                span.offset,
            )?)),
            None => Ok(None),
        }
    }

    fn set_color_profile(&mut self, profile: &ColorProfile) -> Result<()> {
        self.ensure_editable()?;
        if profile.data.len() > MAX_SEGMENT_SIZE {
            return Err(Error::DataTooLarge {
                size: profile.data.len(),
                max: MAX_SEGMENT_SIZE,
            });
        }
        let name = profile
            .name
            .as_deref()
            .unwrap_or(&self.options.default_profile_name);

        let mut data = encode_keyword(name)?;
        data.extend_from_slice(&[0, 0]); // terminator, zlib method
        let mut encoder = ZlibEncoder::new(data, Compression::new(self.options.icc_compression_level));
        encoder.write_all(&profile.data)?;
        let chunk = build_chunk(ICCP, &encoder.finish()?)?;

        let existing = ChunkDecoder::find(self.buf(), ICCP)?;
        self.put_chunk(existing, &chunk)
    }

    fn remove_color_profile(&mut self) -> Result<()> {
        self.ensure_editable()?;
        self.remove_chunk(ICCP)
    }

    fn has_exif_data(&self) -> Result<bool> {
        Ok(ChunkDecoder::find(self.buf(), EXIF)?.is_some())
    }

    fn exif_data(&self) -> Result<Option<ExifData>> {
        match ChunkDecoder::find(self.buf(), EXIF)? {
            Some(span) => Ok(Some(ExifData::from(self.cursor.slice(span.data_range())?))),
            None => Ok(None),
        }
    }

    fn set_exif_data(&mut self, exif: &ExifData) -> Result<()> {
        self.ensure_editable()?;
        if exif.len() > MAX_SEGMENT_SIZE {
            return Err(Error::DataTooLarge {
                size: exif.len(),
                max: MAX_SEGMENT_SIZE,
            });
        }
        let chunk = build_chunk(EXIF, exif.as_bytes())?;
        let existing = ChunkDecoder::find(self.buf(), EXIF)?;
        self.put_chunk(existing, &chunk)
    }

    fn remove_exif_data(&mut self) -> Result<()> {
        self.ensure_editable()?;
        self.remove_chunk(EXIF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::PngBuilder;

    #[test]
    fn test_rejects_non_png() {
        assert!(matches!(
            PngHandler::new(b"GIF89a\0\0\0\0".to_vec()),
            Err(Error::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_info_palette() {
        let png = PngBuilder::new(4, 2)
            .color_type(3)
            .bit_depth(4)
            .chunk(*b"PLTE", vec![0; 9])
            .build();
        let info = PngHandler::new(png).unwrap().info().unwrap();
        assert_eq!(info.color_space, ColorSpace::Palette);
        assert_eq!(info.color_number, Some(3));
        assert_eq!(info.color_depth, 4);
        assert_eq!((info.width, info.height), (4, 2));
        assert!(!info.has_alpha_channel);
    }

    #[test]
    fn test_info_bad_palette_and_color_type() {
        let png = PngBuilder::new(1, 1)
            .color_type(3)
            .chunk(*b"PLTE", vec![0; 4])
            .build();
        assert!(matches!(
            PngHandler::new(png).unwrap().info(),
            Err(Error::Malformed { .. })
        ));

        let png = PngBuilder::new(1, 1).color_type(5).build();
        assert!(matches!(
            PngHandler::new(png).unwrap().info(),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn test_info_trns_gives_alpha() {
        let png = PngBuilder::new(1, 1)
            .color_type(2)
            .chunk(*b"tRNS", vec![0; 6])
            .build();
        assert!(PngHandler::new(png).unwrap().info().unwrap().has_alpha_channel);
    }

    #[test]
    fn test_apng_info_and_gate() {
        let mut actl = 5u32.to_be_bytes().to_vec();
        actl.extend_from_slice(&0u32.to_be_bytes());
        let png = PngBuilder::new(1, 1).chunk(*b"acTL", actl).build();
        let mut handler = PngHandler::new(png).unwrap();

        let info = handler.info().unwrap();
        assert!(info.is_animation);
        assert_eq!(info.animation_frames, Some(5));
        assert_eq!(info.animation_repeat_count, Some(0));
        assert!(!handler.supports_transforms());
        assert!(matches!(
            handler.set_exif_data(&ExifData::from(&b"MM\0*"[..])),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_profile_inserted_after_ihdr() {
        let mut handler = PngHandler::new(PngBuilder::new(1, 1).build()).unwrap();
        handler
            .set_color_profile(&ColorProfile::new(vec![7; 300]))
            .unwrap();

        let chunks: Vec<_> = ChunkDecoder::decode(handler.as_bytes())
            .map(|c| c.unwrap())
            .collect();
        assert_eq!(chunks[1].chunk_type(), ICCP);
        assert!(chunks.iter().all(|c| c.crc_matches()));

        let profile = handler.color_profile().unwrap().unwrap();
        assert_eq!(profile.name.as_deref(), Some(crate::formats::DEFAULT_PROFILE_NAME));
        assert_eq!(profile.data, vec![7; 300]);
    }

    #[test]
    fn test_profile_name_validation() {
        let mut handler = PngHandler::new(PngBuilder::new(1, 1).build()).unwrap();
        let original = handler.as_bytes().to_vec();
        for name in ["", "\u{0100}", "a\0b"] {
            assert!(matches!(
                handler.set_color_profile(&ColorProfile::named(name, vec![1])),
                Err(Error::InvalidInput(_))
            ));
        }
        let long = "x".repeat(80);
        assert!(handler
            .set_color_profile(&ColorProfile::named(long, vec![1]))
            .is_err());
        assert_eq!(handler.as_bytes(), &original[..]);

        handler
            .set_color_profile(&ColorProfile::named("caf\u{e9}", vec![1, 2]))
            .unwrap();
        assert_eq!(
            handler.color_profile().unwrap().unwrap().name.as_deref(),
            Some("caf\u{e9}")
        );
    }

    #[test]
    fn test_bad_compression_method() {
        let png = PngBuilder::new(1, 1)
            .chunk(*b"iCCP", b"name\0\x01data".to_vec())
            .build();
        let handler = PngHandler::new(png).unwrap();
        assert!(handler.has_color_profile().unwrap());
        assert!(matches!(
            handler.color_profile(),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn test_remove_drops_duplicate_chunks() {
        let png = PngBuilder::new(1, 1)
            .chunk(*b"eXIf", b"MM\0*one".to_vec())
            .chunk(*b"iCCP", b"a\0\0\x78\x9c\x03\x00\x00\x00\x00\x01".to_vec())
            .chunk(*b"eXIf", b"MM\0*two".to_vec())
            .chunk(*b"iCCP", b"b\0\0\x78\x9c\x03\x00\x00\x00\x00\x01".to_vec())
            .build();
        let plain = PngBuilder::new(1, 1).build();
        let mut handler = PngHandler::new(png).unwrap();

        handler.remove_exif_data().unwrap();
        assert!(!handler.has_exif_data().unwrap());
        handler.remove_color_profile().unwrap();
        assert!(!handler.has_color_profile().unwrap());
        assert_eq!(handler.as_bytes(), &plain[..]);
    }

    #[test]
    fn test_exif_replaced_in_place() {
        let png = PngBuilder::new(1, 1)
            .chunk(*b"eXIf", b"MM\0*old".to_vec())
            .build();
        let mut handler = PngHandler::new(png).unwrap();
        let before = handler.as_bytes().len();
        handler
            .set_exif_data(&ExifData::from(&b"MM\0*newer"[..]))
            .unwrap();
        assert_eq!(handler.as_bytes().len(), before + 2);
        assert_eq!(
            handler.exif_data().unwrap().unwrap().as_bytes(),
            b"MM\0*newer"
        );
        assert_eq!(
            ChunkDecoder::decode(handler.as_bytes())
                .filter(|c| c.as_ref().unwrap().chunk_type() == EXIF)
                .count(),
            1
        );
    }
}
