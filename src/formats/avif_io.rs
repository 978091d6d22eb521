//! AVIF/HEIF metadata handler
//!
//! The profile lives in a `colr` property under `meta/iprp/ipco`; the Exif
//! block is an item declared in `meta/iinf` and located through `meta/iloc`,
//! normally inside a top-level `mdat`. Every edit goes through
//! [`patcher::splice`] so box sizes and item offsets stay consistent.
//!
//! Reference: ISO/IEC 23008-12:2022 § 6.5, § 9.3; AV1 Image File Format § 4

use super::{ContainerIO, HandlerOptions, MetadataHandler};
use crate::{
    containers::{
        bmff::{build_box, BoxDecoder, BoxRecord, BoxSpan, BoxType, FourCC},
        Container,
    },
    cursor::BinaryCursor,
    error::{Error, Result},
    info::{ColorProfile, ColorSpace, ExifData, ImageInfo},
    patcher,
    schema::{
        build_iinf, build_infe, read_pitm, FieldReader, IinfHeader, IlocBox, IlocExtent,
        IlocItem, InfeEntry, IpmaBox, IrefBox,
    },
    MediaType, MAX_SEGMENT_SIZE,
};
use byteorder::{BigEndian, ByteOrder};
use std::ops::Range;

const EXIF_ITEM_TYPE: FourCC = *b"Exif";
const CONTENT_DESCRIBES: FourCC = *b"cdsc";

// colr subtypes that carry ICC data ("nclx" does not)
const PROFILE_SUBTYPES: [FourCC; 2] = [*b"prof", *b"rICC"];
const NEW_PROFILE_SUBTYPE: FourCC = *b"prof";

const ALPHA_URNS: [&str; 2] = [
    "urn:mpeg:mpegB:cicp:systems:auxiliary:alpha",
    "urn:mpeg:hevc:2015:auxid:1",
];

// Exif item payload: tiff_header_offset(4) then the Exif block
const EXIF_PREFIX_LEN: usize = 4;

// ============================================================================
// Locators
// ============================================================================

fn record_at(buf: &[u8], span: BoxSpan) -> Result<BoxRecord<'_>> {
    let payload = buf
        .get(span.payload_range())
        .ok_or_else(|| Error::malformed(span.offset, "box runs past the buffer"))?;
    Ok(BoxRecord { span, payload })
}

fn fourcc_at(bytes: &[u8]) -> FourCC {
    let mut code = [0u8; 4];
    code.copy_from_slice(&bytes[..4]);
    code
}

/// Brands declared by the leading `ftyp`
struct Brands {
    major: FourCC,
    compatible: Vec<FourCC>,
}

impl Brands {
    fn read(buf: &[u8]) -> Result<Self> {
        let ftyp = match BoxDecoder::decode(buf).next() {
            Some(record) => record?,
            None => return Err(Error::InvalidFormat("Not a BMFF file (empty)".into())),
        };
        if ftyp.box_type() != BoxType::Ftyp {
            return Err(Error::InvalidFormat(
                "Not a BMFF file (missing ftyp box)".into(),
            ));
        }
        if ftyp.payload.len() < 8 {
            return Err(Error::malformed(ftyp.offset(), "ftyp box too short"));
        }
        Ok(Self {
            major: fourcc_at(ftyp.payload),
            compatible: ftyp.payload[8..].chunks_exact(4).map(fourcc_at).collect(),
        })
    }

    fn contains(&self, brand: &FourCC) -> bool {
        &self.major == brand || self.compatible.contains(brand)
    }

    fn media_type(&self) -> MediaType {
        if self.contains(b"avif") || self.contains(b"avis") {
            MediaType::Avif
        } else {
            MediaType::from_brand(&self.major)
        }
    }
}

/// Image sequences keep frames in tracks the patcher does not follow
fn is_animated(buf: &[u8]) -> Result<bool> {
    let brands = Brands::read(buf)?;
    Ok(brands.contains(b"avis")
        || BoxDecoder::find(buf, 0..buf.len(), BoxType::Moov)?.is_some())
}

fn find_meta(buf: &[u8]) -> Result<Option<BoxSpan>> {
    BoxDecoder::find(buf, 0..buf.len(), BoxType::Meta)
}

fn primary_item(buf: &[u8], meta: &BoxSpan) -> Result<Option<u32>> {
    match BoxDecoder::find_child(buf, meta, true, BoxType::Pitm)? {
        Some(span) => Ok(Some(read_pitm(&record_at(buf, span)?)?)),
        None => Ok(None),
    }
}

/// A `colr` property holding an ICC profile
struct ProfileLocation {
    /// meta, iprp, ipco
    path: Vec<BoxSpan>,
    colr: BoxSpan,
    subtype: FourCC,
    /// 1-based position inside `ipco`, as `ipma` counts
    index: u16,
}

fn property_index(position: usize, offset: usize) -> Result<u16> {
    u16::try_from(position + 1)
        .map_err(|_| Error::malformed(offset, "too many item properties"))
}

fn locate_profile(buf: &[u8]) -> Result<Option<ProfileLocation>> {
    let path = match BoxDecoder::find_path(buf, &[BoxType::Meta, BoxType::Iprp, BoxType::Ipco])? {
        Some(path) => path,
        None => return Ok(None),
    };
    let ipco = path[2];
    for (position, record) in BoxDecoder::children(buf, &ipco, false).enumerate() {
        let record = record?;
        if record.box_type() != BoxType::Colr || record.payload.len() < 4 {
            continue;
        }
        let subtype = fourcc_at(record.payload);
        if PROFILE_SUBTYPES.contains(&subtype) {
            return Ok(Some(ProfileLocation {
                index: property_index(position, record.offset())?,
                path,
                colr: record.span,
                subtype,
            }));
        }
    }
    Ok(None)
}

/// The first item declared with type `Exif`
struct ExifItem {
    iinf: IinfHeader,
    infe: InfeEntry,
}

fn locate_exif_item(buf: &[u8]) -> Result<Option<ExifItem>> {
    let path = match BoxDecoder::find_path(buf, &[BoxType::Meta, BoxType::Iinf])? {
        Some(path) => path,
        None => return Ok(None),
    };
    let iinf = IinfHeader::read(&record_at(buf, path[1])?)?;
    let infe = iinf
        .entries(buf)?
        .into_iter()
        .find(|entry| entry.item_type == Some(EXIF_ITEM_TYPE));
    Ok(infe.map(|infe| ExifItem { iinf, infe }))
}

fn read_iloc(buf: &[u8], meta: &BoxSpan) -> Result<Option<(BoxSpan, IlocBox)>> {
    match BoxDecoder::find_child(buf, meta, true, BoxType::Iloc)? {
        Some(span) => Ok(Some((span, IlocBox::read(&record_at(buf, span)?)?))),
        None => Ok(None),
    }
}

fn to_index(value: u64, offset: usize) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::malformed(offset, "item offset out of range"))
}

/// Concatenated extents of an item
fn item_data(buf: &[u8], meta: &BoxSpan, item: &IlocItem) -> Result<Vec<u8>> {
    if item.data_reference_index != 0 {
        return Err(Error::unsupported("item data stored in an external file"));
    }
    let area = match item.construction_method {
        0 => 0..buf.len(),
        1 => BoxDecoder::find_child(buf, meta, true, BoxType::Idat)?
            .ok_or_else(|| Error::malformed(meta.offset, "idat-constructed item without idat"))?
            .payload_range(),
        method => {
            return Err(Error::unsupported(format!(
                "item construction method {}",
                method
            )))
        }
    };

    let mut data = Vec::new();
    for extent in &item.extents {
        let start = item
            .base_offset
            .checked_add(extent.offset)
            .and_then(|rel| rel.checked_add(area.start as u64))
            .ok_or_else(|| Error::malformed(meta.offset, "item offset overflows"))?;
        let start = to_index(start, meta.offset)?;
        let end = match extent.length {
            // Zero length: the item runs to the end of its data area
            0 => area.end,
            length => start.saturating_add(to_index(length, meta.offset)?),
        };
        if start > end || end > area.end {
            return Err(Error::malformed(
                start,
                format!("item {} extent runs past its data", item.item_id),
            ));
        }
        if data.len() + (end - start) > MAX_SEGMENT_SIZE {
            return Err(Error::DataTooLarge {
                size: data.len() + (end - start),
                max: MAX_SEGMENT_SIZE,
            });
        }
        data.extend_from_slice(&buf[start..end]);
    }
    Ok(data)
}

/// Byte range of a single-extent, in-file item
fn file_range(item: &IlocItem, buf_len: usize) -> Result<Range<usize>> {
    if !item.in_file() {
        return Err(Error::unsupported(format!(
            "editing item {} stored outside plain file offsets",
            item.item_id
        )));
    }
    let extent = match item.extents.as_slice() {
        [extent] if extent.length > 0 => extent,
        extents => {
            return Err(Error::unsupported(format!(
                "editing item {} with {} extents",
                item.item_id,
                extents.len()
            )))
        }
    };
    let start = item
        .base_offset
        .checked_add(extent.offset)
        .ok_or_else(|| Error::malformed(0, "item offset overflows"))?;
    let start = to_index(start, 0)?;
    let end = start.saturating_add(to_index(extent.length, 0)?);
    if end > buf_len {
        return Err(Error::malformed(
            start,
            format!("item {} extent runs past the buffer", item.item_id),
        ));
    }
    Ok(start..end)
}

/// Top-level leaf box (normally `mdat`) that holds `range`
fn enclosing_box(buf: &[u8], range: &Range<usize>) -> Result<BoxSpan> {
    for record in BoxDecoder::decode(buf) {
        let span = record?.span;
        if span.payload_start() <= range.start && range.end <= span.end() {
            if span.is(BoxType::Meta) || span.is(BoxType::Moov) {
                return Err(Error::unsupported(format!(
                    "editing item data stored inside {}",
                    crate::containers::bmff::fourcc_str(&span.fourcc)
                )));
            }
            return Ok(span);
        }
    }
    Err(Error::malformed(
        range.start,
        "item data lies outside every top-level box",
    ))
}

fn strip_exif_prefix(raw: &[u8], offset: usize) -> Result<ExifData> {
    if raw.len() < EXIF_PREFIX_LEN {
        return Err(Error::malformed(offset, "Exif item shorter than its header offset"));
    }
    let skip = (BigEndian::read_u32(&raw[..EXIF_PREFIX_LEN]) as usize).saturating_add(EXIF_PREFIX_LEN);
    let tiff = raw
        .get(skip..)
        .ok_or_else(|| Error::malformed(offset, "Exif header offset points past the item"))?;
    Ok(ExifData::from(tiff))
}

fn build_colr(subtype: FourCC, data: &[u8]) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(4 + data.len());
    payload.extend_from_slice(&subtype);
    payload.extend_from_slice(data);
    build_box(BoxType::Colr, &payload)
}

/// `ipma` re-encoded after `edit`, or `None` when there is no `ipma`
fn edited_ipma(buf: &[u8], edit: impl FnOnce(&mut IpmaBox, Option<u32>)) -> Result<Option<Vec<u8>>> {
    let path = match BoxDecoder::find_path(buf, &[BoxType::Meta, BoxType::Iprp, BoxType::Ipma])? {
        Some(path) => path,
        None => {
            log::warn!("no ipma box, property associations left unchanged");
            return Ok(None);
        }
    };
    let mut ipma = IpmaBox::read(&record_at(buf, path[2])?)?;
    edit(&mut ipma, primary_item(buf, &path[0])?);
    Ok(Some(ipma.encode()?))
}

// ============================================================================
// Info
// ============================================================================

fn read_ispe(record: &BoxRecord) -> Result<(u32, u32)> {
    if record.payload.len() < 12 {
        return Err(Error::malformed(record.offset(), "ispe box too short"));
    }
    Ok((
        BigEndian::read_u32(&record.payload[4..8]),
        BigEndian::read_u32(&record.payload[8..12]),
    ))
}

/// (channel count, bits of the first channel)
fn read_pixi(record: &BoxRecord) -> Result<(u8, u8)> {
    match record.payload.get(4..) {
        Some([channels, depth, ..]) if *channels > 0 => Ok((*channels, *depth)),
        _ => Err(Error::malformed(record.offset(), "pixi box too short")),
    }
}

fn is_alpha_auxc(record: &BoxRecord) -> Result<bool> {
    let mut reader = FieldReader::new(record.payload, record.span.payload_start());
    reader.read_full_box()?;
    let urn = String::from_utf8_lossy(reader.read_cstr());
    Ok(ALPHA_URNS.contains(&&*urn) || urn.contains("alpha"))
}

/// Sample count of the first track
fn sample_count(buf: &[u8]) -> Result<Option<u32>> {
    let path = BoxDecoder::find_path(
        buf,
        &[
            BoxType::Moov,
            BoxType::Trak,
            BoxType::Mdia,
            BoxType::Minf,
            BoxType::Stbl,
            BoxType::Stsz,
        ],
    )?;
    let stsz = match path.as_deref() {
        Some([.., stsz]) => record_at(buf, *stsz)?,
        _ => return Ok(None),
    };
    if stsz.payload.len() < 12 {
        return Err(Error::malformed(stsz.offset(), "stsz box too short"));
    }
    Ok(Some(BigEndian::read_u32(&stsz.payload[8..12])))
}

/// Property indices associated with the primary item, if `pitm` and `ipma` say
fn primary_properties(buf: &[u8], meta: &BoxSpan, iprp: &BoxSpan) -> Result<Option<Vec<u16>>> {
    let primary = match primary_item(buf, meta)? {
        Some(id) => id,
        None => return Ok(None),
    };
    let ipma = match BoxDecoder::find_child(buf, iprp, false, BoxType::Ipma)? {
        Some(span) => IpmaBox::read(&record_at(buf, span)?)?,
        None => return Ok(None),
    };
    Ok(ipma
        .entries
        .into_iter()
        .find(|entry| entry.item_id == primary)
        .map(|entry| {
            entry
                .associations
                .into_iter()
                .map(|a| a.property_index)
                .collect()
        }))
}

fn read_info(buf: &[u8]) -> Result<ImageInfo> {
    let brands = Brands::read(buf)?;
    let is_animation = is_animated(buf)?;
    let mut info = ImageInfo {
        mime_type: brands.media_type().to_mime(),
        width: 0,
        height: 0,
        color_space: ColorSpace::Rgb,
        color_depth: 8,
        color_number: None,
        has_alpha_channel: false,
        is_animation,
        animation_frames: None,
        animation_repeat_count: None,
    };

    if let Some(path) = BoxDecoder::find_path(buf, &[BoxType::Meta, BoxType::Iprp, BoxType::Ipco])? {
        let properties: Vec<BoxRecord> =
            BoxDecoder::children(buf, &path[2], false).collect::<Result<_>>()?;
        let primary: Vec<&BoxRecord> = match primary_properties(buf, &path[0], &path[1])? {
            Some(indices) => indices
                .iter()
                .filter_map(|index| properties.get(usize::from(*index).checked_sub(1)?))
                .collect(),
            None => properties.iter().collect(),
        };

        let mut seen_ispe = false;
        let mut seen_pixi = false;
        for record in primary {
            match record.box_type() {
                BoxType::Ispe if !seen_ispe => {
                    (info.width, info.height) = read_ispe(record)?;
                    seen_ispe = true;
                }
                BoxType::Pixi if !seen_pixi => {
                    let (channels, depth) = read_pixi(record)?;
                    info.color_depth = depth;
                    info.color_space = if channels < 3 {
                        ColorSpace::Grayscale
                    } else {
                        ColorSpace::Rgb
                    };
                    seen_pixi = true;
                }
                _ => {}
            }
        }
        if !seen_ispe {
            log::warn!("primary item has no ispe property, dimensions unknown");
        }

        // Alpha planes are auxiliary items, so their auxC is not on the primary
        for record in &properties {
            if record.box_type() == BoxType::AuxC && is_alpha_auxc(record)? {
                info.has_alpha_channel = true;
            }
        }
    }

    if is_animation {
        info.animation_frames = sample_count(buf)?;
    }
    Ok(info)
}

// ============================================================================
// Handler
// ============================================================================

/// AVIF/HEIF image with an editable `colr` profile and `Exif` item
#[derive(Debug, Clone)]
pub struct AvifHandler {
    cursor: BinaryCursor,
}

impl AvifHandler {
    /// Take ownership of BMFF bytes; the first box must be `ftyp`
    pub fn new(buf: Vec<u8>) -> Result<Self> {
        Self::with_options(buf, HandlerOptions::default())
    }

    pub fn with_options(buf: Vec<u8>, _options: HandlerOptions) -> Result<Self> {
        Brands::read(&buf)?;
        Ok(Self {
            cursor: BinaryCursor::new(buf),
        })
    }

    fn buf(&self) -> &[u8] {
        self.cursor.as_bytes()
    }

    fn meta(&self) -> Result<BoxSpan> {
        find_meta(self.buf())?.ok_or_else(|| Error::unsupported("BMFF file has no meta box"))
    }

    fn ensure_editable(&self) -> Result<()> {
        if is_animated(self.buf())? {
            return Err(Error::unsupported("metadata edits on animated images"));
        }
        Ok(())
    }

    fn write_ipma(&mut self, encoded: &[u8]) -> Result<()> {
        let path = BoxDecoder::find_path(self.buf(), &[BoxType::Meta, BoxType::Iprp, BoxType::Ipma])?
            .ok_or_else(|| Error::malformed(0, "ipma box vanished during edit"))?;
        let ipma = path[2];
        patcher::splice(&mut self.cursor, &path[..2], ipma.offset, ipma.size, encoded)?;
        Ok(())
    }

    /// Replace a box under `meta` with new bytes, or append them after its last child
    fn put_in_meta(&mut self, existing: Option<BoxSpan>, bytes: &[u8]) -> Result<()> {
        let meta = self.meta()?;
        match existing {
            Some(span) => patcher::splice(&mut self.cursor, &[meta], span.offset, span.size, bytes)?,
            None => {
                let at = BoxDecoder::children_end(self.buf(), &meta, true)?;
                patcher::splice(&mut self.cursor, &[meta], at, 0, bytes)?
            }
        };
        Ok(())
    }

    fn write_iloc(&mut self, edit: impl FnOnce(&mut IlocBox)) -> Result<()> {
        let meta = self.meta()?;
        let (span, mut iloc) = match read_iloc(self.buf(), &meta)? {
            Some((span, iloc)) => (Some(span), iloc),
            None => (None, IlocBox::empty()),
        };
        edit(&mut iloc);
        iloc.fit_widths();
        let encoded = iloc.encode()?;
        self.put_in_meta(span, &encoded)
    }

    /// Overwrite the payload of an existing Exif item
    fn replace_exif(&mut self, item_id: u32, payload: &[u8]) -> Result<()> {
        let meta = self.meta()?;
        let (_, iloc) = read_iloc(self.buf(), &meta)?
            .ok_or_else(|| Error::malformed(meta.offset, "Exif item declared without iloc"))?;
        let item = iloc.item(item_id).ok_or_else(|| {
            Error::malformed(meta.offset, format!("Exif item {} has no location", item_id))
        })?;
        let range = file_range(item, self.buf().len())?;
        let holder = enclosing_box(self.buf(), &range)?;

        patcher::splice(&mut self.cursor, &[holder], range.start, range.len(), payload)?;
        let length = payload.len() as u64;
        self.write_iloc(|iloc| {
            if let Some(extent) = iloc
                .item_mut(item_id)
                .and_then(|item| item.extents.first_mut())
            {
                extent.length = length;
            }
        })?;
        log::debug!(
            "replaced Exif item {}: {} -> {} bytes",
            item_id,
            range.len(),
            payload.len()
        );
        Ok(())
    }

    /// Declare a new Exif item, store its payload and reference it
    fn insert_exif(&mut self, payload: &[u8]) -> Result<()> {
        // iinf, just before iloc or after the last child of meta
        let meta = self.meta()?;
        if BoxDecoder::find_child(self.buf(), &meta, true, BoxType::Iinf)?.is_none() {
            let at = match BoxDecoder::find_child(self.buf(), &meta, true, BoxType::Iloc)? {
                Some(iloc) => iloc.offset,
                None => BoxDecoder::children_end(self.buf(), &meta, true)?,
            };
            patcher::splice(&mut self.cursor, &[meta], at, 0, &build_iinf()?)?;
        }

        // infe with a fresh ID
        let meta = self.meta()?;
        let iinf_span = BoxDecoder::find_child(self.buf(), &meta, true, BoxType::Iinf)?
            .ok_or_else(|| Error::malformed(meta.offset, "iinf box vanished during edit"))?;
        let iinf = IinfHeader::read(&record_at(self.buf(), iinf_span)?)?;
        let located_ids = read_iloc(self.buf(), &meta)?
            .map(|(_, iloc)| iloc.items.iter().map(|i| i.item_id).max().unwrap_or(0))
            .unwrap_or(0);
        let declared_ids = iinf.entries(self.buf())?.iter().map(|e| e.item_id).max().unwrap_or(0);
        let item_id = declared_ids
            .max(located_ids)
            .checked_add(1)
            .ok_or_else(|| Error::unsupported("item ID space exhausted"))?;
        let count = iinf.entry_count + 1;
        self.cursor
            .write_uint(iinf.count_pos, iinf.count_width, count)
            .map_err(|_| Error::unsupported("iinf entry count overflows its field"))?;
        let infe = build_infe(item_id, EXIF_ITEM_TYPE, "")?;
        patcher::splice(&mut self.cursor, &[meta, iinf_span], iinf_span.end(), 0, &infe)?;

        // mdat, right after meta
        let mdat = match BoxDecoder::find(self.buf(), 0..self.buf().len(), BoxType::Mdat)? {
            Some(mdat) => mdat,
            None => {
                let meta = self.meta()?;
                patcher::splice(&mut self.cursor, &[], meta.end(), 0, &build_box(BoxType::Mdat, &[])?)?;
                BoxDecoder::find(self.buf(), 0..self.buf().len(), BoxType::Mdat)?
                    .ok_or_else(|| Error::malformed(meta.end(), "mdat box vanished during edit"))?
            }
        };

        // payload at the end of mdat
        let data_offset = mdat.end();
        patcher::splice(&mut self.cursor, &[mdat], data_offset, 0, payload)?;

        // iloc entry; later splices move it with the rest
        let length = payload.len() as u64;
        self.write_iloc(|iloc| {
            iloc.items.push(IlocItem {
                item_id,
                construction_method: 0,
                data_reference_index: 0,
                base_offset: 0,
                extents: vec![IlocExtent {
                    index: 0,
                    offset: data_offset as u64,
                    length,
                }],
            })
        })?;

        // cdsc reference to the primary item
        let meta = self.meta()?;
        match primary_item(self.buf(), &meta)? {
            Some(primary) => {
                let existing = BoxDecoder::find_child(self.buf(), &meta, true, BoxType::Iref)?;
                let mut iref = match existing {
                    Some(span) => IrefBox::read(self.buf(), &record_at(self.buf(), span)?)?,
                    None => IrefBox::empty(),
                };
                iref.add(CONTENT_DESCRIBES, item_id, primary);
                self.put_in_meta(existing, &iref.encode()?)?;
            }
            None => log::warn!("no primary item, Exif item {} left unreferenced", item_id),
        }

        log::debug!("inserted Exif item {} ({} bytes)", item_id, payload.len());
        Ok(())
    }

    /// Drop one Exif item: its data, its location, its declaration and its references
    fn remove_exif_item(&mut self, item_id: u32) -> Result<()> {
        let meta = self.meta()?;
        if let Some((_, iloc)) = read_iloc(self.buf(), &meta)? {
            if let Some(item) = iloc.item(item_id) {
                let range = file_range(item, self.buf().len())?;
                let holder = enclosing_box(self.buf(), &range)?;
                patcher::splice(&mut self.cursor, &[holder], range.start, range.len(), &[])?;
                self.write_iloc(|iloc| iloc.items.retain(|i| i.item_id != item_id))?;
            }
        }

        let meta = self.meta()?;
        let found = locate_exif_item(self.buf())?
            .filter(|found| found.infe.item_id == item_id)
            .ok_or_else(|| Error::malformed(meta.offset, "Exif infe vanished during edit"))?;
        self.cursor.write_uint(
            found.iinf.count_pos,
            found.iinf.count_width,
            found.iinf.entry_count.saturating_sub(1),
        )?;
        let infe = found.infe.span;
        patcher::splice(&mut self.cursor, &[meta, found.iinf.span], infe.offset, infe.size, &[])?;

        let meta = self.meta()?;
        if let Some(span) = BoxDecoder::find_child(self.buf(), &meta, true, BoxType::Iref)? {
            let mut iref = IrefBox::read(self.buf(), &record_at(self.buf(), span)?)?;
            if iref.remove_item(item_id) {
                let encoded = if iref.references.is_empty() {
                    Vec::new()
                } else {
                    iref.encode()?
                };
                patcher::splice(&mut self.cursor, &[meta], span.offset, span.size, &encoded)?;
            }
        }
        log::debug!("removed Exif item {}", item_id);
        Ok(())
    }
}

impl ContainerIO for AvifHandler {
    fn container_type() -> Container {
        Container::Bmff
    }

    fn supported_media_types() -> &'static [MediaType] {
        &[MediaType::Avif, MediaType::Heif, MediaType::Heic]
    }

    fn extensions() -> &'static [&'static str] {
        &["avif", "heif", "heic"]
    }

    fn mime_types() -> &'static [&'static str] {
        &["image/avif", "image/heif", "image/heic"]
    }

    fn detect(header: &[u8]) -> Option<Container> {
        // BMFF files start with ftyp box
        // Format: size(4) + 'ftyp'(4) + ...
        if header.len() >= 8 && &header[4..8] == b"ftyp" {
            return Some(Container::Bmff);
        }
        None
    }
}

impl MetadataHandler for AvifHandler {
    fn media_type(&self) -> Result<MediaType> {
        Ok(Brands::read(self.buf())?.media_type())
    }

    fn as_bytes(&self) -> &[u8] {
        self.buf()
    }

    fn into_bytes(self) -> Vec<u8> {
        self.cursor.into_inner()
    }

    fn info(&self) -> Result<ImageInfo> {
        read_info(self.buf())
    }

    fn supports_color_profile(&self) -> bool {
        true
    }

    fn supports_exif_data(&self) -> bool {
        true
    }

    fn has_color_profile(&self) -> Result<bool> {
        Ok(locate_profile(self.buf())?.is_some())
    }

    fn color_profile(&self) -> Result<Option<ColorProfile>> {
        match locate_profile(self.buf())? {
            Some(location) => {
                let colr = location.colr;
                let data = self.cursor.slice(colr.payload_start() + 4..colr.end())?;
                Ok(Some(ColorProfile::new(data.to_vec())))
            }
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

        if let Some(location) = locate_profile(self.buf())? {
            let colr = build_colr(location.subtype, &profile.data)?;
            let old = location.colr;
            patcher::splice(&mut self.cursor, &location.path, old.offset, old.size, &colr)?;
            return Ok(());
        }

        let path = match BoxDecoder::find_path(self.buf(), &[BoxType::Meta, BoxType::Iprp, BoxType::Ipco])? {
            Some(path) => path,
            None => {
                log::debug!("no ipco box, color profile not written");
                return Ok(());
            }
        };

        // Right after ispe, otherwise after the last property
        let ipco = path[2];
        let mut insert_at = None;
        let mut count = 0;
        let mut last_end = ipco.payload_start();
        for (position, record) in BoxDecoder::children(self.buf(), &ipco, false).enumerate() {
            let record = record?;
            count = position + 1;
            last_end = record.span.end();
            if insert_at.is_none() && record.box_type() == BoxType::Ispe {
                insert_at = Some((record.span.end(), property_index(count, record.offset())?));
            }
        }
        let (insert_at, index) = match insert_at {
            Some(found) => found,
            None => (last_end, property_index(count, ipco.offset)?),
        };

        let ipma = edited_ipma(self.buf(), |ipma, primary| {
            ipma.shift_for_insert(index);
            match primary {
                Some(item_id) => ipma.associate(item_id, index, false),
                None => log::warn!("no primary item, new colr property left unassociated"),
            }
        })?;
        let colr = build_colr(NEW_PROFILE_SUBTYPE, &profile.data)?;
        patcher::splice(&mut self.cursor, &path, insert_at, 0, &colr)?;
        if let Some(encoded) = ipma {
            self.write_ipma(&encoded)?;
        }
        log::debug!("inserted colr property {} ({} bytes)", index, profile.data.len());
        Ok(())
    }

    fn remove_color_profile(&mut self) -> Result<()> {
        self.ensure_editable()?;
        let location = match locate_profile(self.buf())? {
            Some(location) => location,
            None => return Ok(()),
        };
        let ipma = edited_ipma(self.buf(), |ipma, _| ipma.remove_property(location.index))?;
        let colr = location.colr;
        patcher::splice(&mut self.cursor, &location.path, colr.offset, colr.size, &[])?;
        if let Some(encoded) = ipma {
            self.write_ipma(&encoded)?;
        }
        Ok(())
    }

    fn has_exif_data(&self) -> Result<bool> {
        Ok(locate_exif_item(self.buf())?.is_some())
    }

    fn exif_data(&self) -> Result<Option<ExifData>> {
        let buf = self.buf();
        let found = match locate_exif_item(buf)? {
            Some(found) => found,
            None => return Ok(None),
        };
        let item_id = found.infe.item_id;
        let meta = self.meta()?;
        let (_, iloc) = read_iloc(buf, &meta)?
            .ok_or_else(|| Error::malformed(meta.offset, "Exif item declared without iloc"))?;
        let item = iloc.item(item_id).ok_or_else(|| {
            Error::malformed(meta.offset, format!("Exif item {} has no location", item_id))
        })?;
        let raw = item_data(buf, &meta, item)?;
        Ok(Some(strip_exif_prefix(&raw, found.infe.span.offset)?))
    }

    fn set_exif_data(&mut self, exif: &ExifData) -> Result<()> {
        self.ensure_editable()?;
        if exif.len() + EXIF_PREFIX_LEN > MAX_SEGMENT_SIZE {
            return Err(Error::DataTooLarge {
                size: exif.len() + EXIF_PREFIX_LEN,
                max: MAX_SEGMENT_SIZE,
            });
        }
        self.meta()?;

        // tiff_header_offset 0: the block follows the prefix directly
        let mut payload = Vec::with_capacity(EXIF_PREFIX_LEN + exif.len());
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(exif.as_bytes());

        match locate_exif_item(self.buf())? {
            Some(found) => self.replace_exif(found.infe.item_id, &payload),
            None => self.insert_exif(&payload),
        }
    }

    fn remove_exif_data(&mut self) -> Result<()> {
        self.ensure_editable()?;
        while let Some(found) = locate_exif_item(self.buf())? {
            self.remove_exif_item(found.infe.item_id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{check_bmff_sizes, AvifBuilder};

    fn init() {
        let _ = env_logger::builder()
            .is_test(true)
            .filter_level(log::LevelFilter::max())
            .try_init();
    }

    #[test]
    fn test_rejects_missing_ftyp() {
        let data = crate::test_utils::bmff_box(*b"mdat", &[1, 2, 3]);
        assert!(matches!(
            AvifHandler::new(data),
            Err(Error::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_info_from_primary_properties() {
        let avif = AvifBuilder::new(640, 480).pixi(&[10, 10, 10]).alpha().build();
        let info = AvifHandler::new(avif).unwrap().info().unwrap();
        assert_eq!(info.mime_type, "image/avif");
        assert_eq!((info.width, info.height), (640, 480));
        assert_eq!(info.color_depth, 10);
        assert_eq!(info.color_space, ColorSpace::Rgb);
        assert!(info.has_alpha_channel);
        assert!(!info.is_animation);
    }

    #[test]
    fn test_info_grayscale_heif() {
        let avif = AvifBuilder::new(8, 8)
            .brands(*b"heic", &[*b"mif1"])
            .pixi(&[8])
            .build();
        let info = AvifHandler::new(avif).unwrap().info().unwrap();
        assert_eq!(info.mime_type, "image/heic");
        assert_eq!(info.color_space, ColorSpace::Grayscale);
    }

    #[test]
    fn test_animated_frames_and_gate() {
        let mut handler = AvifHandler::new(AvifBuilder::new(4, 4).animated(12).build()).unwrap();
        let info = handler.info().unwrap();
        assert!(info.is_animation);
        assert_eq!(info.animation_frames, Some(12));
        assert!(!handler.supports_transforms());
        assert!(matches!(
            handler.set_color_profile(&ColorProfile::new(vec![1])),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_insert_profile_shifts_associations() {
        init();
        let avif = AvifBuilder::new(2, 2).pixi(&[8, 8, 8]).build();
        let mut handler = AvifHandler::new(avif).unwrap();
        handler.set_color_profile(&ColorProfile::new(vec![0x42; 64])).unwrap();
        check_bmff_sizes(handler.as_bytes()).unwrap();

        let location = locate_profile(handler.as_bytes()).unwrap().unwrap();
        assert_eq!(location.index, 2);
        assert_eq!(location.subtype, *b"prof");

        let buf = handler.as_bytes();
        let meta = find_meta(buf).unwrap().unwrap();
        let iprp = BoxDecoder::find_child(buf, &meta, true, BoxType::Iprp).unwrap().unwrap();
        let indices = primary_properties(buf, &meta, &iprp).unwrap().unwrap();
        // ispe, colr, pixi
        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(handler.info().unwrap().color_depth, 8);
    }

    #[test]
    fn test_replace_keeps_ricc_subtype() {
        let avif = AvifBuilder::new(2, 2).icc_subtype(*b"rICC", vec![1; 10]).build();
        let mut handler = AvifHandler::new(avif).unwrap();
        handler.set_color_profile(&ColorProfile::new(vec![2; 30])).unwrap();
        let location = locate_profile(handler.as_bytes()).unwrap().unwrap();
        assert_eq!(location.subtype, *b"rICC");
        assert_eq!(handler.color_profile().unwrap().unwrap().data, vec![2; 30]);
        check_bmff_sizes(handler.as_bytes()).unwrap();
    }

    #[test]
    fn test_missing_ipco_is_noop() {
        let mut handler = AvifHandler::new(AvifBuilder::minimal().build()).unwrap();
        let before = handler.as_bytes().to_vec();
        handler.set_color_profile(&ColorProfile::new(vec![1, 2, 3])).unwrap();
        handler.remove_color_profile().unwrap();
        assert_eq!(handler.as_bytes(), &before[..]);
    }

    #[test]
    fn test_exif_header_offset_honoured() {
        let mut item = 6u32.to_be_bytes().to_vec();
        item.extend_from_slice(b"Exif\0\0MM\0*");
        let exif = strip_exif_prefix(&item, 0).unwrap();
        assert_eq!(exif.as_bytes(), b"MM\0*");
        assert!(strip_exif_prefix(&[0, 0, 0, 9, 1], 0).is_err());
        assert!(strip_exif_prefix(&[0, 0], 0).is_err());
    }

    #[test]
    fn test_exif_insert_adds_cdsc_reference() {
        init();
        let mut handler = AvifHandler::new(AvifBuilder::new(2, 2).build()).unwrap();
        handler.set_exif_data(&ExifData::from(&b"II*\0payload"[..])).unwrap();
        check_bmff_sizes(handler.as_bytes()).unwrap();

        let buf = handler.as_bytes();
        let meta = find_meta(buf).unwrap().unwrap();
        let span = BoxDecoder::find_child(buf, &meta, true, BoxType::Iref).unwrap().unwrap();
        let iref = IrefBox::read(buf, &record_at(buf, span).unwrap()).unwrap();
        assert_eq!(iref.references.len(), 1);
        assert_eq!(iref.references[0].reference_type, *b"cdsc");
        assert_eq!(iref.references[0].from_item_id, 2);
        assert_eq!(iref.references[0].to_item_ids, vec![1]);

        handler.remove_exif_data().unwrap();
        let buf = handler.as_bytes();
        let meta = find_meta(buf).unwrap().unwrap();
        assert!(BoxDecoder::find_child(buf, &meta, true, BoxType::Iref).unwrap().is_none());
        check_bmff_sizes(buf).unwrap();
    }

    #[test]
    fn test_idat_exif_readable_not_editable() {
        let avif = AvifBuilder::new(2, 2).exif_in_idat(b"MM\0*idat".to_vec()).build();
        let mut handler = AvifHandler::new(avif).unwrap();
        assert_eq!(handler.exif_data().unwrap().unwrap().as_bytes(), b"MM\0*idat");
        assert!(matches!(
            handler.set_exif_data(&ExifData::from(&b"MM\0*"[..])),
            Err(Error::Unsupported(_))
        ));
    }
}
