//! Field layouts of the HEIF item boxes
//!
//! `iinf`, `infe`, `iloc`, `ipma`, `iref` and `pitm` all select field widths
//! from their version, flags or size nibbles. Each layout is described once
//! as a table of [`Field`]s; [`FieldReader`] and [`write_fields`] interpret the
//! tables, so decoding and re-encoding share one set of width rules.
//!
//! Reference: ISO/IEC 14496-12:2022 § 8.11, ISO/IEC 23008-12:2022 § 9.3

use crate::{
    containers::bmff::{build_box, build_full_box, BoxDecoder, BoxRecord, BoxSpan, BoxType, FourCC},
    cursor::{push_uint, read_uint},
    error::{Error, Result},
};

/// Width rule for one field, in bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Width {
    Fixed(usize),
    /// `below` bytes when `version < from_version`, otherwise `at_or_above`
    Versioned {
        from_version: u8,
        below: usize,
        at_or_above: usize,
    },
    /// Present only for versions in `lo..=hi`
    OnlyVersions { lo: u8, hi: u8, width: usize },
    /// Selected by a flags bit
    Flag { mask: u32, set: usize, unset: usize },
    /// `iloc` size nibbles
    OffsetSize,
    LengthSize,
    BaseOffsetSize,
    IndexSize,
}

/// Values the width rules are evaluated against
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct FieldCtx {
    pub version: u8,
    pub flags: u32,
    pub offset_size: usize,
    pub length_size: usize,
    pub base_offset_size: usize,
    pub index_size: usize,
}

impl FieldCtx {
    pub fn versioned(version: u8, flags: u32) -> Self {
        Self {
            version,
            flags,
            ..Self::default()
        }
    }
}

impl Width {
    pub fn resolve(&self, ctx: &FieldCtx) -> usize {
        match *self {
            Width::Fixed(n) => n,
            Width::Versioned {
                from_version,
                below,
                at_or_above,
            } => {
                if ctx.version < from_version {
                    below
                } else {
                    at_or_above
                }
            }
            Width::OnlyVersions { lo, hi, width } => {
                if (lo..=hi).contains(&ctx.version) {
                    width
                } else {
                    0
                }
            }
            Width::Flag { mask, set, unset } => {
                if ctx.flags & mask != 0 {
                    set
                } else {
                    unset
                }
            }
            Width::OffsetSize => ctx.offset_size,
            Width::LengthSize => ctx.length_size,
            Width::BaseOffsetSize => ctx.base_offset_size,
            Width::IndexSize => ctx.index_size,
        }
    }
}

/// Named field of a box layout
#[derive(Clone, Copy, Debug)]
pub(crate) struct Field {
    pub name: &'static str,
    pub width: Width,
}

const fn field(name: &'static str, width: Width) -> Field {
    Field { name, width }
}

const ITEM_ID_V1: Width = Width::Versioned {
    from_version: 1,
    below: 2,
    at_or_above: 4,
};

pub(crate) const FULL_BOX: [Field; 2] = [
    field("version", Width::Fixed(1)),
    field("flags", Width::Fixed(3)),
];

pub(crate) const IINF: [Field; 1] = [field("entry_count", ITEM_ID_V1)];

pub(crate) const INFE_LEGACY: [Field; 2] = [
    field("item_ID", Width::Fixed(2)),
    field("item_protection_index", Width::Fixed(2)),
];

pub(crate) const INFE: [Field; 3] = [
    field(
        "item_ID",
        Width::Versioned {
            from_version: 3,
            below: 2,
            at_or_above: 4,
        },
    ),
    field("item_protection_index", Width::Fixed(2)),
    field("item_type", Width::Fixed(4)),
];

pub(crate) const PITM: [Field; 1] = [field("item_ID", ITEM_ID_V1)];

pub(crate) const ILOC_SIZES: [Field; 2] = [
    field("offset_size|length_size", Width::Fixed(1)),
    field("base_offset_size|index_size", Width::Fixed(1)),
];

const ITEM_ID_V2: Width = Width::Versioned {
    from_version: 2,
    below: 2,
    at_or_above: 4,
};

pub(crate) const ILOC: [Field; 1] = [field("item_count", ITEM_ID_V2)];

pub(crate) const ILOC_ITEM: [Field; 5] = [
    field("item_ID", ITEM_ID_V2),
    field(
        "construction_method",
        Width::OnlyVersions {
            lo: 1,
            hi: 2,
            width: 2,
        },
    ),
    field("data_reference_index", Width::Fixed(2)),
    field("base_offset", Width::BaseOffsetSize),
    field("extent_count", Width::Fixed(2)),
];

pub(crate) const ILOC_EXTENT: [Field; 3] = [
    field("extent_index", Width::IndexSize),
    field("extent_offset", Width::OffsetSize),
    field("extent_length", Width::LengthSize),
];

pub(crate) const IPMA: [Field; 1] = [field("entry_count", Width::Fixed(4))];

pub(crate) const IPMA_ENTRY: [Field; 2] = [
    field("item_ID", ITEM_ID_V1),
    field("association_count", Width::Fixed(1)),
];

pub(crate) const IPMA_ASSOCIATION: [Field; 1] = [field(
    "essential|property_index",
    Width::Flag {
        mask: 1,
        set: 2,
        unset: 1,
    },
)];

pub(crate) const IREF_ENTRY: [Field; 2] = [
    field("from_item_ID", ITEM_ID_V1),
    field("reference_count", Width::Fixed(2)),
];

pub(crate) const IREF_TARGET: [Field; 1] = [field("to_item_ID", ITEM_ID_V1)];

/// Sequential reader over a box payload
pub(crate) struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
    /// Absolute offset of `buf[0]`, for error reporting
    base: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8], base: usize) -> Self {
        Self { buf, pos: 0, base }
    }

    /// Absolute offset of the next unread byte
    pub fn position(&self) -> usize {
        self.base + self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn read<const N: usize>(&mut self, fields: &[Field; N], ctx: &FieldCtx) -> Result<[u64; N]> {
        let mut values = [0u64; N];
        for (value, field) in values.iter_mut().zip(fields) {
            let width = field.width.resolve(ctx);
            *value = read_uint(self.buf, self.pos, width).map_err(|_| {
                Error::malformed(self.position(), format!("truncated field {}", field.name))
            })?;
            self.pos += width;
        }
        Ok(values)
    }

    /// Null-terminated string; a missing terminator consumes the rest
    pub fn read_cstr(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos.min(self.buf.len())..];
        match rest.iter().position(|b| *b == 0) {
            Some(n) => {
                self.pos += n + 1;
                &rest[..n]
            }
            None => {
                self.pos = self.buf.len();
                rest
            }
        }
    }

    pub fn read_full_box(&mut self) -> Result<(u8, u32)> {
        let [version, flags] = self.read(&FULL_BOX, &FieldCtx::default())?;
        Ok((version as u8, flags as u32))
    }
}

/// Append fields according to a layout
pub(crate) fn write_fields<const N: usize>(
    out: &mut Vec<u8>,
    fields: &[Field; N],
    ctx: &FieldCtx,
    values: [u64; N],
) -> Result<()> {
    for (field, value) in fields.iter().zip(values) {
        push_uint(out, field.width.resolve(ctx), value).map_err(|_| {
            Error::unsupported(format!("{} value {} does not fit its field", field.name, value))
        })?;
    }
    Ok(())
}

fn check_version(record: &BoxRecord, version: u8, max: u8) -> Result<()> {
    if version > max {
        return Err(Error::malformed(
            record.offset(),
            format!(
                "unsupported {} version {}",
                crate::containers::bmff::fourcc_str(&record.fourcc()),
                version
            ),
        ));
    }
    Ok(())
}

fn fourcc_from(value: u64) -> FourCC {
    (value as u32).to_be_bytes()
}

/// Smallest width able to hold `max`, keeping `current` if it already does
fn width_for(max: u64, current: usize) -> usize {
    let fits = match current {
        0 => max == 0,
        8 => true,
        n => max < (1u64 << (n * 8)),
    };
    if fits {
        current
    } else if max <= u64::from(u32::MAX) {
        4
    } else {
        8
    }
}

// ============================================================================
// iinf / infe
// ============================================================================

/// Parsed `iinf` header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct IinfHeader {
    pub span: BoxSpan,
    pub version: u8,
    pub entry_count: u64,
    /// Absolute offset of the entry_count field
    pub count_pos: usize,
    pub count_width: usize,
    /// Absolute offset of the first `infe` box
    pub entries_start: usize,
}

impl IinfHeader {
    pub fn read(record: &BoxRecord) -> Result<Self> {
        let mut reader = FieldReader::new(record.payload, record.span.payload_start());
        let (version, flags) = reader.read_full_box()?;
        check_version(record, version, 1)?;
        let ctx = FieldCtx::versioned(version, flags);
        let count_pos = reader.position();
        let [entry_count] = reader.read(&IINF, &ctx)?;
        Ok(Self {
            span: record.span,
            version,
            entry_count,
            count_pos,
            count_width: IINF[0].width.resolve(&ctx),
            entries_start: reader.position(),
        })
    }

    /// The `infe` boxes that follow the header
    pub fn entries(&self, buf: &[u8]) -> Result<Vec<InfeEntry>> {
        let mut entries = Vec::new();
        for record in BoxDecoder::decode_range(buf, self.entries_start..self.span.end()) {
            let record = record?;
            if record.box_type() == BoxType::Infe {
                entries.push(InfeEntry::read(&record)?);
            }
        }
        Ok(entries)
    }
}

/// Empty `iinf` box
pub(crate) fn build_iinf() -> Result<Vec<u8>> {
    let mut body = Vec::new();
    write_fields(&mut body, &IINF, &FieldCtx::versioned(0, 0), [0])?;
    build_full_box(BoxType::Iinf, 0, 0, &body)
}

/// One item info entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct InfeEntry {
    pub span: BoxSpan,
    pub version: u8,
    pub item_id: u32,
    /// Versions 0 and 1 carry no item type
    pub item_type: Option<FourCC>,
}

impl InfeEntry {
    pub fn read(record: &BoxRecord) -> Result<Self> {
        let mut reader = FieldReader::new(record.payload, record.span.payload_start());
        let (version, flags) = reader.read_full_box()?;
        check_version(record, version, 3)?;
        let ctx = FieldCtx::versioned(version, flags);
        let (item_id, item_type) = if version < 2 {
            let [item_id, _protection] = reader.read(&INFE_LEGACY, &ctx)?;
            (item_id, None)
        } else {
            let [item_id, _protection, item_type] = reader.read(&INFE, &ctx)?;
            (item_id, Some(fourcc_from(item_type)))
        };
        Ok(Self {
            span: record.span,
            version,
            item_id: item_id as u32,
            item_type,
        })
    }
}

/// New `infe` box (version 2, or 3 for IDs beyond 16 bits)
pub(crate) fn build_infe(item_id: u32, item_type: FourCC, name: &str) -> Result<Vec<u8>> {
    let version = if item_id > u32::from(u16::MAX) { 3 } else { 2 };
    let ctx = FieldCtx::versioned(version, 0);
    let mut body = Vec::new();
    write_fields(
        &mut body,
        &INFE,
        &ctx,
        [
            u64::from(item_id),
            0,
            u64::from(u32::from_be_bytes(item_type)),
        ],
    )?;
    body.extend_from_slice(name.as_bytes());
    body.push(0);
    build_full_box(BoxType::Infe, version, 0, &body)
}

/// Primary item ID from a `pitm` box
pub(crate) fn read_pitm(record: &BoxRecord) -> Result<u32> {
    let mut reader = FieldReader::new(record.payload, record.span.payload_start());
    let (version, flags) = reader.read_full_box()?;
    check_version(record, version, 1)?;
    let [item_id] = reader.read(&PITM, &FieldCtx::versioned(version, flags))?;
    Ok(item_id as u32)
}

// ============================================================================
// iloc
// ============================================================================

/// One extent of an item
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct IlocExtent {
    pub index: u64,
    pub offset: u64,
    pub length: u64,
}

/// Location entry for one item
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct IlocItem {
    pub item_id: u32,
    /// 0 = file offset, 1 = `idat` offset, 2 = item offset
    pub construction_method: u8,
    pub data_reference_index: u16,
    pub base_offset: u64,
    pub extents: Vec<IlocExtent>,
}

impl IlocItem {
    /// Item stored in this file at absolute offsets
    pub fn in_file(&self) -> bool {
        self.construction_method == 0 && self.data_reference_index == 0
    }
}

/// Decoded `iloc` box
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct IlocBox {
    pub version: u8,
    pub flags: u32,
    pub offset_size: usize,
    pub length_size: usize,
    pub base_offset_size: usize,
    pub index_size: usize,
    pub items: Vec<IlocItem>,
}

fn size_nibble(value: u64, pos: usize, what: &str) -> Result<usize> {
    match value {
        0 | 4 | 8 => Ok(value as usize),
        _ => Err(Error::malformed(pos, format!("invalid iloc {} {}", what, value))),
    }
}

impl IlocBox {
    /// Empty box with 4-byte offsets and lengths
    pub fn empty() -> Self {
        Self {
            version: 0,
            flags: 0,
            offset_size: 4,
            length_size: 4,
            base_offset_size: 0,
            index_size: 0,
            items: Vec::new(),
        }
    }

    pub fn ctx(&self) -> FieldCtx {
        FieldCtx {
            version: self.version,
            flags: self.flags,
            offset_size: self.offset_size,
            length_size: self.length_size,
            base_offset_size: self.base_offset_size,
            index_size: if self.version == 0 { 0 } else { self.index_size },
        }
    }

    pub fn read(record: &BoxRecord) -> Result<Self> {
        let mut reader = FieldReader::new(record.payload, record.span.payload_start());
        let (version, flags) = reader.read_full_box()?;
        check_version(record, version, 2)?;

        let sizes_pos = reader.position();
        let [packed, packed_base] = reader.read(&ILOC_SIZES, &FieldCtx::default())?;
        let offset_size = size_nibble(packed >> 4, sizes_pos, "offset_size")?;
        let length_size = size_nibble(packed & 0x0F, sizes_pos, "length_size")?;
        let base_offset_size = size_nibble(packed_base >> 4, sizes_pos + 1, "base_offset_size")?;
        let index_size = match version {
            0 => 0, // reserved
            _ => size_nibble(packed_base & 0x0F, sizes_pos + 1, "index_size")?,
        };

        let mut iloc = Self {
            version,
            flags,
            offset_size,
            length_size,
            base_offset_size,
            index_size,
            items: Vec::new(),
        };
        let ctx = iloc.ctx();

        let [item_count] = reader.read(&ILOC, &ctx)?;
        for _ in 0..item_count {
            let [item_id, construction_method, data_reference_index, base_offset, extent_count] =
                reader.read(&ILOC_ITEM, &ctx)?;
            let mut extents = Vec::new();
            for _ in 0..extent_count {
                let [index, offset, length] = reader.read(&ILOC_EXTENT, &ctx)?;
                extents.push(IlocExtent {
                    index,
                    offset,
                    length,
                });
            }
            iloc.items.push(IlocItem {
                item_id: item_id as u32,
                construction_method: (construction_method & 0x0F) as u8,
                data_reference_index: data_reference_index as u16,
                base_offset,
                extents,
            });
        }

        if reader.remaining() != 0 {
            return Err(Error::malformed(reader.position(), "invalid iloc size"));
        }
        Ok(iloc)
    }

    /// Serialize the whole box with the current widths
    pub fn encode(&self) -> Result<Vec<u8>> {
        let ctx = self.ctx();
        let mut body = Vec::new();
        body.push(((self.offset_size << 4) | self.length_size) as u8);
        body.push(((self.base_offset_size << 4) | ctx.index_size) as u8);
        write_fields(&mut body, &ILOC, &ctx, [self.items.len() as u64])?;
        for item in &self.items {
            write_fields(
                &mut body,
                &ILOC_ITEM,
                &ctx,
                [
                    u64::from(item.item_id),
                    u64::from(item.construction_method),
                    u64::from(item.data_reference_index),
                    item.base_offset,
                    item.extents.len() as u64,
                ],
            )?;
            for extent in &item.extents {
                write_fields(
                    &mut body,
                    &ILOC_EXTENT,
                    &ctx,
                    [extent.index, extent.offset, extent.length],
                )?;
            }
        }
        build_full_box(BoxType::Iloc, self.version, self.flags, &body)
    }

    pub fn item(&self, item_id: u32) -> Option<&IlocItem> {
        self.items.iter().find(|item| item.item_id == item_id)
    }

    pub fn item_mut(&mut self, item_id: u32) -> Option<&mut IlocItem> {
        self.items.iter_mut().find(|item| item.item_id == item_id)
    }

    /// Grow field widths (and the version for wide IDs) until every value fits
    pub fn fit_widths(&mut self) {
        let max_id = self.items.iter().map(|i| i.item_id).max().unwrap_or(0);
        if self.version < 2 && (max_id > u32::from(u16::MAX) || self.items.len() > usize::from(u16::MAX)) {
            self.version = 2;
        }
        let extents = || self.items.iter().flat_map(|i| i.extents.iter());
        let max_offset = extents().map(|e| e.offset).max().unwrap_or(0);
        let max_length = extents().map(|e| e.length).max().unwrap_or(0);
        let max_base = self.items.iter().map(|i| i.base_offset).max().unwrap_or(0);
        self.offset_size = width_for(max_offset, self.offset_size);
        self.length_size = width_for(max_length, self.length_size);
        self.base_offset_size = width_for(max_base, self.base_offset_size);
    }
}

// ============================================================================
// ipma
// ============================================================================

/// One property association
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Association {
    pub essential: bool,
    /// 1-based index into `ipco`; 0 means "no property"
    pub property_index: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct IpmaEntry {
    pub item_id: u32,
    pub associations: Vec<Association>,
}

/// Decoded `ipma` box
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct IpmaBox {
    pub version: u8,
    pub flags: u32,
    pub entries: Vec<IpmaEntry>,
}

impl IpmaBox {
    fn ctx(&self) -> FieldCtx {
        FieldCtx::versioned(self.version, self.flags)
    }

    /// Largest index the association field can hold
    pub fn max_property_index(&self) -> u16 {
        if self.flags & 1 != 0 {
            0x7FFF
        } else {
            0x7F
        }
    }

    pub fn read(record: &BoxRecord) -> Result<Self> {
        let mut reader = FieldReader::new(record.payload, record.span.payload_start());
        let (version, flags) = reader.read_full_box()?;
        check_version(record, version, 1)?;
        let ctx = FieldCtx::versioned(version, flags);
        let wide = flags & 1 != 0;

        let [entry_count] = reader.read(&IPMA, &ctx)?;
        let mut entries = Vec::new();
        for _ in 0..entry_count {
            let [item_id, association_count] = reader.read(&IPMA_ENTRY, &ctx)?;
            let mut associations = Vec::new();
            for _ in 0..association_count {
                let [raw] = reader.read(&IPMA_ASSOCIATION, &ctx)?;
                let (essential, property_index) = if wide {
                    (raw & 0x8000 != 0, (raw & 0x7FFF) as u16)
                } else {
                    (raw & 0x80 != 0, (raw & 0x7F) as u16)
                };
                associations.push(Association {
                    essential,
                    property_index,
                });
            }
            entries.push(IpmaEntry {
                item_id: item_id as u32,
                associations,
            });
        }
        Ok(Self {
            version,
            flags,
            entries,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let ctx = self.ctx();
        let wide = self.flags & 1 != 0;
        let max_index = self.max_property_index();
        let mut body = Vec::new();
        write_fields(&mut body, &IPMA, &ctx, [self.entries.len() as u64])?;
        for entry in &self.entries {
            write_fields(
                &mut body,
                &IPMA_ENTRY,
                &ctx,
                [u64::from(entry.item_id), entry.associations.len() as u64],
            )?;
            for assoc in &entry.associations {
                if assoc.property_index > max_index {
                    return Err(Error::unsupported(format!(
                        "property index {} exceeds ipma field (max {})",
                        assoc.property_index, max_index
                    )));
                }
                let essential_bit = match (assoc.essential, wide) {
                    (false, _) => 0,
                    (true, true) => 0x8000,
                    (true, false) => 0x80,
                };
                write_fields(
                    &mut body,
                    &IPMA_ASSOCIATION,
                    &ctx,
                    [essential_bit | u64::from(assoc.property_index)],
                )?;
            }
        }
        build_full_box(BoxType::Ipma, self.version, self.flags, &body)
    }

    /// Make room for a property inserted at `index` (1-based)
    pub fn shift_for_insert(&mut self, index: u16) {
        for assoc in self.entries.iter_mut().flat_map(|e| e.associations.iter_mut()) {
            if assoc.property_index >= index {
                assoc.property_index += 1;
            }
        }
    }

    /// Drop associations to the property at `index` and close the gap
    pub fn remove_property(&mut self, index: u16) {
        for entry in &mut self.entries {
            entry.associations.retain(|a| a.property_index != index);
            for assoc in &mut entry.associations {
                if assoc.property_index > index {
                    assoc.property_index -= 1;
                }
            }
        }
    }

    /// Associate a property with an item, adding an entry if needed
    ///
    /// The association goes ahead of any property that follows it in `ipco`.
    pub fn associate(&mut self, item_id: u32, property_index: u16, essential: bool) {
        if item_id > u32::from(u16::MAX) {
            self.version = self.version.max(1);
        }
        let assoc = Association {
            essential,
            property_index,
        };
        match self.entries.iter_mut().find(|e| e.item_id == item_id) {
            Some(entry) => {
                // Keep the list in ipco order
                let at = entry
                    .associations
                    .iter()
                    .position(|a| a.property_index > property_index)
                    .unwrap_or(entry.associations.len());
                entry.associations.insert(at, assoc);
            }
            None => {
                let at = self
                    .entries
                    .iter()
                    .position(|e| e.item_id > item_id)
                    .unwrap_or(self.entries.len());
                self.entries.insert(
                    at,
                    IpmaEntry {
                        item_id,
                        associations: vec![assoc],
                    },
                );
            }
        }
    }
}

// ============================================================================
// iref
// ============================================================================

/// One SingleItemTypeReferenceBox
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ItemReference {
    pub reference_type: FourCC,
    pub from_item_id: u32,
    pub to_item_ids: Vec<u32>,
}

/// Decoded `iref` box
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct IrefBox {
    pub version: u8,
    pub flags: u32,
    pub references: Vec<ItemReference>,
}

impl IrefBox {
    pub fn empty() -> Self {
        Self {
            version: 0,
            flags: 0,
            references: Vec::new(),
        }
    }

    pub fn read(buf: &[u8], record: &BoxRecord) -> Result<Self> {
        let (version, flags) = record.full_box_header()?;
        check_version(record, version, 1)?;
        let ctx = FieldCtx::versioned(version, flags);

        let mut references = Vec::new();
        for child in BoxDecoder::children(buf, &record.span, true) {
            let child = child?;
            let mut reader = FieldReader::new(child.payload, child.span.payload_start());
            let [from_item_id, reference_count] = reader.read(&IREF_ENTRY, &ctx)?;
            let mut to_item_ids = Vec::new();
            for _ in 0..reference_count {
                let [to] = reader.read(&IREF_TARGET, &ctx)?;
                to_item_ids.push(to as u32);
            }
            references.push(ItemReference {
                reference_type: child.fourcc(),
                from_item_id: from_item_id as u32,
                to_item_ids,
            });
        }
        Ok(Self {
            version,
            flags,
            references,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let ctx = FieldCtx::versioned(self.version, self.flags);
        let mut body = Vec::new();
        for reference in &self.references {
            let mut entry = Vec::new();
            write_fields(
                &mut entry,
                &IREF_ENTRY,
                &ctx,
                [
                    u64::from(reference.from_item_id),
                    reference.to_item_ids.len() as u64,
                ],
            )?;
            for to in &reference.to_item_ids {
                write_fields(&mut entry, &IREF_TARGET, &ctx, [u64::from(*to)])?;
            }
            body.extend(build_box(BoxType::from(reference.reference_type), &entry)?);
        }
        build_full_box(BoxType::Iref, self.version, self.flags, &body)
    }

    pub fn add(&mut self, reference_type: FourCC, from_item_id: u32, to_item_id: u32) {
        if from_item_id.max(to_item_id) > u32::from(u16::MAX) {
            self.version = self.version.max(1);
        }
        self.references.push(ItemReference {
            reference_type,
            from_item_id,
            to_item_ids: vec![to_item_id],
        });
    }

    /// Forget every reference from or to `item_id`; returns whether anything changed
    pub fn remove_item(&mut self, item_id: u32) -> bool {
        let before = self.references.clone();
        self.references.retain(|r| r.from_item_id != item_id);
        for reference in &mut self.references {
            reference.to_item_ids.retain(|to| *to != item_id);
        }
        self.references.retain(|r| !r.to_item_ids.is_empty());
        self.references != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_of(bytes: &[u8]) -> BoxRecord<'_> {
        BoxDecoder::decode(bytes).next().unwrap().unwrap()
    }

    #[test]
    fn test_width_rules() {
        let v0 = FieldCtx::versioned(0, 0);
        let v2 = FieldCtx::versioned(2, 1);
        assert_eq!(ILOC_ITEM[0].width.resolve(&v0), 2);
        assert_eq!(ILOC_ITEM[0].width.resolve(&v2), 4);
        assert_eq!(ILOC_ITEM[1].width.resolve(&v0), 0);
        assert_eq!(ILOC_ITEM[1].width.resolve(&v2), 2);
        assert_eq!(IPMA_ASSOCIATION[0].width.resolve(&v0), 1);
        assert_eq!(IPMA_ASSOCIATION[0].width.resolve(&v2), 2);
    }

    #[test]
    fn test_iloc_v1_with_index_and_base() {
        // version 1, offset 4, length 4, base 4, index 4
        let mut body = vec![0x44, 0x44];
        body.extend_from_slice(&1u16.to_be_bytes()); // item_count
        body.extend_from_slice(&7u16.to_be_bytes()); // item_ID
        body.extend_from_slice(&0u16.to_be_bytes()); // construction_method
        body.extend_from_slice(&0u16.to_be_bytes()); // data_reference_index
        body.extend_from_slice(&1000u32.to_be_bytes()); // base_offset
        body.extend_from_slice(&1u16.to_be_bytes()); // extent_count
        body.extend_from_slice(&3u32.to_be_bytes()); // extent_index
        body.extend_from_slice(&20u32.to_be_bytes()); // extent_offset
        body.extend_from_slice(&50u32.to_be_bytes()); // extent_length
        let bytes = build_full_box(BoxType::Iloc, 1, 0, &body).unwrap();

        let iloc = IlocBox::read(&record_of(&bytes)).unwrap();
        assert_eq!(iloc.index_size, 4);
        let item = iloc.item(7).unwrap();
        assert!(item.in_file());
        assert_eq!(item.base_offset, 1000);
        assert_eq!(
            item.extents,
            vec![IlocExtent {
                index: 3,
                offset: 20,
                length: 50
            }]
        );
        assert_eq!(iloc.encode().unwrap(), bytes);
    }

    #[test]
    fn test_iloc_rejects_bad_version_and_nibbles() {
        let bytes = build_full_box(BoxType::Iloc, 3, 0, &[0x44, 0x00, 0, 0]).unwrap();
        assert!(matches!(
            IlocBox::read(&record_of(&bytes)),
            Err(Error::Malformed { .. })
        ));
        let bytes = build_full_box(BoxType::Iloc, 0, 0, &[0x34, 0x00, 0, 0]).unwrap();
        assert!(IlocBox::read(&record_of(&bytes)).is_err());
    }

    #[test]
    fn test_iloc_fit_widths() {
        let mut iloc = IlocBox::empty();
        iloc.offset_size = 0;
        iloc.items.push(IlocItem {
            item_id: 70_000,
            construction_method: 0,
            data_reference_index: 0,
            base_offset: 0,
            extents: vec![IlocExtent {
                index: 0,
                offset: 5_000_000_000,
                length: 10,
            }],
        });
        iloc.fit_widths();
        assert_eq!(iloc.version, 2);
        assert_eq!(iloc.offset_size, 8);
        assert_eq!(iloc.length_size, 4);
        let encoded = iloc.encode().unwrap();
        assert_eq!(IlocBox::read(&record_of(&encoded)).unwrap(), iloc);
    }

    #[test]
    fn test_infe_versions() {
        let built = build_infe(9, *b"Exif", "").unwrap();
        let entry = InfeEntry::read(&record_of(&built)).unwrap();
        assert_eq!(entry.version, 2);
        assert_eq!(entry.item_id, 9);
        assert_eq!(entry.item_type, Some(*b"Exif"));

        let wide = build_infe(0x1_0000, *b"av01", "").unwrap();
        let entry = InfeEntry::read(&record_of(&wide)).unwrap();
        assert_eq!(entry.version, 3);
        assert_eq!(entry.item_id, 0x1_0000);

        let bad = build_full_box(BoxType::Infe, 4, 0, &[0; 8]).unwrap();
        assert!(InfeEntry::read(&record_of(&bad)).is_err());
    }

    #[test]
    fn test_ipma_shift_and_remove() {
        let mut ipma = IpmaBox {
            version: 0,
            flags: 0,
            entries: vec![IpmaEntry {
                item_id: 1,
                associations: vec![
                    Association {
                        essential: true,
                        property_index: 1,
                    },
                    Association {
                        essential: false,
                        property_index: 2,
                    },
                ],
            }],
        };
        let encoded = ipma.encode().unwrap();
        assert_eq!(IpmaBox::read(&record_of(&encoded)).unwrap(), ipma);

        ipma.shift_for_insert(2);
        ipma.associate(1, 2, false);
        let indices: Vec<u16> = ipma.entries[0]
            .associations
            .iter()
            .map(|a| a.property_index)
            .collect();
        assert_eq!(indices, vec![1, 2, 3]);

        ipma.remove_property(2);
        let indices: Vec<u16> = ipma.entries[0]
            .associations
            .iter()
            .map(|a| a.property_index)
            .collect();
        assert_eq!(indices, vec![1, 2]);
    }

    #[test]
    fn test_ipma_index_overflow() {
        let mut ipma = IpmaBox {
            version: 0,
            flags: 0,
            entries: Vec::new(),
        };
        ipma.associate(1, 200, false);
        assert!(matches!(ipma.encode(), Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_iref_round_trip_and_removal() {
        let mut iref = IrefBox::empty();
        iref.add(*b"cdsc", 2, 1);
        iref.add(*b"auxl", 3, 1);
        let encoded = iref.encode().unwrap();
        let parsed = IrefBox::read(&encoded, &record_of(&encoded)).unwrap();
        assert_eq!(parsed, iref);

        assert!(iref.remove_item(2));
        assert_eq!(iref.references.len(), 1);
        assert!(!iref.remove_item(2));
        assert!(iref.remove_item(1));
        assert!(iref.references.is_empty());
    }
}
