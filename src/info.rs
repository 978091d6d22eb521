//! Values produced and consumed by the metadata handlers

/// Color model of the stored pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorSpace {
    Grayscale,
    Rgb,
    Palette,
}

/// Immutable snapshot of image properties, built by one forward scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub mime_type: &'static str,
    pub width: u32,
    pub height: u32,
    pub color_space: ColorSpace,
    /// Bits per channel
    pub color_depth: u8,
    /// Palette entries (PNG `PLTE` only)
    pub color_number: Option<u32>,
    pub has_alpha_channel: bool,
    pub is_animation: bool,
    pub animation_frames: Option<u32>,
    /// Number of plays; 0 means loop forever (APNG `acTL`)
    pub animation_repeat_count: Option<u32>,
}

/// An embedded ICC color profile
///
/// PNG stores a profile name next to the data; AVIF does not, so profiles read
/// from AVIF carry `name: None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorProfile {
    pub name: Option<String>,
    pub data: Vec<u8>,
}

impl ColorProfile {
    /// Unnamed profile
    pub fn new(data: Vec<u8>) -> Self {
        Self { name: None, data }
    }

    /// Profile with a name (used as the PNG `iCCP` keyword)
    pub fn named(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: Some(name.into()),
            data,
        }
    }
}

/// Byte order declared by a TIFF header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TiffByteOrder {
    /// "II"
    LittleEndian,
    /// "MM"
    BigEndian,
}

/// Raw TIFF-structured Exif block
///
/// Content is stored verbatim; only placement inside the container is managed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExifData(Vec<u8>);

impl ExifData {
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Byte order from the TIFF header, if the block starts with one
    pub fn byte_order(&self) -> Option<TiffByteOrder> {
        match self.0.get(0..4)? {
            [b'I', b'I', 0x2A, 0x00] => Some(TiffByteOrder::LittleEndian),
            [b'M', b'M', 0x00, 0x2A] => Some(TiffByteOrder::BigEndian),
            _ => None,
        }
    }
}

impl From<Vec<u8>> for ExifData {
    fn from(data: Vec<u8>) -> Self {
        Self(data)
    }
}

impl From<&[u8]> for ExifData {
    fn from(data: &[u8]) -> Self {
        Self(data.to_vec())
    }
}

impl AsRef<[u8]> for ExifData {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
