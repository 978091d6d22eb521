//! Media type definitions
//!
//! This module defines specific media types that can be stored in the supported containers.

/// Specific media type - what the content represents
///
/// While a [`Container`](crate::Container) defines how a file is structured,
/// a `MediaType` defines what the content actually is. The BMFF container can
/// hold several of them; the brand in `ftyp` tells them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    /// PNG image
    Png,
    /// AVIF image (AV1 codec)
    Avif,
    /// HEIF image
    Heif,
    /// HEIC image (HEVC/H.265 codec)
    Heic,
}

impl MediaType {
    /// Detect media type from an `ftyp` major brand
    ///
    /// Unknown brands fall back to AVIF, the primary target of the BMFF handler.
    ///
    /// # Example
    ///
    /// ```
    /// use image_meta_io::MediaType;
    ///
    /// assert_eq!(MediaType::from_brand(b"avis"), MediaType::Avif);
    /// assert_eq!(MediaType::from_brand(b"heic"), MediaType::Heic);
    /// ```
    pub fn from_brand(major_brand: &[u8]) -> MediaType {
        match major_brand {
            b"heic" | b"heix" | b"heim" | b"heis" => MediaType::Heic,
            b"avif" | b"avis" => MediaType::Avif,
            b"mif1" | b"msf1" => MediaType::Heif,
            _ => MediaType::Avif, // Default fallback
        }
    }

    /// Get the primary MIME type for this media type
    ///
    /// # Example
    ///
    /// ```
    /// use image_meta_io::MediaType;
    ///
    /// assert_eq!(MediaType::Png.to_mime(), "image/png");
    /// ```
    pub fn to_mime(&self) -> &'static str {
        match self {
            MediaType::Png => "image/png",
            MediaType::Avif => "image/avif",
            MediaType::Heif => "image/heif",
            MediaType::Heic => "image/heic",
        }
    }

    /// Get the primary file extension for this media type (without dot)
    pub fn to_extension(&self) -> &'static str {
        match self {
            MediaType::Png => "png",
            MediaType::Avif => "avif",
            MediaType::Heif => "heif",
            MediaType::Heic => "heic",
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_mime())
    }
}
