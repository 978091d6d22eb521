//! Format handlers
//!
//! Each container format has a handler that owns the image bytes and knows how
//! to find, replace and remove the color profile and Exif block inside them.
//! Queries rescan the current buffer on every call; mutations edit it in place.

use crate::{
    containers::Container,
    error::Result,
    info::{ColorProfile, ExifData, ImageInfo},
    MediaType,
};

/// Default keyword written into a PNG `iCCP` chunk when a profile has no name
pub const DEFAULT_PROFILE_NAME: &str = "ICC Profile";

/// Tunables shared by all handlers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOptions {
    /// zlib level (0-9) used to compress PNG `iCCP` profiles
    pub icc_compression_level: u32,
    /// Keyword used when a PNG profile is written without a name
    pub default_profile_name: String,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            icc_compression_level: 6,
            default_profile_name: DEFAULT_PROFILE_NAME.to_string(),
        }
    }
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the zlib level; values above 9 are clamped
    pub fn icc_compression_level(mut self, level: u32) -> Self {
        self.icc_compression_level = level.min(9);
        self
    }

    pub fn default_profile_name(mut self, name: impl Into<String>) -> Self {
        self.default_profile_name = name.into();
        self
    }
}

/// Static description of a container implementation
pub trait ContainerIO {
    /// Container this implementation manages
    fn container_type() -> Container;

    /// Media types this implementation can read/write
    fn supported_media_types() -> &'static [MediaType];

    /// File extensions this implementation accepts (e.g., ["png"])
    fn extensions() -> &'static [&'static str];

    /// MIME types this implementation accepts
    fn mime_types() -> &'static [&'static str];

    /// Try to detect if this implementation can handle the given header
    fn detect(header: &[u8]) -> Option<Container>;
}

/// Metadata operations over an owned image buffer
///
/// Absence is never an error for queries: `has_*` return `Ok(false)` and the
/// getters return `Ok(None)`. Mutations fail fast; a failed mutation may leave
/// the buffer partly edited, so callers should only persist after `Ok`.
/// [`Updates::apply`](crate::Updates::apply) wraps this with copy-on-write.
pub trait MetadataHandler {
    /// Media type of the current content
    fn media_type(&self) -> Result<MediaType>;

    /// Current bytes
    fn as_bytes(&self) -> &[u8];

    /// Give the (possibly edited) bytes back
    fn into_bytes(self) -> Vec<u8>
    where
        Self: Sized;

    /// Dimensions, color model and animation details
    fn info(&self) -> Result<ImageInfo>;

    /// Whether box/chunk editing is safe for this image
    ///
    /// Animated images keep frame data the edits do not track, so they report
    /// `false`, as does an image whose info cannot be read.
    fn supports_transforms(&self) -> bool {
        self.info().map(|info| !info.is_animation).unwrap_or(false)
    }

    fn supports_color_profile(&self) -> bool;

    fn supports_exif_data(&self) -> bool;

    fn has_color_profile(&self) -> Result<bool> {
        Ok(self.color_profile()?.is_some())
    }

    fn color_profile(&self) -> Result<Option<ColorProfile>>;

    /// Insert or replace the embedded ICC profile
    fn set_color_profile(&mut self, profile: &ColorProfile) -> Result<()>;

    /// Remove the embedded ICC profile; a no-op when there is none
    fn remove_color_profile(&mut self) -> Result<()>;

    fn has_exif_data(&self) -> Result<bool> {
        Ok(self.exif_data()?.is_some())
    }

    fn exif_data(&self) -> Result<Option<ExifData>>;

    /// Insert or replace the Exif block
    fn set_exif_data(&mut self, exif: &ExifData) -> Result<()>;

    /// Remove the Exif block; a no-op when there is none
    fn remove_exif_data(&mut self) -> Result<()>;
}

#[cfg(feature = "png")]
pub(crate) mod png_io;

#[cfg(feature = "bmff")]
pub(crate) mod avif_io;

#[cfg(feature = "png")]
pub use png_io::PngHandler;

#[cfg(feature = "bmff")]
pub use avif_io::AvifHandler;

// ============================================================================
// Container Registration Macro
// ============================================================================

/// Register all supported containers in one place
///
/// This macro generates:
/// - the `Image` enum wrapping one handler per container
/// - `MetadataHandler` for `Image`, delegating to the wrapped handler
/// - `detect_container()`, `detect_from_extension()`, `detect_from_mime()`
/// - `Container` methods for MIME types and extensions
macro_rules! register_containers {
    ($(
        $(#[$meta:meta])*
        $variant:ident => $module:ident :: $io:ident
    ),* $(,)?) => {
        /// An image of any registered container, chosen by content sniffing
        #[derive(Debug, Clone)]
        pub enum Image {
            $(
                $(#[$meta])*
                $variant($module::$io),
            )*
        }

        impl Image {
            /// Detect the container and wrap the matching handler
            pub fn from_bytes(buf: Vec<u8>) -> $crate::Result<Image> {
                Self::with_options(buf, HandlerOptions::default())
            }

            pub fn with_options(buf: Vec<u8>, options: HandlerOptions) -> $crate::Result<Image> {
                match detect_container(&buf)? {
                    $(
                        $(#[$meta])*
                        Container::$variant => Ok(Image::$variant($module::$io::with_options(buf, options)?)),
                    )*
                }
            }

            #[allow(unreachable_patterns)]
            pub fn container(&self) -> Container {
                match self {
                    $(
                        $(#[$meta])*
                        Image::$variant(_) => Container::$variant,
                    )*
                }
            }
        }

        impl MetadataHandler for Image {
            #[allow(unreachable_patterns)]
            fn media_type(&self) -> $crate::Result<MediaType> {
                match self {
                    $( $(#[$meta])* Image::$variant(h) => h.media_type(), )*
                }
            }

            #[allow(unreachable_patterns)]
            fn as_bytes(&self) -> &[u8] {
                match self {
                    $( $(#[$meta])* Image::$variant(h) => h.as_bytes(), )*
                }
            }

            #[allow(unreachable_patterns)]
            fn into_bytes(self) -> Vec<u8> {
                match self {
                    $( $(#[$meta])* Image::$variant(h) => h.into_bytes(), )*
                }
            }

            #[allow(unreachable_patterns)]
            fn info(&self) -> $crate::Result<ImageInfo> {
                match self {
                    $( $(#[$meta])* Image::$variant(h) => h.info(), )*
                }
            }

            #[allow(unreachable_patterns)]
            fn supports_transforms(&self) -> bool {
                match self {
                    $( $(#[$meta])* Image::$variant(h) => h.supports_transforms(), )*
                }
            }

            #[allow(unreachable_patterns)]
            fn supports_color_profile(&self) -> bool {
                match self {
                    $( $(#[$meta])* Image::$variant(h) => h.supports_color_profile(), )*
                }
            }

            #[allow(unreachable_patterns)]
            fn supports_exif_data(&self) -> bool {
                match self {
                    $( $(#[$meta])* Image::$variant(h) => h.supports_exif_data(), )*
                }
            }

            #[allow(unreachable_patterns)]
            fn has_color_profile(&self) -> $crate::Result<bool> {
                match self {
                    $( $(#[$meta])* Image::$variant(h) => h.has_color_profile(), )*
                }
            }

            #[allow(unreachable_patterns)]
            fn color_profile(&self) -> $crate::Result<Option<ColorProfile>> {
                match self {
                    $( $(#[$meta])* Image::$variant(h) => h.color_profile(), )*
                }
            }

            #[allow(unreachable_patterns)]
            fn set_color_profile(&mut self, profile: &ColorProfile) -> $crate::Result<()> {
                match self {
                    $( $(#[$meta])* Image::$variant(h) => h.set_color_profile(profile), )*
                }
            }

            #[allow(unreachable_patterns)]
            fn remove_color_profile(&mut self) -> $crate::Result<()> {
                match self {
                    $( $(#[$meta])* Image::$variant(h) => h.remove_color_profile(), )*
                }
            }

            #[allow(unreachable_patterns)]
            fn has_exif_data(&self) -> $crate::Result<bool> {
                match self {
                    $( $(#[$meta])* Image::$variant(h) => h.has_exif_data(), )*
                }
            }

            #[allow(unreachable_patterns)]
            fn exif_data(&self) -> $crate::Result<Option<ExifData>> {
                match self {
                    $( $(#[$meta])* Image::$variant(h) => h.exif_data(), )*
                }
            }

            #[allow(unreachable_patterns)]
            fn set_exif_data(&mut self, exif: &ExifData) -> $crate::Result<()> {
                match self {
                    $( $(#[$meta])* Image::$variant(h) => h.set_exif_data(exif), )*
                }
            }

            #[allow(unreachable_patterns)]
            fn remove_exif_data(&mut self) -> $crate::Result<()> {
                match self {
                    $( $(#[$meta])* Image::$variant(h) => h.remove_exif_data(), )*
                }
            }
        }

        /// Detect the container from the first bytes of a buffer
        pub fn detect_container(header: &[u8]) -> $crate::Result<Container> {
            if header.len() < 8 {
                return Err($crate::Error::InvalidFormat("File too small".into()));
            }

            $(
                $(#[$meta])*
                if let Some(container) = <$module::$io as ContainerIO>::detect(header) {
                    return Ok(container);
                }
            )*

            Err($crate::Error::UnsupportedFormat)
        }

        /// Detect container from file extension
        pub fn detect_from_extension(ext: &str) -> Option<Container> {
            let ext_lower = ext.to_lowercase();
            $(
                $(#[$meta])*
                if <$module::$io as ContainerIO>::extensions().contains(&ext_lower.as_str()) {
                    return Some(<$module::$io as ContainerIO>::container_type());
                }
            )*
            None
        }

        /// Detect container from MIME type
        pub fn detect_from_mime(mime: &str) -> Option<Container> {
            $(
                $(#[$meta])*
                if <$module::$io as ContainerIO>::mime_types().iter().any(|m| m.eq_ignore_ascii_case(mime)) {
                    return Some(<$module::$io as ContainerIO>::container_type());
                }
            )*
            None
        }

        impl Container {
            /// Primary MIME type for this container
            pub fn to_mime(&self) -> &'static str {
                self.mime_types()[0]
            }

            /// Primary file extension for this container (without dot prefix)
            pub fn to_extension(&self) -> &'static str {
                self.extensions()[0]
            }

            /// Media types that can be stored in this container
            pub fn supported_media_types(&self) -> &'static [MediaType] {
                match self {
                    $(
                        $(#[$meta])*
                        Container::$variant => <$module::$io as ContainerIO>::supported_media_types(),
                    )*
                }
            }

            pub fn mime_types(&self) -> &'static [&'static str] {
                match self {
                    $(
                        $(#[$meta])*
                        Container::$variant => <$module::$io as ContainerIO>::mime_types(),
                    )*
                }
            }

            pub fn extensions(&self) -> &'static [&'static str] {
                match self {
                    $(
                        $(#[$meta])*
                        Container::$variant => <$module::$io as ContainerIO>::extensions(),
                    )*
                }
            }
        }
    };
}

register_containers! {
    #[cfg(feature = "png")]
    Png => png_io::PngHandler,

    #[cfg(feature = "bmff")]
    Bmff => avif_io::AvifHandler,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(feature = "bmff")]
    fn test_bmff_detect() {
        // Minimal BMFF ftyp box
        let data = vec![
            0x00, 0x00, 0x00, 0x14, // size = 20
            b'f', b't', b'y', b'p', // type = ftyp
            b'a', b'v', b'i', b'f', // major brand = avif
            0x00, 0x00, 0x00, 0x00, // minor version
            b'm', b'i', b'f', b'1', // compatible brand
        ];

        assert_eq!(detect_container(&data).unwrap(), Container::Bmff);
        assert_eq!(Container::Bmff.to_mime(), "image/avif");
    }

    #[test]
    #[cfg(feature = "png")]
    fn test_png_detect() {
        assert_eq!(
            detect_container(b"\x89PNG\r\n\x1a\n\0\0\0\0").unwrap(),
            Container::Png
        );
        assert_eq!(detect_from_extension("PNG"), Some(Container::Png));
        assert_eq!(detect_from_mime("image/png"), Some(Container::Png));
    }

    #[test]
    fn test_unknown_header() {
        assert!(matches!(
            detect_container(&[0xFF, 0xD8, 0xFF, 0xE0, 0, 0, 0, 0]),
            Err(crate::Error::UnsupportedFormat)
        ));
        assert!(matches!(
            detect_container(&[0x89]),
            Err(crate::Error::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_options_builder() {
        let options = HandlerOptions::new()
            .icc_compression_level(12)
            .default_profile_name("sRGB");
        assert_eq!(options.icc_compression_level, 9);
        assert_eq!(options.default_profile_name, "sRGB");
        assert_eq!(HandlerOptions::default().icc_compression_level, 6);
    }
}
