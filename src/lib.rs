//! In-place ICC profile and Exif editing for AVIF/HEIF and PNG images.
//!
//! This crate reads and rewrites the color profile and the Exif block of an
//! image held in memory, without decoding or re-encoding its pixel data.
//!
//! # Design Principles
//!
//! - **Structure-preserving**: Every byte outside the edited region stays as it was
//! - **Self-consistent**: Box sizes, chunk CRCs and item offsets are repaired on each edit
//! - **Rescan, don't cache**: Every query reads the current buffer
//! - **Media type agnostic**: One [`MetadataHandler`] API across PNG and BMFF images
//!
//! # Quick Start
//!
//! ```no_run
//! use image_meta_io::{ExifData, Image, MetadataHandler};
//!
//! # fn main() -> image_meta_io::Result<()> {
//! // Container is detected from the leading bytes
//! let mut image = Image::from_bytes(std::fs::read("photo.avif")?)?;
//!
//! let info = image.info()?;
//! println!("{} {}x{}", info.mime_type, info.width, info.height);
//!
//! if let Some(profile) = image.color_profile()? {
//!     println!("ICC: {} bytes", profile.data.len());
//! }
//!
//! image.set_exif_data(&ExifData::new(std::fs::read("camera.exif")?))?;
//! std::fs::write("photo-tagged.avif", image.into_bytes())?;
//! # Ok(())
//! # }
//! ```
//!
//! # Handler-Specific API
//!
//! ```no_run
//! use image_meta_io::{ColorProfile, HandlerOptions, MetadataHandler, PngHandler};
//!
//! # fn main() -> image_meta_io::Result<()> {
//! let options = HandlerOptions::new().icc_compression_level(9);
//! let mut png = PngHandler::with_options(std::fs::read("image.png")?, options)?;
//! png.set_color_profile(&ColorProfile::named("Display P3", std::fs::read("p3.icc")?))?;
//! # Ok(())
//! # }
//! ```

pub mod containers;
mod cursor;
mod error;
mod formats;
mod info;
mod media_type;
mod patcher;
mod schema;
mod updates;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use containers::Container;
pub use cursor::BinaryCursor;
pub use error::{Error, Result};
pub use formats::{
    detect_container, detect_from_extension, detect_from_mime, ContainerIO, HandlerOptions,
    Image, MetadataHandler, DEFAULT_PROFILE_NAME,
};
#[cfg(feature = "bmff")]
pub use formats::AvifHandler;
#[cfg(feature = "png")]
pub use formats::PngHandler;
pub use info::{ColorProfile, ColorSpace, ExifData, ImageInfo, TiffByteOrder};
pub use media_type::MediaType;
pub use updates::{MetadataUpdate, Updates};

/// Maximum size of a single profile or Exif payload (256 MB)
///
/// Applies to data read out of a file (including decompressed `iCCP`
/// profiles) and to data written into one.
pub const MAX_SEGMENT_SIZE: usize = 256 * 1024 * 1024;
