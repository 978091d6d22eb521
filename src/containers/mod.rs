//! Container decoders
//!
//! Each container format has a stateless decoder that turns a byte buffer into
//! a lazy, restartable sequence of top-level records. Decoders never mutate the
//! buffer; the records they yield borrow it and cannot outlive an edit.

pub mod bmff;

#[cfg(feature = "png")]
pub mod png;

/// Container format - defines how a file is structured in memory
///
/// Multiple media types can share the same container (e.g., BMFF holds AVIF,
/// HEIF and HEIC). Detection and MIME lookups are generated alongside the
/// handlers in [`formats`](crate::formats).
///
/// Note: The actual variants are determined by enabled features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Container {
    /// PNG container (chunk-based structure)
    #[cfg(feature = "png")]
    Png,

    /// BMFF container (ISO Base Media File Format: AVIF, HEIF, HEIC)
    #[cfg(feature = "bmff")]
    Bmff,
}
