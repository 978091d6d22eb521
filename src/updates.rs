//! Batched metadata edits

use crate::{
    error::Result,
    formats::MetadataHandler,
    info::{ColorProfile, ExifData},
};

/// Metadata update strategy
///
/// Specifies how to handle one kind of metadata when applying [`Updates`].
/// By default, the metadata is kept unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MetadataUpdate<T> {
    /// Keep existing metadata (default)
    #[default]
    Keep,
    /// Remove existing metadata
    Remove,
    /// Replace or add metadata
    Set(T),
}

impl<T> MetadataUpdate<T> {
    pub fn is_keep(&self) -> bool {
        matches!(self, MetadataUpdate::Keep)
    }
}

/// Edits to apply to an image in one step
///
/// This struct uses a builder pattern where the default is to keep all existing
/// metadata unchanged. Use the builder methods to explicitly specify changes.
///
/// # Example
///
/// ```no_run
/// use image_meta_io::{ColorProfile, Image, Updates};
///
/// # fn main() -> image_meta_io::Result<()> {
/// let mut image = Image::from_bytes(std::fs::read("photo.avif")?)?;
///
/// // Swap the profile, strip Exif
/// Updates::new()
///     .set_color_profile(ColorProfile::new(std::fs::read("display-p3.icc")?))
///     .remove_exif()
///     .apply(&mut image)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Updates {
    pub(crate) color_profile: MetadataUpdate<ColorProfile>,
    pub(crate) exif: MetadataUpdate<ExifData>,
}

impl Updates {
    /// Create a new `Updates` builder with all metadata set to keep (no changes)
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_color_profile(mut self, profile: ColorProfile) -> Self {
        self.color_profile = MetadataUpdate::Set(profile);
        self
    }

    pub fn remove_color_profile(mut self) -> Self {
        self.color_profile = MetadataUpdate::Remove;
        self
    }

    /// Keep the existing profile (explicit, same as default)
    pub fn keep_color_profile(mut self) -> Self {
        self.color_profile = MetadataUpdate::Keep;
        self
    }

    pub fn set_exif(mut self, exif: ExifData) -> Self {
        self.exif = MetadataUpdate::Set(exif);
        self
    }

    pub fn remove_exif(mut self) -> Self {
        self.exif = MetadataUpdate::Remove;
        self
    }

    /// Keep the existing Exif block (explicit, same as default)
    pub fn keep_exif(mut self) -> Self {
        self.exif = MetadataUpdate::Keep;
        self
    }

    /// Alias for `Updates::new()`
    pub fn keep_all() -> Self {
        Self::default()
    }

    /// Strip both the profile and the Exif block
    pub fn remove_all() -> Self {
        Self::new().remove_color_profile().remove_exif()
    }

    pub fn color_profile(&self) -> &MetadataUpdate<ColorProfile> {
        &self.color_profile
    }

    pub fn exif(&self) -> &MetadataUpdate<ExifData> {
        &self.exif
    }

    /// True when applying would change nothing
    pub fn is_empty(&self) -> bool {
        self.color_profile.is_keep() && self.exif.is_keep()
    }

    /// Apply every edit, or none of them
    ///
    /// The edits run against a copy of the handler; `handler` is replaced only
    /// when all of them succeed, so a failure leaves it exactly as it was.
    pub fn apply<H>(&self, handler: &mut H) -> Result<()>
    where
        H: MetadataHandler + Clone,
    {
        if self.is_empty() {
            return Ok(());
        }
        let mut staged = handler.clone();
        self.apply_in_place(&mut staged)?;
        *handler = staged;
        Ok(())
    }

    fn apply_in_place<H: MetadataHandler>(&self, handler: &mut H) -> Result<()> {
        match &self.color_profile {
            MetadataUpdate::Keep => {}
            MetadataUpdate::Remove => handler.remove_color_profile()?,
            MetadataUpdate::Set(profile) => handler.set_color_profile(profile)?,
        }
        match &self.exif {
            MetadataUpdate::Keep => {}
            MetadataUpdate::Remove => handler.remove_exif_data()?,
            MetadataUpdate::Set(exif) => handler.set_exif_data(exif)?,
        }
        log::debug!(
            "applied updates: color_profile={}, exif={}",
            describe(&self.color_profile),
            describe(&self.exif)
        );
        Ok(())
    }
}

fn describe<T>(update: &MetadataUpdate<T>) -> &'static str {
    match update {
        MetadataUpdate::Keep => "keep",
        MetadataUpdate::Remove => "remove",
        MetadataUpdate::Set(_) => "set",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        formats::{AvifHandler, PngHandler},
        test_utils::{AvifBuilder, PngBuilder},
        Error,
    };

    #[test]
    fn test_default_keeps_everything() {
        let updates = Updates::new();
        assert!(updates.is_empty());
        assert_eq!(updates, Updates::keep_all());
        assert!(!Updates::remove_all().is_empty());
    }

    #[test]
    fn test_apply_sets_both() {
        let mut handler = PngHandler::new(PngBuilder::new(2, 2).build()).unwrap();
        Updates::new()
            .set_color_profile(ColorProfile::named("sRGB", vec![7; 40]))
            .set_exif(ExifData::from(&b"MM\0*\0\0\0\x08"[..]))
            .apply(&mut handler)
            .unwrap();
        assert_eq!(handler.color_profile().unwrap().unwrap().data, vec![7; 40]);
        assert_eq!(
            handler.exif_data().unwrap().unwrap().as_bytes(),
            b"MM\0*\0\0\0\x08"
        );
    }

    #[test]
    fn test_failed_apply_leaves_handler_untouched() {
        let mut handler = AvifHandler::new(AvifBuilder::new(2, 2).animated(3).build()).unwrap();
        let before = handler.as_bytes().to_vec();
        let result = Updates::remove_all().apply(&mut handler);
        assert!(matches!(result, Err(Error::Unsupported(_))));
        assert_eq!(handler.as_bytes(), &before[..]);
    }

    #[test]
    fn test_partial_failure_rolls_back() {
        let avif = AvifBuilder::new(2, 2).icc(vec![1; 8]).build();
        let mut handler = AvifHandler::new(avif).unwrap();
        let before = handler.as_bytes().to_vec();

        // The profile edit succeeds on the copy before the Exif edit fails
        let updates = Updates::new()
            .set_color_profile(ColorProfile::new(vec![2; 8]))
            .set_exif(ExifData::new(vec![0; crate::MAX_SEGMENT_SIZE]));
        assert!(matches!(
            updates.apply(&mut handler),
            Err(Error::DataTooLarge { .. })
        ));
        assert_eq!(handler.as_bytes(), &before[..]);
    }
}
