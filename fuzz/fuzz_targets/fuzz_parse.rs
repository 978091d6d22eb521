#![no_main]

use image_meta_io::{Image, MetadataHandler};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Any input, auto-detected; queries must only ever return errors
    if let Ok(image) = Image::from_bytes(data.to_vec()) {
        let _ = image.media_type();
        let _ = image.container();
        let _ = image.info();
        let _ = image.supports_transforms();

        let _ = image.has_color_profile();
        let _ = image.color_profile();

        let _ = image.has_exif_data();
        let _ = image.exif_data();
    }
});
