#![no_main]

use image_meta_io::{ColorProfile, ExifData, Image, MetadataHandler, Updates};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let image = match Image::from_bytes(data.to_vec()) {
        Ok(image) => image,
        Err(_) => return,
    };

    // Set then read back
    let mut edited = image.clone();
    let profile = ColorProfile::named("fuzz", b"profile bytes".to_vec());
    let exif = ExifData::new(b"MM\0*\0\0\0\x08".to_vec());
    if edited.set_color_profile(&profile).is_ok() {
        let _ = edited.color_profile();
    }
    if edited.set_exif_data(&exif).is_ok() {
        let _ = edited.exif_data();
    }

    // Removal
    let mut stripped = image.clone();
    let _ = Updates::remove_all().apply(&mut stripped);
    let _ = stripped.info();

    // A failed batch must leave the image untouched
    let mut batched = image.clone();
    if Updates::new()
        .set_exif(exif)
        .remove_color_profile()
        .apply(&mut batched)
        .is_err()
    {
        assert_eq!(batched.as_bytes(), image.as_bytes());
    }
});
