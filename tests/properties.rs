use image_meta_io::{
    test_utils::{bmff_box, check_bmff_sizes, AvifBuilder, PngBuilder},
    AvifHandler, ColorProfile, ExifData, Image, MetadataHandler, PngHandler,
};
use proptest::prelude::*;

fn payload(max: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..max)
}

fn avif_fixture() -> impl Strategy<Value = Vec<u8>> {
    (
        1u32..=4096,
        1u32..=4096,
        prop::option::of(payload(256)),
        prop::option::of(payload(256)),
        any::<bool>(),
    )
        .prop_map(|(w, h, icc, exif, base_offsets)| {
            let mut builder = AvifBuilder::new(w, h).pixi(&[8, 8, 8]);
            if let Some(icc) = icc {
                builder = builder.icc(icc);
            }
            if let Some(exif) = exif {
                builder = builder.exif(exif);
            }
            if base_offsets {
                builder = builder.base_offsets();
            }
            builder.build()
        })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_avif_edits_read_back_and_keep_sizes(
        avif in avif_fixture(),
        icc in prop::collection::vec(any::<u8>(), 1..1024),
        exif in payload(1024),
        profile_first in any::<bool>(),
    ) {
        let mut handler = AvifHandler::new(avif).unwrap();
        let info_before = handler.info().unwrap();
        let profile = ColorProfile::new(icc);
        let exif = ExifData::new(exif);

        if profile_first {
            handler.set_color_profile(&profile).unwrap();
            handler.set_exif_data(&exif).unwrap();
        } else {
            handler.set_exif_data(&exif).unwrap();
            handler.set_color_profile(&profile).unwrap();
        }

        prop_assert_eq!(handler.color_profile().unwrap(), Some(profile));
        prop_assert_eq!(handler.exif_data().unwrap(), Some(exif));
        prop_assert_eq!(handler.info().unwrap(), info_before);
        prop_assert!(check_bmff_sizes(handler.as_bytes()).is_ok());
    }

    #[test]
    fn prop_avif_removal_is_idempotent(avif in avif_fixture()) {
        let mut handler = AvifHandler::new(avif).unwrap();
        handler.remove_exif_data().unwrap();
        handler.remove_color_profile().unwrap();
        let once = handler.as_bytes().to_vec();

        handler.remove_exif_data().unwrap();
        handler.remove_color_profile().unwrap();
        prop_assert_eq!(handler.as_bytes(), &once[..]);
        prop_assert!(!handler.has_exif_data().unwrap());
        prop_assert!(!handler.has_color_profile().unwrap());
        prop_assert!(check_bmff_sizes(handler.as_bytes()).is_ok());
    }

    #[test]
    fn prop_png_profile_symmetry(
        name in "[A-Za-z0-9 ]{1,79}",
        data in payload(2048),
        level in 0u32..=9,
    ) {
        let options = image_meta_io::HandlerOptions::new().icc_compression_level(level);
        let mut handler = PngHandler::with_options(PngBuilder::new(4, 4).build(), options).unwrap();
        let profile = ColorProfile::named(name, data);
        handler.set_color_profile(&profile).unwrap();
        prop_assert_eq!(handler.color_profile().unwrap(), Some(profile));
    }

    #[test]
    fn prop_png_exif_set_remove_restores_bytes(exif in payload(1024)) {
        let original = PngBuilder::new(4, 4).color_type(6).build();
        let mut handler = PngHandler::new(original.clone()).unwrap();
        handler.set_exif_data(&ExifData::new(exif.clone())).unwrap();
        prop_assert_eq!(handler.exif_data().unwrap(), Some(ExifData::new(exif)));
        handler.remove_exif_data().unwrap();
        prop_assert_eq!(handler.as_bytes(), &original[..]);
    }

    #[test]
    fn prop_queries_never_panic_on_garbage(tail in payload(512), png in any::<bool>()) {
        let data = if png {
            let mut data = b"\x89PNG\r\n\x1a\n".to_vec();
            data.extend(tail);
            data
        } else {
            let mut data = bmff_box(*b"ftyp", b"avif\0\0\0\0mif1");
            data.extend(tail);
            data
        };
        let image = Image::from_bytes(data).unwrap();
        let first = (
            image.info().ok(),
            image.has_color_profile().ok(),
            image.color_profile().ok(),
            image.has_exif_data().ok(),
            image.exif_data().ok(),
        );
        let second = (
            image.info().ok(),
            image.has_color_profile().ok(),
            image.color_profile().ok(),
            image.has_exif_data().ok(),
            image.exif_data().ok(),
        );
        prop_assert_eq!(first, second);
    }
}
