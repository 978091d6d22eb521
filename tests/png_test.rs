//! PNG handler tests against in-memory files

use image_meta_io::{
    containers::png::{ChunkDecoder, PNG_SIGNATURE},
    test_utils::{png_chunk, PngBuilder},
    ColorProfile, ColorSpace, Container, Error, ExifData, HandlerOptions, Image, MetadataHandler,
    PngHandler, DEFAULT_PROFILE_NAME,
};

fn chunk_types(buf: &[u8]) -> Vec<[u8; 4]> {
    ChunkDecoder::decode(buf)
        .map(|chunk| chunk.unwrap().chunk_type())
        .collect()
}

/// Every chunk has a valid CRC and the chunks fill the buffer after the signature
fn assert_well_formed(buf: &[u8]) {
    let mut total = 0;
    for chunk in ChunkDecoder::decode(buf) {
        let chunk = chunk.unwrap();
        assert!(chunk.crc_matches(), "bad CRC on {:?}", chunk.chunk_type());
        total += chunk.span.total_size();
    }
    assert_eq!(total, buf.len() - PNG_SIGNATURE.len());
}

#[test]
fn test_profile_insert_into_plain_png() {
    let mut handler = PngHandler::new(PngBuilder::new(10, 10).build()).unwrap();
    assert!(!handler.has_color_profile().unwrap());

    let profile = ColorProfile::named("sRGB IEC61966-2.1", vec![0xC0; 3000]);
    handler.set_color_profile(&profile).unwrap();

    assert!(handler.has_color_profile().unwrap());
    assert_eq!(handler.color_profile().unwrap(), Some(profile));
    assert_eq!(
        chunk_types(handler.as_bytes()),
        vec![*b"IHDR", *b"iCCP", *b"IDAT", *b"IEND"]
    );
    assert_well_formed(handler.as_bytes());
}

#[test]
fn test_unnamed_profile_uses_configured_name() {
    let mut handler = PngHandler::new(PngBuilder::new(1, 1).build()).unwrap();
    handler.set_color_profile(&ColorProfile::new(vec![1, 2, 3])).unwrap();
    let read = handler.color_profile().unwrap().unwrap();
    assert_eq!(read.name.as_deref(), Some(DEFAULT_PROFILE_NAME));
    assert_eq!(read.data, vec![1, 2, 3]);

    let options = HandlerOptions::new()
        .default_profile_name("Studio")
        .icc_compression_level(0);
    let mut handler = PngHandler::with_options(PngBuilder::new(1, 1).build(), options).unwrap();
    handler.set_color_profile(&ColorProfile::new(vec![9; 100])).unwrap();
    let read = handler.color_profile().unwrap().unwrap();
    assert_eq!(read.name.as_deref(), Some("Studio"));
    assert_eq!(read.data, vec![9; 100]);
}

#[test]
fn test_profile_name_must_be_a_keyword() {
    let mut handler = PngHandler::new(PngBuilder::new(1, 1).build()).unwrap();
    let before = handler.as_bytes().to_vec();
    for name in ["", "nul\0inside", &"x".repeat(80)] {
        assert!(matches!(
            handler.set_color_profile(&ColorProfile::named(name, vec![1])),
            Err(Error::InvalidInput(_))
        ));
    }
    assert_eq!(handler.as_bytes(), &before[..]);
}

#[test]
fn test_rgba_reports_alpha() {
    let png = PngBuilder::new(3, 4).color_type(6).build();
    let info = PngHandler::new(png).unwrap().info().unwrap();
    assert_eq!(info.mime_type, "image/png");
    assert_eq!((info.width, info.height), (3, 4));
    assert_eq!(info.color_space, ColorSpace::Rgb);
    assert!(info.has_alpha_channel);
    assert!(!info.is_animation);
}

#[test]
fn test_gray_alpha_and_palette() {
    let info = PngHandler::new(PngBuilder::new(1, 1).color_type(4).bit_depth(16).build())
        .unwrap()
        .info()
        .unwrap();
    assert_eq!(info.color_space, ColorSpace::Grayscale);
    assert_eq!(info.color_depth, 16);
    assert!(info.has_alpha_channel);

    let png = PngBuilder::new(1, 1)
        .color_type(3)
        .chunk(*b"PLTE", vec![0; 3 * 16])
        .build();
    let info = PngHandler::new(png).unwrap().info().unwrap();
    assert_eq!(info.color_space, ColorSpace::Palette);
    assert_eq!(info.color_number, Some(16));
}

#[test]
fn test_exif_removal_shrinks_by_chunk_size() {
    let exif = b"MM\0*\0\0\0\x08some tags".to_vec();
    let png = PngBuilder::new(2, 2).chunk(*b"eXIf", exif.clone()).build();
    let original_len = png.len();
    let mut handler = PngHandler::new(png).unwrap();
    assert!(handler.has_exif_data().unwrap());

    handler.remove_exif_data().unwrap();
    assert_eq!(handler.as_bytes().len(), original_len - (exif.len() + 12));
    assert!(!handler.has_exif_data().unwrap());
    assert_well_formed(handler.as_bytes());

    let once = handler.as_bytes().to_vec();
    handler.remove_exif_data().unwrap();
    assert_eq!(handler.as_bytes(), &once[..]);
}

#[test]
fn test_exif_write_read_symmetry() {
    let mut handler = PngHandler::new(PngBuilder::new(2, 2).build()).unwrap();
    let exif = ExifData::new(b"II*\0\x08\0\0\0body".to_vec());
    handler.set_exif_data(&exif).unwrap();
    assert_eq!(handler.exif_data().unwrap(), Some(exif));

    let replacement = ExifData::new(b"MM\0*".to_vec());
    handler.set_exif_data(&replacement).unwrap();
    assert_eq!(handler.exif_data().unwrap(), Some(replacement));
    // Replaced in place, not duplicated
    assert_eq!(
        chunk_types(handler.as_bytes()),
        vec![*b"IHDR", *b"eXIf", *b"IDAT", *b"IEND"]
    );
    assert_well_formed(handler.as_bytes());
}

#[test]
fn test_apng_blocks_mutation() {
    let mut actl = 8u32.to_be_bytes().to_vec();
    actl.extend_from_slice(&0u32.to_be_bytes());
    let png = PngBuilder::new(2, 2).chunk(*b"acTL", actl).build();
    let mut handler = PngHandler::new(png).unwrap();

    let info = handler.info().unwrap();
    assert!(info.is_animation);
    assert_eq!(info.animation_frames, Some(8));
    assert_eq!(info.animation_repeat_count, Some(0));
    assert!(!handler.supports_transforms());
    assert!(matches!(
        handler.set_exif_data(&ExifData::new(vec![1])),
        Err(Error::Unsupported(_))
    ));
}

#[test]
fn test_bad_signature_rejected() {
    assert!(matches!(
        PngHandler::new(b"GIF89a\0\0\0\0\0\0".to_vec()),
        Err(Error::InvalidFormat(_))
    ));
}

#[test]
fn test_overlong_chunk_is_malformed() {
    let mut png = PNG_SIGNATURE.to_vec();
    let mut ihdr = png_chunk(*b"IHDR", &[0; 13]);
    // Claim far more data than follows
    ihdr[..4].copy_from_slice(&1000u32.to_be_bytes());
    png.extend(ihdr);
    let handler = PngHandler::new(png).unwrap();
    assert!(matches!(handler.info(), Err(Error::Malformed { .. })));
    assert!(matches!(
        handler.has_color_profile(),
        Err(Error::Malformed { .. })
    ));
}

#[test]
fn test_image_dispatch() {
    let mut image = Image::from_bytes(PngBuilder::new(5, 5).build()).unwrap();
    assert_eq!(image.container(), Container::Png);
    image.set_color_profile(&ColorProfile::named("P3", vec![3; 33])).unwrap();
    let bytes = image.into_bytes();
    let reopened = Image::from_bytes(bytes).unwrap();
    assert_eq!(
        reopened.color_profile().unwrap(),
        Some(ColorProfile::named("P3", vec![3; 33]))
    );
}
