//! Image signature sniffing.

use image::ImageFormat;

/// Returns the format whose magic number prefixes `bytes`.
///
/// Recognized: JPEG `FF D8 FF`, PNG `89 50 4E 47`, GIF `47 49 46 38`,
/// WebP `RIFF....WEBP`, BMP `42 4D`. Anything else, including an empty
/// buffer, is `None`.
pub fn sniff_format(bytes: &[u8]) -> Option<ImageFormat> {
    match bytes {
        [0xFF, 0xD8, 0xFF, ..] => Some(ImageFormat::Jpeg),
        [0x89, 0x50, 0x4E, 0x47, ..] => Some(ImageFormat::Png),
        [0x47, 0x49, 0x46, 0x38, ..] => Some(ImageFormat::Gif),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some(ImageFormat::WebP),
        [0x42, 0x4D, ..] => Some(ImageFormat::Bmp),
        _ => None,
    }
}
