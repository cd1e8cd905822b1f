use actix_web::web;
use lazy_static::lazy_static;
use std::borrow::Cow;

const JPEG_MAGIC: [u8; 3] = [0xFF, 0xD8, 0xFF];
const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
#[cfg_attr(not(feature = "transcode"), allow(dead_code))]
const JPEG_QUALITY: u8 = 90;

lazy_static! {
    // Probed on first use; every caller observes the same handle.
    static ref TRANSCODER: Option<JpegTranscoder> = JpegTranscoder::probe();
}

/// Re-encodes decodable images as JPEG. Only available when the crate is
/// built with the `transcode` feature.
pub struct JpegTranscoder {
    quality: u8,
}

impl JpegTranscoder {
    #[cfg(feature = "transcode")]
    fn probe() -> Option<Self> {
        log::info!("JPEG transcoding available (quality {})", JPEG_QUALITY);
        Some(Self {
            quality: JPEG_QUALITY,
        })
    }

    #[cfg(not(feature = "transcode"))]
    fn probe() -> Option<Self> {
        log::info!("JPEG transcoding unavailable; non-JPEG images are sent as-is");
        None
    }

    #[cfg(feature = "transcode")]
    pub fn transcode(&self, image: &[u8]) -> Result<Vec<u8>, String> {
        use image::codecs::jpeg::JpegEncoder;

        let decoded = image::load_from_memory(image).map_err(|e| e.to_string())?;
        let rgb = decoded.to_rgb8();
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, self.quality)
            .encode_image(&rgb)
            .map_err(|e| e.to_string())?;
        Ok(out)
    }

    #[cfg(not(feature = "transcode"))]
    pub fn transcode(&self, _image: &[u8]) -> Result<Vec<u8>, String> {
        Err(format!("transcoding at quality {} not compiled in", self.quality))
    }
}

pub fn transcoder() -> Option<&'static JpegTranscoder> {
    TRANSCODER.as_ref()
}

pub fn is_jpeg(image: &[u8]) -> bool {
    image.starts_with(&JPEG_MAGIC)
}

/// Cheap magic-byte sniff. Unknown content reports as octet-stream.
pub fn sniff_mime(image: &[u8]) -> &'static str {
    if is_jpeg(image) {
        "image/jpeg"
    } else if image.starts_with(&PNG_MAGIC) {
        "image/png"
    } else if image.len() >= 12 && &image[0..4] == b"RIFF" && &image[8..12] == b"WEBP" {
        "image/webp"
    } else if image.starts_with(b"GIF87a") || image.starts_with(b"GIF89a") {
        "image/gif"
    } else {
        "application/octet-stream"
    }
}

/// Returns a buffer the remote service accepts. JPEG input is passed through
/// untouched; anything else is transcoded on the blocking pool when possible
/// and otherwise passed through as well. Never fails.
pub async fn ensure_jpeg(image: &[u8]) -> Cow<'_, [u8]> {
    if is_jpeg(image) {
        return Cow::Borrowed(image);
    }

    let Some(transcoder) = transcoder() else {
        return Cow::Borrowed(image);
    };

    let owned = image.to_vec();
    match web::block(move || transcoder.transcode(&owned)).await {
        Ok(Ok(jpeg)) => Cow::Owned(jpeg),
        Ok(Err(e)) => {
            log::debug!("JPEG transcoding failed, sending original bytes: {}", e);
            Cow::Borrowed(image)
        }
        Err(e) => {
            log::warn!("JPEG transcoding task failed, sending original bytes: {}", e);
            Cow::Borrowed(image)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn jpeg_passes_through_untouched() {
        let jpeg = [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F'];
        let out = ensure_jpeg(&jpeg).await;
        assert!(matches!(out, Cow::Borrowed(_)));
        assert_eq!(out.as_ref(), &jpeg);
    }

    #[tokio::test]
    async fn undecodable_bytes_degrade_to_passthrough() {
        let junk = b"definitely not an image";
        let out = ensure_jpeg(junk).await;
        assert_eq!(out.as_ref(), junk);
    }

    #[test]
    fn sniffs_common_formats() {
        assert_eq!(sniff_mime(&[0xFF, 0xD8, 0xFF, 0xDB]), "image/jpeg");
        assert_eq!(sniff_mime(&PNG_MAGIC), "image/png");
        assert_eq!(sniff_mime(b"RIFF\x00\x00\x00\x00WEBPVP8 "), "image/webp");
        assert_eq!(sniff_mime(b"GIF89a...."), "image/gif");
        assert_eq!(sniff_mime(b"hello"), "application/octet-stream");
    }

    #[test]
    fn probe_is_memoized() {
        let first = transcoder().map(|t| t as *const JpegTranscoder);
        let second = transcoder().map(|t| t as *const JpegTranscoder);
        assert_eq!(first, second);
    }

    #[cfg(feature = "transcode")]
    #[tokio::test]
    async fn png_is_transcoded_to_jpeg() {
        use image::{ImageFormat, Rgba, RgbaImage};
        use std::io::Cursor;

        let img = RgbaImage::from_pixel(4, 4, Rgba([200, 40, 40, 255]));
        let mut png = Cursor::new(Vec::new());
        img.write_to(&mut png, ImageFormat::Png).unwrap();
        let png = png.into_inner();

        let out = ensure_jpeg(&png).await;
        assert!(matches!(out, Cow::Owned(_)));
        assert!(is_jpeg(&out));
    }
}
