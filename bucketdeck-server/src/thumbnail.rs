//! Image previews for the browser

use bucketdeck_core::*;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;

/// Thumbnails fit inside this box; smaller images keep their size
pub const THUMBNAIL_EDGE: u32 = 400;

const JPEG_QUALITY: u8 = 80;

/// Decode `source` and re-encode it as a JPEG fitting the thumbnail box
pub fn render_thumbnail(source: &[u8]) -> Result<Bytes> {
    let image = image::load_from_memory(source)
        .map_err(|e| DeckError::InvalidInput(format!("object is not a readable image: {}", e)))?;

    let image = if image.width() > THUMBNAIL_EDGE || image.height() > THUMBNAIL_EDGE {
        image.resize(THUMBNAIL_EDGE, THUMBNAIL_EDGE, FilterType::Triangle)
    } else {
        image
    };

    // JPEG has no alpha channel
    let rgb = image.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
        .encode_image(&rgb)
        .map_err(|e| DeckError::Internal(format!("thumbnail encoding failed: {}", e)))?;
    Ok(Bytes::from(out))
}

/// Whether an `If-None-Match` header value matches `etag`.
///
/// Weak validators compare equal to their strong form.
pub fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    let bare = |tag: &str| tag.trim().trim_start_matches("W/").trim_matches('"').to_string();
    let wanted = bare(etag);
    if_none_match
        .split(',')
        .any(|candidate| candidate.trim() == "*" || bare(candidate) == wanted)
}
