//! Inline image representation and content-type detection.
//!
//! Only raster formats with a well-known signature are accepted:
//! PNG, JPEG, GIF, WEBP, BMP and TIFF.
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::ImageFormat;

pub const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

const DATA_URL_IMAGE_PREFIX: &str = "data:image/";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImageRejection {
    #[error("image payload is empty")]
    Empty,
    #[error("image payload too large ({size} bytes, limit {limit})")]
    TooLarge { size: usize, limit: usize },
    #[error("content type '{0}' is not an image")]
    NotImage(String),
}

/// Image bytes whose size and `image/*` content type have both been checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    bytes: Vec<u8>,
    content_type: String,
}

impl ResolvedImage {
    pub fn new(bytes: Vec<u8>, content_type: &str, max_bytes: usize) -> Result<Self, ImageRejection> {
        if bytes.is_empty() {
            return Err(ImageRejection::Empty);
        }
        if bytes.len() > max_bytes {
            return Err(ImageRejection::TooLarge {
                size: bytes.len(),
                limit: max_bytes,
            });
        }
        let content_type = normalize_content_type(content_type);
        if !content_type.starts_with("image/") || content_type.len() <= "image/".len() {
            return Err(ImageRejection::NotImage(content_type));
        }
        Ok(Self {
            bytes,
            content_type,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn to_data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.content_type,
            BASE64.encode(&self.bytes)
        )
    }
}

/// A parsed `data:image/<subtype>;base64,<payload>` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage<'a> {
    pub content_type: String,
    pub payload: &'a str,
}

impl InlineImage<'_> {
    /// Exact decoded size for well-formed base64.
    pub fn decoded_len(&self) -> usize {
        self.payload.trim_end_matches('=').len() * 3 / 4
    }

    pub fn decode(&self) -> Option<Vec<u8>> {
        BASE64.decode(self.payload).ok()
    }
}

pub fn is_inline_image(value: &str) -> bool {
    value
        .trim_start()
        .get(..DATA_URL_IMAGE_PREFIX.len())
        .map(|prefix| prefix.eq_ignore_ascii_case(DATA_URL_IMAGE_PREFIX))
        .unwrap_or(false)
}

pub fn parse_data_url(value: &str) -> Option<InlineImage<'_>> {
    let value = value.trim();
    if !is_inline_image(value) {
        return None;
    }
    let (header, payload) = value["data:".len()..].split_once(',')?;
    let (mime, encoding) = header.rsplit_once(';')?;
    if !encoding.trim().eq_ignore_ascii_case("base64") {
        return None;
    }
    let content_type = normalize_content_type(mime);
    if content_type.len() <= "image/".len() || payload.is_empty() {
        return None;
    }
    Some(InlineImage {
        content_type,
        payload,
    })
}

/// Content type from magic bytes, restricted to the accepted raster formats.
pub fn sniff_image_mime(data: &[u8]) -> Option<&'static str> {
    image::guess_format(data).ok().and_then(accepted_mime)
}

/// Content type guessed from a path or URL path extension.
pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    ImageFormat::from_path(path).ok().and_then(accepted_mime)
}

pub fn extension_for_mime(content_type: &str) -> Option<&'static str> {
    ImageFormat::from_mime_type(normalize_content_type(content_type))
        .filter(|format| accepted_mime(*format).is_some())
        .and_then(|format| format.extensions_str().first().copied())
}

/// Lowercased media type with any parameters stripped.
pub fn normalize_content_type(raw: &str) -> String {
    raw.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn accepted_mime(format: ImageFormat) -> Option<&'static str> {
    match format {
        ImageFormat::Png => Some("image/png"),
        ImageFormat::Jpeg => Some("image/jpeg"),
        ImageFormat::Gif => Some("image/gif"),
        ImageFormat::WebP => Some("image/webp"),
        ImageFormat::Bmp => Some("image/bmp"),
        ImageFormat::Tiff => Some("image/tiff"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nfake";

    #[test]
    fn sniffs_supported_signatures() {
        assert_eq!(sniff_image_mime(PNG_BYTES), Some("image/png"));
        assert_eq!(sniff_image_mime(b"\xff\xd8\xff\xe0rest"), Some("image/jpeg"));
        assert_eq!(sniff_image_mime(b"GIF89a......"), Some("image/gif"));
        assert_eq!(sniff_image_mime(b"RIFF\x10\x00\x00\x00WEBPVP8 "), Some("image/webp"));
        assert_eq!(sniff_image_mime(b"MM\x00*\x00\x00\x00\x08"), Some("image/tiff"));
        assert_eq!(sniff_image_mime(b"II*\x00\x08\x00\x00\x00"), Some("image/tiff"));
    }

    #[test]
    fn sniff_rejects_non_images() {
        assert_eq!(sniff_image_mime(b""), None);
        assert_eq!(sniff_image_mime(b"%PDF-1.7"), None);
        assert_eq!(sniff_image_mime(b"<svg xmlns="), None);
    }

    #[test]
    fn extension_guessing_covers_raster_formats_only() {
        assert_eq!(mime_for_path(Path::new("logo.PNG")), Some("image/png"));
        assert_eq!(mime_for_path(Path::new("/x/photo.jpeg")), Some("image/jpeg"));
        assert_eq!(mime_for_path(Path::new("scan.tif")), Some("image/tiff"));
        assert_eq!(mime_for_path(Path::new("notes.txt")), None);
        assert_eq!(mime_for_path(Path::new("vector.svg")), None);
    }

    #[test]
    fn resolved_image_round_trips_through_data_url() {
        let image = ResolvedImage::new(PNG_BYTES.to_vec(), "image/png", 1024).unwrap();
        let data_url = image.to_data_url();
        assert!(data_url.starts_with("data:image/png;base64,"));

        let parsed = parse_data_url(&data_url).unwrap();
        assert_eq!(parsed.content_type, "image/png");
        assert_eq!(parsed.decoded_len(), PNG_BYTES.len());
        assert_eq!(parsed.decode().unwrap(), PNG_BYTES);
    }

    #[test]
    fn resolved_image_enforces_size_and_type() {
        assert_eq!(
            ResolvedImage::new(Vec::new(), "image/png", 10),
            Err(ImageRejection::Empty)
        );
        assert_eq!(
            ResolvedImage::new(vec![0; 11], "image/png", 10),
            Err(ImageRejection::TooLarge { size: 11, limit: 10 })
        );
        assert_eq!(
            ResolvedImage::new(vec![0; 4], "text/html; charset=utf-8", 10),
            Err(ImageRejection::NotImage("text/html".to_string()))
        );
        let ok = ResolvedImage::new(vec![0; 4], "Image/JPEG; q=1", 10).unwrap();
        assert_eq!(ok.content_type(), "image/jpeg");
    }

    #[test]
    fn parse_data_url_requires_base64_image() {
        assert!(parse_data_url("data:image/png;base64,AAAA").is_some());
        assert!(parse_data_url("DATA:IMAGE/PNG;BASE64,AAAA").is_some());
        assert!(parse_data_url("data:text/plain;base64,AAAA").is_none());
        assert!(parse_data_url("data:image/png,rawbytes").is_none());
        assert!(parse_data_url("data:image/;base64,AAAA").is_none());
        assert!(parse_data_url("data:image/png;base64,").is_none());
    }

    #[test]
    fn extension_for_mime_defaults_to_known_formats() {
        assert_eq!(extension_for_mime("image/png"), Some("png"));
        assert_eq!(extension_for_mime("image/jpeg; charset=binary"), Some("jpg"));
        assert_eq!(extension_for_mime("application/json"), None);
    }
}
