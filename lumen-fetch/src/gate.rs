//! Content-type gate.
//!
//! Decides whether a successfully transported response is eligible for
//! image decode at all. Comparison is on the bare media type: parameters
//! (`; charset=...`) and surrounding whitespace are ignored, case is folded.

/// Media types accepted as decodable images.
pub const IMAGE_CONTENT_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/jpg",
    "image/bmp",
    "image/gif",
];

/// `Accept` header value advertising [`IMAGE_CONTENT_TYPES`].
pub const IMAGE_ACCEPT: &str = "image/png, image/jpeg, image/jpg, image/bmp, image/gif";

/// Normalise a `Content-Type` / `Accept` entry to its lowercase media type.
pub fn media_type(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Whether `content_type` is one of the decodable image types.
pub fn is_image_content_type(content_type: &str) -> bool {
    let media = media_type(content_type);
    IMAGE_CONTENT_TYPES.iter().any(|allowed| *allowed == media)
}
