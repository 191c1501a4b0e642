//! Posts from a subreddit listing and the two images each one owns.
//!
//! Metadata arrives as Reddit's listing JSON:
//!
//! ```text
//! { "data": { "children": [ { "data": { "title", "thumbnail",
//!     "thumbnail_width", "thumbnail_height",
//!     "preview": { "images": [ { "source": { "url", "width", "height" } } ] } } } ] } }
//! ```
//!
//! A `thumbnail_width` / `thumbnail_height` of `-1` means there is no
//! thumbnail, as does a `thumbnail` that is not a URL (`"self"`,
//! `"default"`, `"nsfw"`).

use lumen_fetch::{Priority, Requester, ResourceKey};
use serde::{Deserialize, Serialize};

use crate::decode::ChannelPolicy;
use crate::slot::{ImageSlot, SlotState};
use crate::texture::TextureUploader;

/// Sentinel Reddit uses for a missing thumbnail dimension.
pub const NO_THUMBNAIL: i32 = -1;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PostData {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub permalink: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub thumbnail_width: Option<i32>,
    #[serde(default)]
    pub thumbnail_height: Option<i32>,
    #[serde(default)]
    pub preview: Option<Preview>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Preview {
    #[serde(default)]
    pub images: Vec<PreviewImage>,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewImage {
    pub source: ImageSource,
    #[serde(default)]
    pub resolutions: Vec<ImageSource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSource {
    pub url: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

impl PostData {
    /// Thumbnail URL, if the post has a usable one.
    pub fn thumbnail_url(&self) -> Option<&str> {
        let url = self.thumbnail.as_deref()?;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return None;
        }
        let width = self.thumbnail_width.unwrap_or(NO_THUMBNAIL);
        let height = self.thumbnail_height.unwrap_or(NO_THUMBNAIL);
        if width == NO_THUMBNAIL || height == NO_THUMBNAIL {
            return None;
        }
        Some(url)
    }

    /// Full-size preview URL with HTML entities undone.
    pub fn preview_url(&self) -> Option<String> {
        let image = self.preview.as_ref()?.images.first()?;
        if image.source.url.is_empty() {
            return None;
        }
        Some(image.source.url.replace("&amp;", "&"))
    }

    pub fn has_thumbnail(&self) -> bool {
        self.thumbnail_url().is_some()
    }

    pub fn has_preview(&self) -> bool {
        self.preview_url().is_some()
    }
}

#[derive(Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<Child>,
}

#[derive(Deserialize)]
struct Child {
    data: PostData,
}

/// Parse a listing document into its posts, in listing order.
pub fn parse_listing(json: &str) -> Result<Vec<PostData>, serde_json::Error> {
    let listing: Listing = serde_json::from_str(json)?;
    Ok(listing.data.children.into_iter().map(|c| c.data).collect())
}

/// A post plus its thumbnail and preview slots.
///
/// Thumbnails go out at high priority and keep their native channel layout.
/// Previews are normal priority and always decoded to RGBA.
pub struct PostGraphics<T> {
    number: usize,
    post: PostData,
    thumbnail: ImageSlot<T>,
    preview: ImageSlot<T>,
}

impl<T> PostGraphics<T> {
    pub fn new(number: usize, post: PostData) -> Self {
        let thumbnail = ImageSlot::new(
            format!("post#{number}/thumbnail"),
            post.thumbnail_url().map(ResourceKey::new),
            Priority::High,
            ChannelPolicy::Native,
        );
        let preview = ImageSlot::new(
            format!("post#{number}/preview"),
            post.preview_url().map(ResourceKey::new),
            Priority::Normal,
            ChannelPolicy::ForceRgba,
        );
        Self {
            number,
            post,
            thumbnail,
            preview,
        }
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn post(&self) -> &PostData {
        &self.post
    }

    pub fn has_thumbnail(&self) -> bool {
        self.thumbnail.is_eligible()
    }

    pub fn has_preview(&self) -> bool {
        self.preview.is_eligible()
    }

    pub fn thumbnail(&self) -> &ImageSlot<T> {
        &self.thumbnail
    }

    pub fn preview(&self) -> &ImageSlot<T> {
        &self.preview
    }

    pub fn request_thumbnail(&mut self, requester: &dyn Requester) -> bool {
        self.thumbnail.request(requester)
    }

    pub fn request_preview(&mut self, requester: &dyn Requester) -> bool {
        self.preview.request(requester)
    }

    /// Thumbnail texture; the first call starts the download.
    pub fn thumbnail_texture(&mut self, requester: &dyn Requester) -> Option<&T> {
        self.thumbnail.texture_or_request(requester)
    }

    /// Preview texture; the first call starts the download.
    pub fn preview_texture(&mut self, requester: &dyn Requester) -> Option<&T> {
        self.preview.texture_or_request(requester)
    }

    pub fn upload_thumbnail<U>(&mut self, uploader: &U) -> SlotState
    where
        U: TextureUploader<Texture = T> + ?Sized,
    {
        self.thumbnail.upload(uploader)
    }

    pub fn upload_preview<U>(&mut self, uploader: &U) -> SlotState
    where
        U: TextureUploader<Texture = T> + ?Sized,
    {
        self.preview.upload(uploader)
    }

    /// Both slots loaded, faulted or ineligible.
    pub fn is_settled(&self) -> bool {
        self.thumbnail.state().is_terminal() && self.preview.state().is_terminal()
    }
}

impl<T> std::fmt::Debug for PostGraphics<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostGraphics")
            .field("number", &self.number)
            .field("title", &self.post.title)
            .field("thumbnail", &self.thumbnail)
            .field("preview", &self.preview)
            .finish()
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::tests::{png, FakeTexture, ManualRequester, RecordingUploader};
    use crate::texture::PixelFormat;
    use lumen_fetch::{FetchOutcome, Payload};

    const LISTING: &str = r#"{
        "kind": "Listing",
        "data": {
            "after": "t3_b",
            "children": [
                { "kind": "t3", "data": {
                    "id": "a", "title": "With images",
                    "thumbnail": "https://b.thumbs.example/a.jpg",
                    "thumbnail_width": 140, "thumbnail_height": 78,
                    "preview": { "enabled": true, "images": [ { "id": "x",
                        "source": { "url": "https://preview.example/a.png?w=1&amp;s=2", "width": 640, "height": 360 },
                        "resolutions": [] } ] },
                    "score": 12
                } },
                { "kind": "t3", "data": {
                    "id": "b", "title": "Self post",
                    "thumbnail": "self",
                    "thumbnail_width": null, "thumbnail_height": null
                } },
                { "kind": "t3", "data": {
                    "id": "c", "title": "Sentinel",
                    "thumbnail": "https://b.thumbs.example/c.jpg",
                    "thumbnail_width": -1, "thumbnail_height": 70
                } }
            ]
        }
    }"#;

    #[test]
    fn test_parse_listing() {
        let posts = parse_listing(LISTING).unwrap();
        assert_eq!(posts.len(), 3);
        assert_eq!(posts[0].title, "With images");
        assert_eq!(posts[0].thumbnail_url(), Some("https://b.thumbs.example/a.jpg"));
        assert_eq!(
            posts[0].preview_url().as_deref(),
            Some("https://preview.example/a.png?w=1&s=2")
        );
    }

    #[test]
    fn test_eligibility() {
        let posts = parse_listing(LISTING).unwrap();
        assert!(posts[0].has_thumbnail() && posts[0].has_preview());
        assert!(!posts[1].has_thumbnail() && !posts[1].has_preview());
        assert!(!posts[2].has_thumbnail());
    }

    #[test]
    fn test_parse_listing_rejects_garbage() {
        assert!(parse_listing("not json").is_err());
        assert!(parse_listing(r#"{"data":{}}"#).unwrap().is_empty());
    }

    #[test]
    fn test_post_graphics_priorities_and_lazy_request() {
        let posts = parse_listing(LISTING).unwrap();
        let requester = ManualRequester::default();
        let mut graphics: PostGraphics<FakeTexture> = PostGraphics::new(1, posts[0].clone());

        assert!(graphics.thumbnail_texture(&requester).is_none());
        assert!(graphics.preview_texture(&requester).is_none());
        assert!(graphics.thumbnail_texture(&requester).is_none());
        assert_eq!(requester.requested(), 2);

        let pending = requester.pending.lock();
        assert_eq!(pending[0].1, Priority::High);
        assert_eq!(pending[1].1, Priority::Normal);
    }

    #[test]
    fn test_preview_is_forced_rgba() {
        let posts = parse_listing(LISTING).unwrap();
        let requester = ManualRequester::default();
        let uploader = RecordingUploader::default();
        let mut graphics: PostGraphics<FakeTexture> = PostGraphics::new(1, posts[0].clone());
        graphics.request_preview(&requester);

        let rgb = image::RgbImage::new(4, 4);
        let body = png(image::DynamicImage::ImageRgb8(rgb));
        requester.complete(
            0,
            FetchOutcome::Success(Payload::new(200, Some("image/png".into()), body)),
        );
        assert_eq!(graphics.upload_preview(&uploader), SlotState::Loaded);
        assert_eq!(
            graphics.preview().texture().unwrap().format,
            PixelFormat::Rgba32
        );
        assert_eq!(graphics.thumbnail().state(), SlotState::Idle);
        assert!(!graphics.is_settled());
    }

    #[test]
    fn test_ineligible_post_is_settled() {
        let posts = parse_listing(LISTING).unwrap();
        let requester = ManualRequester::default();
        let uploader = RecordingUploader::default();
        let mut graphics: PostGraphics<FakeTexture> = PostGraphics::new(2, posts[1].clone());
        assert!(!graphics.request_thumbnail(&requester));
        assert!(!graphics.request_preview(&requester));
        assert_eq!(graphics.upload_thumbnail(&uploader), SlotState::Ineligible);
        assert!(graphics.is_settled());
        assert_eq!(requester.requested(), 0);
    }
}
