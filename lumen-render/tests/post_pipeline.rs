//! End-to-end tests: listing posts fetched through a live pipeline, decoded
//! on worker threads and uploaded on the test thread.

use std::cell::Cell;
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::{DynamicImage, ImageFormat, RgbImage, RgbaImage};
use lumen_fetch::{FetchError, FetchPipeline, MemoryTransport, PipelineConfig, ResourceKey};
use lumen_render::{
    parse_listing, PixelFormat, PostData, PostGraphics, SlotState, TextureDesc, TextureUploader,
    UploadError,
};

#[derive(Debug)]
struct Texture {
    width: u32,
    height: u32,
    format: PixelFormat,
}

#[derive(Default)]
struct CountingUploader {
    created: Cell<usize>,
}

impl TextureUploader for CountingUploader {
    type Texture = Texture;

    fn create_texture(&self, desc: &TextureDesc<'_>, pixels: &[u8]) -> Result<Texture, UploadError> {
        assert_eq!(pixels.len(), desc.byte_len());
        self.created.set(self.created.get() + 1);
        Ok(Texture {
            width: desc.width,
            height: desc.height,
            format: desc.format,
        })
    }
}

fn encode(image: DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, format).unwrap();
    out.into_inner()
}

fn post(thumbnail: &str, preview: Option<&str>) -> PostData {
    let preview = preview
        .map(|url| format!(r#", "preview": {{ "images": [ {{ "source": {{ "url": "{url}" }} }} ] }}"#))
        .unwrap_or_default();
    let json = format!(
        r#"{{ "data": {{ "children": [ {{ "data": {{
            "title": "t", "thumbnail": "{thumbnail}",
            "thumbnail_width": 140, "thumbnail_height": 140 {preview}
        }} }} ] }} }}"#
    );
    parse_listing(&json).unwrap().remove(0)
}

/// Poll uploads on this thread until every post settles.
fn pump(posts: &mut [PostGraphics<Texture>], uploader: &CountingUploader) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        for graphics in posts.iter_mut() {
            graphics.upload_thumbnail(uploader);
            graphics.upload_preview(uploader);
        }
        if posts.iter().all(|g| g.is_settled()) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

/// Keys are released just after their listeners return.
fn released(mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(1) {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

#[test]
fn test_thumbnail_and_preview_load() {
    let transport = Arc::new(MemoryTransport::new());
    transport.insert(
        "https://x/t.png",
        "image/png",
        encode(DynamicImage::ImageRgb8(RgbImage::new(14, 10)), ImageFormat::Png),
    );
    transport.insert(
        "https://x/p.bmp",
        "image/bmp",
        encode(DynamicImage::ImageRgb8(RgbImage::new(64, 32)), ImageFormat::Bmp),
    );
    let pipeline = FetchPipeline::spawn(PipelineConfig::for_testing(), transport).unwrap();
    let uploader = CountingUploader::default();

    let mut posts = vec![PostGraphics::new(0, post("https://x/t.png", Some("https://x/p.bmp")))];
    assert!(posts[0].thumbnail_texture(&pipeline).is_none());
    assert!(posts[0].preview_texture(&pipeline).is_none());

    assert!(pump(&mut posts, &uploader));
    let thumb = posts[0].thumbnail_texture(&pipeline).unwrap();
    assert_eq!((thumb.width, thumb.height, thumb.format), (14, 10, PixelFormat::Rgb24));
    let preview = posts[0].preview_texture(&pipeline).unwrap();
    assert_eq!((preview.width, preview.height, preview.format), (64, 32, PixelFormat::Rgba32));
    assert_eq!(uploader.created.get(), 2);
    assert!(released(|| pipeline.in_flight_len() == 0));
}

#[test]
fn test_html_response_faults_slot() {
    let transport = Arc::new(MemoryTransport::new());
    transport.insert("https://x/a.png", "text/html", b"<html>nope</html>".to_vec());
    let pipeline = FetchPipeline::spawn(PipelineConfig::for_testing(), transport).unwrap();
    let uploader = CountingUploader::default();

    let mut posts = vec![PostGraphics::new(0, post("https://x/a.png", None))];
    posts[0].request_thumbnail(&pipeline);
    assert!(pump(&mut posts, &uploader));
    assert_eq!(posts[0].thumbnail().state(), SlotState::Faulted);
    assert!(!posts[0].thumbnail().is_downloaded());
    assert_eq!(posts[0].preview().state(), SlotState::Ineligible);
    assert_eq!(uploader.created.get(), 0);
}

#[test]
fn test_connection_refused_faults_slot() {
    let transport = Arc::new(MemoryTransport::new());
    transport.insert_error("https://x/a.png", FetchError::Connect("refused".into()));
    let pipeline = FetchPipeline::spawn(PipelineConfig::for_testing(), transport).unwrap();
    let uploader = CountingUploader::default();

    let mut posts = vec![PostGraphics::new(0, post("https://x/a.png", None))];
    posts[0].request_thumbnail(&pipeline);
    assert!(pump(&mut posts, &uploader));
    assert!(posts[0].thumbnail().is_faulted());
    assert!(posts[0].thumbnail().fault_reason().unwrap().contains("refused"));
}

#[test]
fn test_shared_thumbnail_is_fetched_once() {
    let transport = Arc::new(
        MemoryTransport::new().with_latency(Duration::from_millis(30)),
    );
    transport.insert(
        "https://x/same.png",
        "image/png",
        encode(DynamicImage::ImageRgba8(RgbaImage::new(4, 4)), ImageFormat::Png),
    );
    let pipeline =
        FetchPipeline::spawn(PipelineConfig::for_testing(), transport.clone()).unwrap();
    let uploader = CountingUploader::default();

    let mut posts: Vec<PostGraphics<Texture>> = (0..3)
        .map(|n| PostGraphics::new(n, post("https://x/same.png", None)))
        .collect();
    for graphics in posts.iter_mut() {
        graphics.request_thumbnail(&pipeline);
    }
    assert!(pump(&mut posts, &uploader));
    assert!(posts.iter().all(|g| g.thumbnail().is_loaded()));
    assert_eq!(transport.calls("https://x/same.png"), 1);
    assert!(released(|| !pipeline.is_outstanding(&ResourceKey::new("https://x/same.png"))));
}

#[test]
fn test_requests_after_shutdown_fault() {
    let transport = Arc::new(MemoryTransport::new());
    let pipeline = FetchPipeline::spawn(PipelineConfig::for_testing(), transport).unwrap();
    pipeline.shutdown();

    let mut graphics: PostGraphics<Texture> = PostGraphics::new(0, post("https://x/a.png", None));
    graphics.request_thumbnail(&pipeline);
    assert_eq!(graphics.thumbnail().state(), SlotState::Faulted);
}
