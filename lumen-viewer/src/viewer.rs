//! Viewer state: the fetch pipeline, the GPU context and one
//! `PostGraphics` per listing entry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use lumen_fetch::{
    CancelToken, FetchError, FetchPipeline, HttpTransport, PipelineConfig, PipelineError,
    Transport, TransportRequest,
};
use lumen_render::{parse_listing, GpuContext, GpuTexture, PostGraphics, SlotState, WgpuUploader};

/// Counts of per-slot end states after a run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub loaded: usize,
    pub faulted: usize,
    pub ineligible: usize,
    pub pending: usize,
}

impl Summary {
    fn count(&mut self, state: SlotState) {
        match state {
            SlotState::Loaded => self.loaded += 1,
            SlotState::Faulted => self.faulted += 1,
            SlotState::Ineligible => self.ineligible += 1,
            _ => self.pending += 1,
        }
    }
}

pub struct Viewer {
    pub gpu: GpuContext,
    pipeline: FetchPipeline,
    posts: Vec<PostGraphics<GpuTexture>>,
}

impl Viewer {
    pub fn new(gpu: GpuContext, config: PipelineConfig) -> Result<Self, PipelineError> {
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new());
        let pipeline = FetchPipeline::spawn(config, transport)?;
        Ok(Self {
            gpu,
            pipeline,
            posts: Vec::new(),
        })
    }

    /// Replace the current posts with those parsed from `json`.
    pub fn load_listing(&mut self, json: &str) -> Result<usize, serde_json::Error> {
        let posts = parse_listing(json)?;
        self.posts = posts
            .into_iter()
            .enumerate()
            .map(|(n, post)| PostGraphics::new(n, post))
            .collect();
        Ok(self.posts.len())
    }

    /// Touch every texture so each eligible slot starts downloading.
    pub fn request_all(&mut self) {
        for graphics in self.posts.iter_mut() {
            graphics.thumbnail_texture(&self.pipeline);
            graphics.preview_texture(&self.pipeline);
        }
    }

    /// Upload whatever has been decoded. Returns whether every post settled.
    pub fn upload_ready(&mut self) -> bool {
        let uploader = WgpuUploader::new(&self.gpu);
        let mut settled = true;
        for graphics in self.posts.iter_mut() {
            graphics.upload_thumbnail(&uploader);
            graphics.upload_preview(&uploader);
            settled &= graphics.is_settled();
        }
        settled
    }

    /// Poll uploads until everything settles or `deadline` passes.
    pub fn run(&mut self, deadline: Duration, poll: Duration) -> Summary {
        let start = Instant::now();
        while !self.upload_ready() {
            if start.elapsed() >= deadline {
                warn!("gave up waiting after {:?}", deadline);
                break;
            }
            std::thread::sleep(poll);
        }
        self.gpu.queue.submit(std::iter::empty());
        self.summarize()
    }

    pub fn summarize(&self) -> Summary {
        let mut summary = Summary::default();
        for graphics in &self.posts {
            let (thumb, preview) = (graphics.thumbnail(), graphics.preview());
            info!(
                "#{:<3} {:<10?} {:<10?} {}",
                graphics.number(),
                thumb.state(),
                preview.state(),
                graphics.post().title
            );
            for slot in [thumb, preview] {
                if let Some(reason) = slot.fault_reason() {
                    warn!("#{} {}", graphics.number(), reason);
                }
                summary.count(slot.state());
            }
        }
        summary
    }

    pub fn shutdown(&self) {
        self.pipeline.shutdown();
        let stats = self.pipeline.stats();
        info!(
            "pipeline stats: requested={} coalesced={} completed={} failed={} filtered={}",
            stats.requested, stats.coalesced, stats.completed, stats.failed, stats.filtered
        );
    }
}

/// Read a listing from a file path or an `http(s)` URL.
pub fn read_listing(source: &str) -> Result<String, FetchError> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let request = TransportRequest {
            url: source.to_string(),
            accept: "application/json".to_string(),
        };
        let response = HttpTransport::new().fetch(&request, &CancelToken::new())?;
        return String::from_utf8(response.body).map_err(|e| FetchError::Other(e.to_string()));
    }
    Ok(std::fs::read_to_string(source)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts() {
        let mut summary = Summary::default();
        for state in [
            SlotState::Loaded,
            SlotState::Faulted,
            SlotState::Ineligible,
            SlotState::Requested,
            SlotState::Loaded,
        ] {
            summary.count(state);
        }
        assert_eq!(
            summary,
            Summary {
                loaded: 2,
                faulted: 1,
                ineligible: 1,
                pending: 1
            }
        );
    }

    #[test]
    fn test_read_listing_missing_file() {
        let err = read_listing("/nonexistent/listing.json").unwrap_err();
        assert!(matches!(err, FetchError::NotFound(_) | FetchError::Io(_)));
    }
}
