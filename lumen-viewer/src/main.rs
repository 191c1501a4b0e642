//! Lumen Viewer: loads a subreddit listing and pulls every post's
//! thumbnail and preview onto the GPU.
//!
//! ```text
//! lumen-viewer <listing.json | https://www.reddit.com/r/rust/.json> [workers]
//! ```
//!
//! Images are fetched and decoded on `lumen-fetch` workers; uploads happen
//! on this thread against a headless `wgpu` device.

mod viewer;

use std::time::Duration;

use log::info;
use lumen_fetch::PipelineConfig;
use lumen_render::GpuContext;
use viewer::Viewer;

const RUN_DEADLINE: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_millis(16);

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let Some(source) = args.next() else {
        eprintln!("usage: lumen-viewer <listing.json | url> [workers]");
        std::process::exit(2);
    };
    let mut config = PipelineConfig {
        response_cache_capacity: 64,
        ..PipelineConfig::default()
    };
    if let Some(workers) = args.next() {
        let workers: usize = workers.parse().expect("worker count must be a number");
        config = config.with_workers(workers);
    }

    info!("Starting Lumen Viewer with {} workers...", config.worker_count);

    let gpu = pollster::block_on(GpuContext::new_headless()).expect("Failed to initialize GPU");
    info!("GPU: {}", gpu.adapter_name());

    let mut viewer = Viewer::new(gpu, config).expect("Failed to start fetch pipeline");
    let json = viewer::read_listing(&source).expect("Failed to read listing");
    let count = viewer.load_listing(&json).expect("Failed to parse listing");
    info!("{count} posts in {source}");

    viewer.request_all();
    let summary = viewer.run(RUN_DEADLINE, POLL_INTERVAL);
    viewer.shutdown();

    info!(
        "loaded={} faulted={} without image={} unfinished={}",
        summary.loaded, summary.faulted, summary.ineligible, summary.pending
    );
}
