//! The fetch pipeline: dispatch queues, in-flight registry and worker pool
//! behind a single owner.
//!
//! Architecture:
//! ```text
//!  consumer ──request()──► Registry (insert-if-absent)
//!                               │ new key          │ duplicate key
//!                               ▼                  ▼
//!                     DispatchQueues        attach waiter
//!                     (high │ normal)       (high promotes a queued entry)
//!                               │ condvar wake
//!               ┌───────────────┼───────────────┐
//!               ▼               ▼               ▼
//!           worker 1        worker 2   ...  worker N
//!               │ transport.fetch(), gated per waiter
//!               ▼
//!        listeners (worker thread) + RequestHandle channels
//! ```
//!
//! There is no process-wide instance: construct a [`FetchPipeline`] once
//! and share it (usually as `Arc<dyn Requester>`) with consumers.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use tokio::sync::oneshot;

use crate::error::PipelineError;
use crate::outcome::Payload;
use crate::queue::{DispatchQueues, QueuedRequest};
use crate::registry::{InFlightRegistry, Registration, Waiter};
use crate::request::{FetchRequest, Priority, RequestId, ResourceKey};
use crate::requester::{RequestHandle, Requester};
use crate::transport::{CancelToken, Transport};
use crate::worker::{self, WorkerInfo, WorkerSnapshot};

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of worker threads (minimum 1)
    pub worker_count: usize,
    /// Issue a HEAD request before each fetch and skip rejected bodies
    pub head_check: bool,
    /// Successful payloads kept for repeat requests (0 = disabled)
    pub response_cache_capacity: usize,
    /// How long `shutdown()` waits for busy workers before detaching them
    pub shutdown_grace: Duration,
    /// Worker thread name prefix; threads are named `{prefix}-{id}`
    pub thread_name_prefix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            head_check: false,
            response_cache_capacity: 0,
            shutdown_grace: Duration::from_secs(2),
            thread_name_prefix: "lumen-fetch".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Config for testing (short grace period).
    pub fn for_testing() -> Self {
        Self {
            worker_count: 2,
            head_check: false,
            response_cache_capacity: 0,
            shutdown_grace: Duration::from_millis(250),
            thread_name_prefix: "lumen-fetch-test".to_string(),
        }
    }

    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }
}

/// Pipeline statistics.
///
/// `completed`, `failed` and `filtered` count delivered outcomes, one per
/// waiter, so coalesced requests are counted individually.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub requested: u64,
    pub coalesced: u64,
    pub completed: u64,
    pub failed: u64,
    pub filtered: u64,
    pub cache_hits: u64,
    pub listener_panics: u64,
    pub rejected: u64,
    pub dropped_at_shutdown: u64,
}

/// Lock-free counters updated by requesters and workers.
#[derive(Default)]
pub(crate) struct AtomicPipelineStats {
    pub(crate) requested: AtomicU64,
    pub(crate) coalesced: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) filtered: AtomicU64,
    pub(crate) cache_hits: AtomicU64,
    pub(crate) listener_panics: AtomicU64,
    pub(crate) rejected: AtomicU64,
    pub(crate) dropped_at_shutdown: AtomicU64,
}

impl AtomicPipelineStats {
    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            requested: self.requested.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            listener_panics: self.listener_panics.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dropped_at_shutdown: self.dropped_at_shutdown.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Constructed; requests queue up but nothing runs.
    Idle,
    Running,
    ShutDown,
}

/// Queues plus lifecycle phase, guarded together so a wake is never lost.
pub(crate) struct Dispatch {
    pub(crate) queues: DispatchQueues,
    pub(crate) phase: Phase,
}

/// State shared between the pipeline handle and its workers.
pub(crate) struct Shared {
    pub(crate) dispatch: Mutex<Dispatch>,
    pub(crate) wake: Condvar,
    pub(crate) registry: InFlightRegistry,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) cancel: CancelToken,
    pub(crate) head_check: bool,
    pub(crate) cache: Option<Mutex<LruCache<ResourceKey, Payload>>>,
    pub(crate) stats: AtomicPipelineStats,
    pub(crate) live_workers: Mutex<usize>,
    pub(crate) workers_exited: Condvar,
}

impl Shared {
    pub(crate) fn cache_get(&self, key: &ResourceKey) -> Option<Payload> {
        self.cache.as_ref()?.lock().get(key).cloned()
    }

    pub(crate) fn cache_put(&self, key: &ResourceKey, payload: &Payload) {
        if let Some(cache) = &self.cache {
            cache.lock().put(key.clone(), payload.clone());
        }
    }
}

/// Owner of the worker pool and the [`Requester`] implementation.
pub struct FetchPipeline {
    config: PipelineConfig,
    shared: Arc<Shared>,
    workers: Vec<Arc<WorkerInfo>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl FetchPipeline {
    /// Create a pipeline without starting its workers.
    pub fn new(config: PipelineConfig, transport: Arc<dyn Transport>) -> Self {
        let worker_count = config.worker_count.max(1);
        let cache = NonZeroUsize::new(config.response_cache_capacity)
            .map(|capacity| Mutex::new(LruCache::new(capacity)));

        let shared = Arc::new(Shared {
            dispatch: Mutex::new(Dispatch {
                queues: DispatchQueues::new(),
                phase: Phase::Idle,
            }),
            wake: Condvar::new(),
            registry: InFlightRegistry::new(),
            transport,
            cancel: CancelToken::new(),
            head_check: config.head_check,
            cache,
            stats: AtomicPipelineStats::default(),
            live_workers: Mutex::new(0),
            workers_exited: Condvar::new(),
        });

        let workers = (1..=worker_count)
            .map(|id| {
                Arc::new(WorkerInfo::new(
                    id,
                    format!("{}-{id}", config.thread_name_prefix),
                ))
            })
            .collect();

        Self {
            config,
            shared,
            workers,
            threads: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create and start a pipeline.
    pub fn spawn(config: PipelineConfig, transport: Arc<dyn Transport>) -> Result<Self, PipelineError> {
        let pipeline = Self::new(config, transport);
        pipeline.start()?;
        Ok(pipeline)
    }

    /// Start the worker threads. No-op if already running.
    pub fn start(&self) -> Result<(), PipelineError> {
        {
            let mut dispatch = self.shared.dispatch.lock();
            match dispatch.phase {
                Phase::Running => return Ok(()),
                Phase::ShutDown => return Err(PipelineError::ShutDown),
                Phase::Idle => dispatch.phase = Phase::Running,
            }
        }

        let mut threads = self.threads.lock();
        for info in &self.workers {
            let shared = self.shared.clone();
            let worker_info = info.clone();
            *self.shared.live_workers.lock() += 1;
            let spawned = std::thread::Builder::new()
                .name(info.name().to_string())
                .spawn(move || worker::run(shared, worker_info));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(err) => {
                    *self.shared.live_workers.lock() -= 1;
                    drop(threads);
                    self.shutdown();
                    return Err(PipelineError::Spawn(err));
                }
            }
        }
        // Wake workers for anything queued before start.
        self.shared.wake.notify_all();

        log::info!(
            "Fetch pipeline started: {} worker(s), head_check={}, cache={}",
            self.workers.len(),
            self.config.head_check,
            self.config.response_cache_capacity
        );
        Ok(())
    }

    /// Stop the pipeline.
    ///
    /// Queued requests and registry entries are dropped without notifying
    /// their listeners; handles observe a closed channel. Workers are given
    /// `shutdown_grace` to leave their current fetch; any still blocked in
    /// a non-cooperative transport after that are detached. Idempotent.
    pub fn shutdown(&self) {
        let queued = {
            let mut dispatch = self.shared.dispatch.lock();
            if dispatch.phase == Phase::ShutDown {
                return;
            }
            dispatch.phase = Phase::ShutDown;
            dispatch.queues.clear().len()
        };
        // Drain before cancelling so no cancelled fetch can still deliver.
        let drained = self.shared.registry.drain();
        self.shared
            .stats
            .dropped_at_shutdown
            .fetch_add(drained as u64, Ordering::Relaxed);

        self.shared.wake.notify_all();
        self.shared.cancel.cancel();

        let deadline = Instant::now() + self.config.shutdown_grace;
        {
            let mut live = self.shared.live_workers.lock();
            while *live > 0 {
                if self
                    .shared
                    .workers_exited
                    .wait_until(&mut live, deadline)
                    .timed_out()
                {
                    break;
                }
            }
        }

        let threads = std::mem::take(&mut *self.threads.lock());
        let mut detached = 0;
        for handle in threads {
            if handle.is_finished() {
                if handle.join().is_err() {
                    log::error!("worker thread terminated by panic");
                }
            } else {
                detached += 1;
                log::warn!(
                    "worker {:?} still busy after {:?}, detaching",
                    handle.thread().name(),
                    self.config.shutdown_grace
                );
            }
        }

        log::info!(
            "Fetch pipeline shut down: {queued} queued and {drained} registered request(s) dropped, {detached} worker(s) detached"
        );
    }

    pub fn is_running(&self) -> bool {
        self.shared.dispatch.lock().phase == Phase::Running
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.dispatch.lock().phase == Phase::ShutDown
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Snapshot of every worker, including the request it is processing.
    pub fn workers(&self) -> Vec<WorkerSnapshot> {
        self.workers.iter().map(|w| w.snapshot()).collect()
    }

    /// Requests waiting in the dispatch queues.
    pub fn queued_len(&self) -> usize {
        self.shared.dispatch.lock().queues.len()
    }

    /// Registry entries (queued or in flight).
    pub fn in_flight_len(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn in_flight_keys(&self) -> Vec<ResourceKey> {
        self.shared.registry.keys()
    }

    pub fn is_outstanding(&self, key: &ResourceKey) -> bool {
        self.shared.registry.contains(key)
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.stats.snapshot()
    }

    fn next_request_id(&self) -> RequestId {
        RequestId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Requester for FetchPipeline {
    fn request(&self, request: FetchRequest) -> RequestHandle {
        let id = self.next_request_id();
        let FetchRequest {
            key,
            accept,
            priority,
            listener,
        } = request;
        self.shared.stats.requested.fetch_add(1, Ordering::Relaxed);

        // Registration and enqueue happen under the dispatch lock so that
        // shutdown either sees the entry (and drains it) or we see shutdown.
        let mut dispatch = self.shared.dispatch.lock();
        if dispatch.phase == Phase::ShutDown {
            drop(dispatch);
            self.shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
            log::warn!("{id} {key}: rejected, pipeline is shut down");
            return RequestHandle::rejected(id, key);
        }

        let (tx, rx) = oneshot::channel();
        let waiter = Waiter::new(id, accept.clone(), listener, tx);
        match self.shared.registry.register_or_attach(&key, waiter) {
            Registration::New { status } => {
                dispatch.queues.enqueue(QueuedRequest {
                    id,
                    key: key.clone(),
                    accept,
                    priority,
                });
                drop(dispatch);
                self.shared.wake.notify_one();
                log::debug!("{id} {key}: queued ({priority:?})");
                RequestHandle::new(id, key, None, status, rx)
            }
            Registration::Coalesced { owner, status } => {
                // A high-priority duplicate must not wait behind normal work.
                let promoted = priority == Priority::High && dispatch.queues.promote(owner);
                drop(dispatch);
                self.shared.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                if promoted {
                    log::debug!("{id} {key}: coalesced into {owner}, promoted to high priority");
                } else {
                    log::debug!("{id} {key}: coalesced into {owner}");
                }
                RequestHandle::new(id, key, Some(owner), status, rx)
            }
        }
    }
}

impl Drop for FetchPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::FetchOutcome;
    use crate::registry::RequestStatus;
    use crate::transport::MemoryTransport;

    fn memory() -> Arc<MemoryTransport> {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert("https://x/a.png", "image/png", vec![1, 2, 3, 4]);
        transport
    }

    #[test]
    fn test_config_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.worker_count, 2);
        assert!(!config.head_check);
        assert_eq!(config.response_cache_capacity, 0);
        assert_eq!(PipelineConfig::for_testing().with_workers(5).worker_count, 5);
    }

    #[test]
    fn test_worker_names_and_count() {
        let pipeline = FetchPipeline::new(PipelineConfig::default().with_workers(0), memory());
        let workers = pipeline.workers();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].name, "lumen-fetch-1");
    }

    #[test]
    fn test_requests_queue_before_start() {
        let pipeline = FetchPipeline::new(PipelineConfig::for_testing(), memory());
        let handle = pipeline.request(FetchRequest::new("https://x/a.png"));
        assert!(!pipeline.is_running());
        assert_eq!(pipeline.queued_len(), 1);
        assert_eq!(pipeline.in_flight_len(), 1);
        assert_eq!(handle.status(), RequestStatus::Queued);

        pipeline.start().unwrap();
        let outcome = handle.wait().unwrap();
        assert!(outcome.is_success());
        // Released right after the handle is notified.
        let deadline = Instant::now() + Duration::from_secs(1);
        while pipeline.in_flight_len() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(pipeline.in_flight_len(), 0);
    }

    #[test]
    fn test_start_is_idempotent() {
        let pipeline = FetchPipeline::new(PipelineConfig::for_testing(), memory());
        pipeline.start().unwrap();
        pipeline.start().unwrap();
        assert!(pipeline.is_running());
        pipeline.shutdown();
        assert!(matches!(pipeline.start(), Err(PipelineError::ShutDown)));
    }

    #[test]
    fn test_request_after_shutdown_is_rejected() {
        let pipeline = FetchPipeline::spawn(PipelineConfig::for_testing(), memory()).unwrap();
        pipeline.shutdown();
        pipeline.shutdown();
        assert!(pipeline.is_shut_down());

        let handle = pipeline.request(FetchRequest::new("https://x/a.png"));
        assert_eq!(handle.status(), RequestStatus::Dropped);
        assert!(handle.wait().is_none());
        assert_eq!(pipeline.stats().rejected, 1);
    }

    #[test]
    fn test_shutdown_drops_queued_requests() {
        let pipeline = FetchPipeline::new(PipelineConfig::for_testing(), memory());
        let handle = pipeline.request(FetchRequest::new("https://x/a.png"));
        pipeline.shutdown();
        assert_eq!(pipeline.queued_len(), 0);
        assert_eq!(pipeline.in_flight_len(), 0);
        assert_eq!(handle.status(), RequestStatus::Dropped);
        assert!(handle.wait().is_none());
        assert_eq!(pipeline.stats().dropped_at_shutdown, 1);
    }

    #[test]
    fn test_response_cache_serves_repeat_requests() {
        let transport = memory();
        let config = PipelineConfig {
            response_cache_capacity: 8,
            ..PipelineConfig::for_testing()
        };
        let pipeline = FetchPipeline::spawn(config, transport.clone()).unwrap();

        let first = pipeline.request(FetchRequest::new("https://x/a.png")).wait();
        let second = pipeline.request(FetchRequest::new("https://x/a.png")).wait();
        assert_eq!(first, second);
        assert!(matches!(second, Some(FetchOutcome::Success(_))));
        assert_eq!(transport.calls("https://x/a.png"), 1);
        assert_eq!(pipeline.stats().cache_hits, 1);
    }
}
