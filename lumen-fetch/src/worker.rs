//! Worker threads.
//!
//! Each worker loops until shutdown:
//!
//! ```text
//!  wait on condvar ──► dequeue (priority first) ──► registry.begin()
//!        ▲                                               │
//!        │                                               ▼
//!  guard.finish() ◄── gate per waiter ◄── cache / HEAD check / fetch
//! ```
//!
//! Transport and listener panics are caught per request, so a worker only
//! ever exits when the pipeline shuts down.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::FetchError;
use crate::outcome::{FetchOutcome, Payload};
use crate::pipeline::{Phase, Shared};
use crate::queue::QueuedRequest;
use crate::registry::{EntryGuard, InFlightEntry, RequestStatus, Waiter};
use crate::request::{AcceptFilter, RequestId, ResourceKey};
use crate::transport::TransportRequest;

/// Observable state of one worker.
#[derive(Debug)]
pub struct WorkerInfo {
    id: usize,
    name: String,
    current: Mutex<Option<ResourceKey>>,
    processed: AtomicU64,
}

/// Point-in-time copy of a [`WorkerInfo`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub id: usize,
    pub name: String,
    /// Key of the request being processed right now.
    pub current: Option<ResourceKey>,
    pub processed: u64,
}

impl WorkerInfo {
    pub(crate) fn new(id: usize, name: String) -> Self {
        Self {
            id,
            name,
            current: Mutex::new(None),
            processed: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn current(&self) -> Option<ResourceKey> {
        self.current.lock().clone()
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            name: self.name.clone(),
            current: self.current(),
            processed: self.processed.load(Ordering::Relaxed),
        }
    }
}

/// Clears the worker's current request and counts it, even on unwind.
struct CurrentRequest<'a>(&'a WorkerInfo);

impl<'a> CurrentRequest<'a> {
    fn set(info: &'a WorkerInfo, key: &ResourceKey) -> Self {
        *info.current.lock() = Some(key.clone());
        Self(info)
    }
}

impl Drop for CurrentRequest<'_> {
    fn drop(&mut self) {
        *self.0.current.lock() = None;
        self.0.processed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Decrements the live-worker count when the thread leaves `run`.
struct ExitSignal<'a>(&'a Shared);

impl Drop for ExitSignal<'_> {
    fn drop(&mut self) {
        let mut live = self.0.live_workers.lock();
        *live = live.saturating_sub(1);
        self.0.workers_exited.notify_all();
    }
}

/// Thread body.
pub(crate) fn run(shared: Arc<Shared>, info: Arc<WorkerInfo>) {
    let _exit = ExitSignal(&shared);
    log::debug!("{} started", info.name);

    while let Some(job) = next_job(&shared) {
        let result = catch_unwind(AssertUnwindSafe(|| process(&shared, &info, job)));
        if let Err(panic) = result {
            log::error!("{}: request processing panicked: {}", info.name, panic_message(&*panic));
        }
    }

    log::debug!("{} exiting", info.name);
}

/// Block until a request is available or the pipeline stops running.
fn next_job(shared: &Shared) -> Option<QueuedRequest> {
    let mut dispatch = shared.dispatch.lock();
    loop {
        if dispatch.phase != Phase::Running {
            return None;
        }
        if let Some(job) = dispatch.queues.dequeue() {
            return Some(job);
        }
        shared.wake.wait(&mut dispatch);
    }
}

fn process(shared: &Shared, info: &WorkerInfo, job: QueuedRequest) {
    let Some(guard) = shared.registry.begin(&job.key, job.id) else {
        log::debug!("{} {}: entry gone before dispatch, skipping", job.id, job.key);
        return;
    };
    log::debug!("{}: {} {} ({:?})", info.name, job.id, job.key, job.priority);

    let resolved = {
        let _current = CurrentRequest::set(info, &job.key);
        resolve(shared, &job, guard)
    };

    match resolved {
        Resolved::Deliver(guard, fetched) => deliver(shared, guard, fetched),
        Resolved::Skipped(Some(entry), content_type) => {
            log::debug!("{} {}: HEAD says {content_type}, body skipped", job.id, job.key);
            entry.status.set(RequestStatus::Completed);
            let fetched = Fetched::Skipped(Some(content_type));
            notify(shared, &job.key, entry.waiters, &fetched);
        }
        Resolved::Skipped(None, _) => {
            log::debug!("{} {}: dropped by shutdown, outcome discarded", job.id, job.key);
        }
    }
}

/// What the transport produced, before any waiter's filter is applied.
#[derive(Debug)]
enum Fetched {
    Body(Payload),
    /// Body never downloaded; the HEAD request advertised this type.
    Skipped(Option<String>),
    Failed(FetchError),
}

impl Fetched {
    /// Gate the result against one waiter's filter.
    fn outcome_for(&self, accept: &AcceptFilter) -> FetchOutcome {
        match self {
            Fetched::Body(payload) if accept.accepts(payload.content_type.as_deref()) => {
                FetchOutcome::Success(payload.clone())
            }
            Fetched::Body(payload) => FetchOutcome::Filtered {
                content_type: payload.content_type.clone(),
            },
            Fetched::Skipped(content_type) => FetchOutcome::Filtered {
                content_type: content_type.clone(),
            },
            Fetched::Failed(err) => FetchOutcome::TransportError(err.clone()),
        }
    }
}

enum Resolved<'a> {
    Deliver(EntryGuard<'a>, Fetched),
    /// Nobody attached accepts the advertised type; the entry is already gone.
    Skipped(Option<InFlightEntry>, String),
}

/// Fetch one key: cache, optional HEAD check, then the body.
fn resolve<'a>(shared: &Shared, job: &QueuedRequest, mut guard: EntryGuard<'a>) -> Resolved<'a> {
    if let Some(payload) = shared.cache_get(&job.key) {
        shared.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
        return Resolved::Deliver(guard, Fetched::Body(payload));
    }

    let request = TransportRequest {
        url: job.key.as_str().to_string(),
        accept: job.accept.header_value().to_string(),
    };

    if shared.head_check {
        match contained(job, || shared.transport.head(&request, &shared.cancel)) {
            Ok(Some(content_type)) => match guard.finish_unless_accepted(&content_type) {
                Ok(entry) => return Resolved::Skipped(entry, content_type),
                Err(kept) => guard = kept,
            },
            Ok(None) => {}
            Err(err) => return Resolved::Deliver(guard, Fetched::Failed(err)),
        }
    }

    let fetched = match contained(job, || shared.transport.fetch(&request, &shared.cancel)) {
        Ok(response) => {
            let payload = Payload::new(response.status, response.content_type, response.body);
            shared.cache_put(&job.key, &payload);
            Fetched::Body(payload)
        }
        Err(err) => Fetched::Failed(err),
    };
    Resolved::Deliver(guard, fetched)
}

/// Run a transport call, turning a panic into [`FetchError::Panicked`].
fn contained<T>(
    job: &QueuedRequest,
    call: impl FnOnce() -> Result<T, FetchError>,
) -> Result<T, FetchError> {
    catch_unwind(AssertUnwindSafe(call)).unwrap_or_else(|panic| {
        let message = panic_message(&*panic);
        log::error!("{} {}: transport panicked: {message}", job.id, job.key);
        Err(FetchError::Panicked(message))
    })
}

/// Notify everyone attached to the entry, then release it.
///
/// Waiters are taken in batches while the key stays registered, so a
/// duplicate arriving while listeners run is served from this result. The
/// last batch is taken together with the removal.
fn deliver(shared: &Shared, guard: EntryGuard<'_>, fetched: Fetched) {
    let key = guard.key().clone();
    loop {
        match guard.take_waiters() {
            None => {
                log::debug!("{} {key}: dropped by shutdown, outcome discarded", guard.id());
                return;
            }
            Some(waiters) if waiters.is_empty() => break,
            Some(waiters) => {
                guard.status().set(RequestStatus::Completed);
                notify(shared, &key, waiters, &fetched);
            }
        }
    }

    if let Some(entry) = guard.finish() {
        notify(shared, &key, entry.waiters, &fetched);
    }
}

fn notify(shared: &Shared, key: &ResourceKey, waiters: Vec<Waiter>, fetched: &Fetched) {
    for waiter in waiters {
        let outcome = fetched.outcome_for(&waiter.accept);
        record(shared, key, waiter.id, &outcome);

        if let Some(listener) = &waiter.listener {
            let result = catch_unwind(AssertUnwindSafe(|| listener.on_outcome(key, &outcome)));
            if let Err(panic) = result {
                shared.stats.listener_panics.fetch_add(1, Ordering::Relaxed);
                log::error!("{} {key}: listener panicked: {}", waiter.id, panic_message(&*panic));
            }
        }

        // Receiver dropped = caller lost interest.
        let _ = waiter.completion.send(outcome);
    }
}

fn record(shared: &Shared, key: &ResourceKey, id: RequestId, outcome: &FetchOutcome) {
    match outcome {
        FetchOutcome::Success(payload) => {
            shared.stats.completed.fetch_add(1, Ordering::Relaxed);
            log::debug!("{id} {key}: {} bytes", payload.len());
        }
        FetchOutcome::Filtered { content_type } => {
            shared.stats.filtered.fetch_add(1, Ordering::Relaxed);
            log::warn!("{id} {key}: content type {content_type:?} rejected");
        }
        FetchOutcome::TransportError(err) => {
            shared.stats.failed.fetch_add(1, Ordering::Relaxed);
            log::error!("{id} {key}: {err}");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let caught = catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(&*caught), "boom");

        let caught = catch_unwind(|| panic!("{} {}", "formatted", 1)).unwrap_err();
        assert_eq!(panic_message(&*caught), "formatted 1");
    }

    #[test]
    fn test_worker_snapshot() {
        let info = WorkerInfo::new(1, "lumen-fetch-1".into());
        assert_eq!(info.current(), None);
        {
            let _current = CurrentRequest::set(&info, &ResourceKey::new("https://x/a"));
            assert_eq!(info.current(), Some(ResourceKey::new("https://x/a")));
        }
        let snapshot = info.snapshot();
        assert_eq!(snapshot.id, 1);
        assert_eq!(snapshot.name, "lumen-fetch-1");
        assert_eq!(snapshot.current, None);
        assert_eq!(snapshot.processed, 1);
    }
}
