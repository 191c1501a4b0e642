//! In-flight registry: at most one outstanding fetch per resource key.
//!
//! An entry is created when a request for a new key enters the pipeline
//! and lives until the worker that serviced it has produced the outcome.
//! A second request for a key that is already present is coalesced: its
//! [`Waiter`] is attached to the existing entry and shares its fetch. Each
//! waiter keeps its own accept filter, so the one response is gated per
//! waiter.
//!
//! Removal is tied to an [`EntryGuard`] held by the worker, so the key is
//! released on every exit path, including a panic inside the transport.
//! Listeners run while the key is still registered: waiters are taken in
//! batches and the entry is removed only once a batch comes back empty, so
//! a request arriving during a slow listener joins the same result instead
//! of starting a second fetch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::outcome::{FetchListener, FetchOutcome};
use crate::request::{AcceptFilter, RequestId, ResourceKey};

/// Lifecycle of a request as seen through its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestStatus {
    Queued = 0,
    InFlight = 1,
    Completed = 2,
    /// Discarded by shutdown (or rejected after it); no outcome will arrive.
    Dropped = 3,
}

/// Status shared by an entry and every handle attached to it.
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new(status: RequestStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub fn get(&self) -> RequestStatus {
        match self.0.load(Ordering::Acquire) {
            0 => RequestStatus::Queued,
            1 => RequestStatus::InFlight,
            2 => RequestStatus::Completed,
            _ => RequestStatus::Dropped,
        }
    }

    pub fn set(&self, status: RequestStatus) {
        self.0.store(status as u8, Ordering::Release);
    }
}

/// One request waiting on an entry.
pub struct Waiter {
    pub id: RequestId,
    pub accept: AcceptFilter,
    pub listener: Option<Arc<dyn FetchListener>>,
    pub completion: oneshot::Sender<FetchOutcome>,
}

impl Waiter {
    pub fn new(
        id: RequestId,
        accept: AcceptFilter,
        listener: Option<Arc<dyn FetchListener>>,
        completion: oneshot::Sender<FetchOutcome>,
    ) -> Self {
        Self {
            id,
            accept,
            listener,
            completion,
        }
    }
}

/// One outstanding fetch and everyone waiting on it.
pub struct InFlightEntry {
    pub id: RequestId,
    pub status: Arc<StatusCell>,
    pub waiters: Vec<Waiter>,
}

impl InFlightEntry {
    /// Number of requests still waiting on this entry.
    pub fn waiters(&self) -> usize {
        self.waiters.len()
    }

    /// Whether any waiter's filter admits `content_type`.
    pub fn accepted_by_any(&self, content_type: &str) -> bool {
        self.waiters
            .iter()
            .any(|w| w.accept.accepts(Some(content_type)))
    }
}

/// Result of [`InFlightRegistry::register_or_attach`].
#[derive(Debug, Clone)]
pub enum Registration {
    /// A new entry was created; the caller must enqueue the work item.
    New { status: Arc<StatusCell> },
    /// Attached to the entry owned by `owner`.
    Coalesced {
        owner: RequestId,
        status: Arc<StatusCell>,
    },
}

/// Concurrent key → entry map with insert-if-absent semantics.
#[derive(Default)]
pub struct InFlightRegistry {
    entries: Mutex<HashMap<ResourceKey, InFlightEntry>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an entry for `key` owned by `waiter`, or attach to the existing one.
    pub fn register_or_attach(&self, key: &ResourceKey, waiter: Waiter) -> Registration {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.waiters.push(waiter);
            return Registration::Coalesced {
                owner: entry.id,
                status: entry.status.clone(),
            };
        }

        let status = Arc::new(StatusCell::new(RequestStatus::Queued));
        entries.insert(
            key.clone(),
            InFlightEntry {
                id: waiter.id,
                status: status.clone(),
                waiters: vec![waiter],
            },
        );
        Registration::New { status }
    }

    /// Mark the entry owned by `id` as being serviced.
    ///
    /// Returns `None` when the entry is gone (drained by shutdown), in
    /// which case the worker must skip the request.
    pub fn begin(&self, key: &ResourceKey, id: RequestId) -> Option<EntryGuard<'_>> {
        let entries = self.entries.lock();
        let entry = entries.get(key).filter(|e| e.id == id)?;
        entry.status.set(RequestStatus::InFlight);
        Some(EntryGuard {
            registry: self,
            key: key.clone(),
            id,
            status: entry.status.clone(),
            armed: true,
        })
    }

    /// Remove the entry for `key` if it is still owned by `id`.
    fn remove_owned(&self, key: &ResourceKey, id: RequestId) -> Option<InFlightEntry> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.id == id => entries.remove(key),
            _ => None,
        }
    }

    /// Forcibly remove every entry without notifying anyone.
    ///
    /// Listeners and completion senders are dropped; handles observe a
    /// closed channel. Returns the number of entries removed.
    pub fn drain(&self) -> usize {
        let drained: Vec<InFlightEntry> = {
            let mut entries = self.entries.lock();
            entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &drained {
            entry.status.set(RequestStatus::Dropped);
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn keys(&self) -> Vec<ResourceKey> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Number of requests waiting on `key`, if registered.
    pub fn waiters(&self, key: &ResourceKey) -> Option<usize> {
        self.entries.lock().get(key).map(InFlightEntry::waiters)
    }
}

/// Owns the right to remove one registry entry.
///
/// Dropping an armed guard removes the entry, dropping its waiters
/// unnotified. [`EntryGuard::take_waiters`] hands out waiters while the key
/// stays registered; [`EntryGuard::finish`] removes the entry and hands back
/// whoever attached last.
pub struct EntryGuard<'a> {
    registry: &'a InFlightRegistry,
    key: ResourceKey,
    id: RequestId,
    status: Arc<StatusCell>,
    armed: bool,
}

impl<'a> EntryGuard<'a> {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn status(&self) -> &StatusCell {
        &self.status
    }

    /// Take the current waiters, leaving the entry registered.
    ///
    /// `None` if shutdown drained the entry.
    pub fn take_waiters(&self) -> Option<Vec<Waiter>> {
        let mut entries = self.registry.entries.lock();
        match entries.get_mut(&self.key) {
            Some(entry) if entry.id == self.id => Some(std::mem::take(&mut entry.waiters)),
            _ => None,
        }
    }

    /// Remove the entry and take its waiters. `None` if shutdown drained it first.
    pub fn finish(mut self) -> Option<InFlightEntry> {
        self.armed = false;
        self.registry.remove_owned(&self.key, self.id)
    }

    /// Remove the entry unless some waiter accepts `content_type`.
    ///
    /// The check and the removal happen under one lock, so nobody can attach
    /// in between. `Err` hands the guard back: the body is wanted after all.
    pub fn finish_unless_accepted(
        mut self,
        content_type: &str,
    ) -> Result<Option<InFlightEntry>, Self> {
        let wanted = {
            let mut entries = self.registry.entries.lock();
            match entries.get(&self.key) {
                Some(entry) if entry.id == self.id => {
                    if entry.accepted_by_any(content_type) {
                        true
                    } else {
                        self.armed = false;
                        return Ok(entries.remove(&self.key));
                    }
                }
                _ => false,
            }
        };
        if wanted {
            Err(self)
        } else {
            self.armed = false;
            Ok(None)
        }
    }
}

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Some(entry) = self.registry.remove_owned(&self.key, self.id) {
                entry.status.set(RequestStatus::Dropped);
                log::warn!("{} {}: released without an outcome", self.id, self.key);
            }
        }
    }
}
