//! Requester capability and request handles.
//!
//! Consumers depend on [`Requester`] rather than on the pipeline type, so
//! tests and alternative schedulers can stand in for it.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::outcome::{FetchListener, FetchOutcome};
use crate::registry::{RequestStatus, StatusCell};
use crate::request::{FetchRequest, Priority, RequestId, ResourceKey};

/// Capability surface exposed to consumers.
pub trait Requester: Send + Sync {
    /// Submit a request. Never blocks on the network.
    fn request(&self, request: FetchRequest) -> RequestHandle;

    /// Positional form: key, `Accept` value, priority, listener.
    fn request_url(
        &self,
        url: &str,
        accept: &str,
        priority: Priority,
        listener: Option<Arc<dyn FetchListener>>,
    ) -> RequestHandle {
        let mut request = FetchRequest::new(url).accept(accept).priority(priority);
        request.listener = listener;
        self.request(request)
    }
}

impl<T: Requester + ?Sized> Requester for Arc<T> {
    fn request(&self, request: FetchRequest) -> RequestHandle {
        (**self).request(request)
    }
}

/// Status and result of one submitted request.
///
/// The outcome arrives over a oneshot channel. A closed channel means the
/// request was dropped (pipeline shut down before it completed).
#[derive(Debug)]
pub struct RequestHandle {
    id: RequestId,
    key: ResourceKey,
    owner: Option<RequestId>,
    status: Arc<StatusCell>,
    rx: oneshot::Receiver<FetchOutcome>,
}

impl RequestHandle {
    /// Assemble a handle around an outcome channel and a shared status cell.
    pub fn new(
        id: RequestId,
        key: ResourceKey,
        owner: Option<RequestId>,
        status: Arc<StatusCell>,
        rx: oneshot::Receiver<FetchOutcome>,
    ) -> Self {
        Self {
            id,
            key,
            owner,
            status,
            rx,
        }
    }

    /// Handle whose outcome is already known.
    ///
    /// For [`Requester`] implementations that resolve synchronously.
    pub fn ready(id: RequestId, key: ResourceKey, outcome: FetchOutcome) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        Self {
            id,
            key,
            owner: None,
            status: Arc::new(StatusCell::new(RequestStatus::Completed)),
            rx,
        }
    }

    /// Handle for a request refused outright; its outcome channel is closed.
    pub fn rejected(id: RequestId, key: ResourceKey) -> Self {
        let (tx, rx) = oneshot::channel();
        drop(tx);
        Self {
            id,
            key,
            owner: None,
            status: Arc::new(StatusCell::new(RequestStatus::Dropped)),
            rx,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn status(&self) -> RequestStatus {
        self.status.get()
    }

    /// Whether this request was attached to an already outstanding fetch.
    pub fn is_coalesced(&self) -> bool {
        self.owner.is_some()
    }

    /// The request whose fetch this one shares, if coalesced.
    pub fn owner(&self) -> Option<RequestId> {
        self.owner
    }

    /// Non-blocking poll. `None` while pending or once the channel closed.
    pub fn try_outcome(&mut self) -> Option<FetchOutcome> {
        self.rx.try_recv().ok()
    }

    /// Block the current thread until the outcome arrives.
    ///
    /// Must not be called from inside an async runtime.
    pub fn wait(self) -> Option<FetchOutcome> {
        self.rx.blocking_recv().ok()
    }

    /// Await the outcome.
    pub async fn outcome(self) -> Option<FetchOutcome> {
        self.rx.await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_handle_is_closed() {
        let mut handle = RequestHandle::rejected(RequestId(7), ResourceKey::new("k"));
        assert_eq!(handle.status(), RequestStatus::Dropped);
        assert!(handle.try_outcome().is_none());
        assert!(!handle.is_coalesced());
        assert!(handle.wait().is_none());
    }

    #[test]
    fn test_handle_receives_outcome() {
        let (tx, rx) = oneshot::channel();
        let status = Arc::new(StatusCell::new(RequestStatus::Queued));
        let mut handle = RequestHandle::new(
            RequestId(1),
            ResourceKey::new("k"),
            Some(RequestId(0)),
            status.clone(),
            rx,
        );
        assert!(handle.try_outcome().is_none());
        assert!(handle.is_coalesced());
        assert_eq!(handle.owner(), Some(RequestId(0)));

        status.set(RequestStatus::Completed);
        tx.send(FetchOutcome::Filtered { content_type: None }).unwrap();
        assert_eq!(handle.status(), RequestStatus::Completed);
        assert_eq!(
            handle.try_outcome(),
            Some(FetchOutcome::Filtered { content_type: None })
        );
    }

    #[test]
    fn test_ready_handle() {
        let mut handle = RequestHandle::ready(
            RequestId(3),
            ResourceKey::new("k"),
            FetchOutcome::TransportError(crate::FetchError::Timeout),
        );
        assert_eq!(handle.status(), RequestStatus::Completed);
        assert!(handle.try_outcome().unwrap().error().is_some());
    }

    #[tokio::test]
    async fn test_handle_outcome_async() {
        let (tx, rx) = oneshot::channel();
        let status = Arc::new(StatusCell::new(RequestStatus::Queued));
        let handle = RequestHandle::new(RequestId(1), ResourceKey::new("k"), None, status, rx);
        tokio::spawn(async move {
            let _ = tx.send(FetchOutcome::Filtered { content_type: None });
        });
        assert!(handle.outcome().await.is_some());
    }
}
