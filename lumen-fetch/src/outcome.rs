//! Fetch outcomes and the listener seam.
//!
//! Each registry entry resolves to exactly one [`FetchOutcome`]. The worker
//! that resolved it first runs every attached [`FetchListener`] on its own
//! thread, then sends a clone of the outcome to every waiting
//! [`crate::requester::RequestHandle`].
//!
//! ```text
//!  Worker ──► FetchOutcome ──┬──► listener.on_outcome()   (worker thread)
//!                            └──► oneshot ──► RequestHandle (any thread)
//! ```

use std::io::Cursor;
use std::sync::Arc;

use crate::error::FetchError;
use crate::request::ResourceKey;

/// A successfully transported response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub content_type: Option<String>,
    pub status: u16,
    pub bytes: Arc<Vec<u8>>,
}

impl Payload {
    pub fn new(status: u16, content_type: Option<String>, bytes: Vec<u8>) -> Self {
        Self {
            content_type,
            status,
            bytes: Arc::new(bytes),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Readable stream over the body.
    pub fn reader(&self) -> Cursor<&[u8]> {
        Cursor::new(self.bytes.as_slice())
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// The single result of a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Success(Payload),
    /// Transport succeeded but the content type failed the request's accept filter.
    Filtered { content_type: Option<String> },
    TransportError(FetchError),
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Self::Success(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&FetchError> {
        match self {
            Self::TransportError(err) => Some(err),
            _ => None,
        }
    }

    /// Short label used in log lines.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Filtered { .. } => "filtered",
            Self::TransportError(_) => "error",
        }
    }
}

/// Consumer hook run on the worker thread when an outcome is known.
///
/// Implementations may do CPU-heavy work here (image decode); the worker
/// is dedicated to this request until the call returns. A panic inside the
/// listener is caught and logged, it never takes the worker down.
pub trait FetchListener: Send + Sync {
    fn on_outcome(&self, key: &ResourceKey, outcome: &FetchOutcome);
}

impl<F> FetchListener for F
where
    F: Fn(&ResourceKey, &FetchOutcome) + Send + Sync,
{
    fn on_outcome(&self, key: &ResourceKey, outcome: &FetchOutcome) {
        self(key, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_payload_reader() {
        let payload = Payload::new(200, Some("image/png".into()), vec![1, 2, 3]);
        let mut out = Vec::new();
        payload.reader().read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![1, 2, 3]);
        assert_eq!(payload.len(), 3);
        assert!(!payload.is_empty());
    }

    #[test]
    fn test_payload_clone_shares_bytes() {
        let payload = Payload::new(200, None, vec![0; 64]);
        let copy = payload.clone();
        assert!(Arc::ptr_eq(&payload.bytes, &copy.bytes));
    }

    #[test]
    fn test_outcome_accessors() {
        let ok = FetchOutcome::Success(Payload::new(200, None, vec![]));
        assert!(ok.is_success());
        assert!(ok.payload().is_some());
        assert_eq!(ok.label(), "success");

        let err = FetchOutcome::TransportError(FetchError::Timeout);
        assert_eq!(err.error(), Some(&FetchError::Timeout));
        assert!(err.payload().is_none());

        let filtered = FetchOutcome::Filtered { content_type: Some("text/html".into()) };
        assert_eq!(filtered.label(), "filtered");
    }

    #[test]
    fn test_closure_listener() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let listener = move |_: &ResourceKey, _: &FetchOutcome| {
            counter.fetch_add(1, Ordering::SeqCst);
        };
        let key = ResourceKey::new("k");
        listener.on_outcome(&key, &FetchOutcome::Filtered { content_type: None });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
