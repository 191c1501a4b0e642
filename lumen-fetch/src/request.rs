//! Fetch request value types.
//!
//! A [`FetchRequest`] describes one resource to retrieve: the key (URL),
//! the media types the caller is willing to accept, its dispatch priority
//! and an optional [`FetchListener`] run on the worker thread once the
//! outcome is known.

use std::fmt;
use std::sync::Arc;

use crate::gate::media_type;
use crate::outcome::FetchListener;

/// Opaque resource identifier (the URL). Immutable and cheap to clone.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(Arc<str>);

impl ResourceKey {
    pub fn new(url: impl AsRef<str>) -> Self {
        Self(Arc::from(url.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceKey {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

impl From<String> for ResourceKey {
    fn from(url: String) -> Self {
        Self(Arc::from(url))
    }
}

/// Dispatch priority. `High` requests are always drained before `Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Priority {
    High,
    #[default]
    Normal,
}

impl Priority {
    pub fn from_flag(prioritized: bool) -> Self {
        if prioritized {
            Self::High
        } else {
            Self::Normal
        }
    }
}

/// Identifier assigned to a request when it enters a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Ordered set of acceptable media types, parsed from an `Accept` value.
///
/// The original header text is kept so it can be sent verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AcceptFilter {
    header: String,
    media_types: Vec<String>,
}

impl AcceptFilter {
    /// Parse a comma separated `Accept` value. `;q=` weights are ignored.
    pub fn parse(header: impl Into<String>) -> Self {
        let header = header.into();
        let mut media_types: Vec<String> = Vec::new();
        for entry in header.split(',') {
            let media = media_type(entry);
            if !media.is_empty() && !media_types.contains(&media) {
                media_types.push(media);
            }
        }
        Self { header, media_types }
    }

    /// A filter that accepts every content type.
    pub fn any() -> Self {
        Self::default()
    }

    /// Value sent as the outbound `Accept` header.
    pub fn header_value(&self) -> &str {
        &self.header
    }

    pub fn media_types(&self) -> &[String] {
        &self.media_types
    }

    /// Whether a response with `content_type` satisfies this filter.
    ///
    /// An empty filter accepts anything, including a missing content type.
    /// `*/*` and `type/*` wildcards are honoured.
    pub fn accepts(&self, content_type: Option<&str>) -> bool {
        if self.media_types.is_empty() {
            return true;
        }
        let Some(content_type) = content_type else {
            return false;
        };
        let media = media_type(content_type);
        self.media_types.iter().any(|allowed| {
            if allowed == "*/*" {
                return true;
            }
            match allowed.strip_suffix("/*") {
                Some(top) => media
                    .split_once('/')
                    .is_some_and(|(ty, _)| ty == top),
                None => *allowed == media,
            }
        })
    }
}

/// A request submitted through [`crate::requester::Requester::request`].
#[derive(Clone)]
pub struct FetchRequest {
    pub key: ResourceKey,
    pub accept: AcceptFilter,
    pub priority: Priority,
    pub listener: Option<Arc<dyn FetchListener>>,
}

impl FetchRequest {
    pub fn new(url: impl Into<ResourceKey>) -> Self {
        Self {
            key: url.into(),
            accept: AcceptFilter::any(),
            priority: Priority::Normal,
            listener: None,
        }
    }

    pub fn accept(mut self, header: impl Into<String>) -> Self {
        self.accept = AcceptFilter::parse(header);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn prioritized(self) -> Self {
        self.priority(Priority::High)
    }

    pub fn listener(mut self, listener: Arc<dyn FetchListener>) -> Self {
        self.listener = Some(listener);
        self
    }
}

impl fmt::Debug for FetchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchRequest")
            .field("key", &self.key)
            .field("accept", &self.accept.header_value())
            .field("priority", &self.priority)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}
