//! # lumen-fetch: asynchronous resource fetching for Lumen
//!
//! A bounded pool of worker threads pulls pending requests from priority
//! and normal queues, keeps at most one outstanding fetch per resource key,
//! performs the fetch through a pluggable [`Transport`], and hands the
//! outcome to consumer listeners on the worker thread.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  request()   ┌──────────────┐  dequeue   ┌─────────────┐
//! │ Consumer    │ ───────────► │ Registry +   │ ─────────► │ Worker N    │
//! │ (Requester) │              │ Queues       │  (condvar) │ (thread)    │
//! └──────▲──────┘              └──────────────┘            └──────┬──────┘
//!        │                                                        │
//!        │       RequestHandle (oneshot)  ◄── FetchOutcome ◄──────┤
//!        └────── FetchListener::on_outcome (worker thread) ◄──────┘
//! ```
//!
//! ## Modules
//!
//! - [`request`]: keys, priorities, accept filters, request builder
//! - [`outcome`]: `FetchOutcome` and the `FetchListener` seam
//! - [`gate`]: image content-type allow-list
//! - [`queue`]: priority / normal dispatch queues
//! - [`registry`]: in-flight dedup with coalescing
//! - [`transport`]: `Transport` trait, `HttpTransport`, `MemoryTransport`
//! - [`worker`]: worker loop and observability
//! - [`pipeline`]: `FetchPipeline` (owner, lifecycle, stats)
//! - [`requester`]: `Requester` capability and `RequestHandle`

pub mod error;
pub mod gate;
pub mod outcome;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod request;
pub mod requester;
pub mod transport;
pub mod worker;

// Re-exports for convenience
pub use error::{FetchError, PipelineError};
pub use gate::{is_image_content_type, IMAGE_ACCEPT, IMAGE_CONTENT_TYPES};
pub use outcome::{FetchListener, FetchOutcome, Payload};
pub use pipeline::{FetchPipeline, PipelineConfig, PipelineStats};
pub use queue::DispatchQueues;
pub use registry::{InFlightRegistry, RequestStatus, StatusCell, Waiter};
pub use request::{AcceptFilter, FetchRequest, Priority, RequestId, ResourceKey};
pub use requester::{RequestHandle, Requester};
pub use transport::{
    CancelToken, HttpTransport, MemoryTransport, Transport, TransportRequest, TransportResponse,
};
pub use worker::WorkerSnapshot;
