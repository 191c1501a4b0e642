//! # lumen-render
//!
//! Turns fetched image payloads into GPU textures, built on `wgpu`.
//!
//! ## Architecture
//!
//! ```text
//!  PostGraphics (listing entry)
//!       │ request()                         worker thread
//!       ▼                                  ┌──────────────────────────┐
//!  ImageSlot ──► Requester (lumen-fetch) ──► SlotShared::on_outcome()  │
//!       ▲                                  │   gate → decode → buffer │
//!       │ upload()           DOWNLOADED    └────────────┬─────────────┘
//!       │ ◄─────────────────────────────────────────────┘
//!  TextureUploader (GPU thread) ──► GpuTexture
//! ```
//!
//! ## Crate modules
//!
//! - [`context`]: headless GPU device/queue initialisation
//! - [`decode`]: image payload → raw pixel buffer
//! - [`texture`]: pixel formats, the uploader seam, wgpu uploads
//! - [`slot`]: per-image request/decode/upload state machine
//! - [`post`]: listing metadata and per-post image slots

pub mod context;
pub mod decode;
pub mod post;
pub mod slot;
pub mod texture;

// Re-exports for convenience
pub use context::{GpuContext, GpuError};
pub use decode::{decode, ChannelPolicy, DecodeError, DecodedImage};
pub use post::{parse_listing, PostData, PostGraphics};
pub use slot::{ImageSlot, SlotFlags, SlotShared, SlotState};
pub use texture::{GpuTexture, PixelFormat, TextureDesc, TextureUploader, UploadError, WgpuUploader};
