//! Per-resource state machine: request, decode, upload.
//!
//! ```text
//! Idle ──request()──► Requested ──decode ok──► Downloaded ──upload ok──► Loaded
//!                         │                        │
//!                         └── filtered / error ────┴── upload fail ──► Faulted
//! ```
//!
//! Flags are set-only. Once `LOADED` or `FAULTED` is set nothing else
//! changes, and there is no retry from `Faulted`.
//!
//! Two threads touch a slot. A fetch worker runs [`SlotShared::on_outcome`],
//! decodes and then publishes `DOWNLOADED`. The GPU thread owns the
//! [`ImageSlot`] and calls [`ImageSlot::upload`], which does nothing until
//! it observes `DOWNLOADED`.

use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use log::{debug, error, warn};
use lumen_fetch::{
    is_image_content_type, FetchListener, FetchOutcome, FetchRequest, Payload, Priority,
    RequestId, RequestStatus, Requester, ResourceKey, IMAGE_ACCEPT,
};
use parking_lot::Mutex;

use crate::decode::{self, ChannelPolicy, DecodedImage};
use crate::texture::{PixelFormat, TextureDesc, TextureUploader, UploadError};

/// Set-only flag word for one slot.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct SlotFlags(u8);

impl SlotFlags {
    pub const REQUESTED: Self = Self(1 << 0);
    pub const DOWNLOADED: Self = Self(1 << 1);
    pub const LOADED: Self = Self(1 << 2);
    pub const FAULTED: Self = Self(1 << 3);

    const TERMINAL: u8 = Self::LOADED.0 | Self::FAULTED.0;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn is_terminal(self) -> bool {
        self.0 & Self::TERMINAL != 0
    }
}

impl BitOr for SlotFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for SlotFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::REQUESTED, "REQUESTED"),
            (Self::DOWNLOADED, "DOWNLOADED"),
            (Self::LOADED, "LOADED"),
            (Self::FAULTED, "FAULTED"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            f.write_str("SlotFlags(empty)")
        } else {
            write!(f, "SlotFlags({})", set.join(" | "))
        }
    }
}

/// Derived view of a slot's flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SlotState {
    /// The owning entity has no such resource.
    Ineligible,
    Idle,
    Requested,
    Downloaded,
    Loaded,
    Faulted,
}

impl SlotState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SlotState::Loaded | SlotState::Faulted | SlotState::Ineligible
        )
    }
}

/// The half of a slot that fetch workers see.
pub struct SlotShared {
    label: String,
    policy: ChannelPolicy,
    flags: AtomicU8,
    buffer: Mutex<Option<DecodedImage>>,
    fault: Mutex<Option<String>>,
}

impl SlotShared {
    fn new(label: String, policy: ChannelPolicy) -> Self {
        Self {
            label,
            policy,
            flags: AtomicU8::new(0),
            buffer: Mutex::new(None),
            fault: Mutex::new(None),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn flags(&self) -> SlotFlags {
        SlotFlags(self.flags.load(Ordering::Acquire))
    }

    /// Why the slot faulted, if it did.
    pub fn fault_reason(&self) -> Option<String> {
        self.fault.lock().clone()
    }

    pub fn has_buffer(&self) -> bool {
        self.buffer.lock().is_some()
    }

    /// OR `flag` in unless the slot is already terminal.
    fn raise(&self, flag: SlotFlags) -> bool {
        self.flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                if bits & SlotFlags::TERMINAL != 0 {
                    None
                } else {
                    Some(bits | flag.0)
                }
            })
            .is_ok()
    }

    fn mark_faulted(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.raise(SlotFlags::FAULTED) {
            warn!("{}: faulted: {}", self.label, reason);
            *self.fault.lock() = Some(reason);
        }
        self.buffer.lock().take();
    }

    fn take_buffer(&self) -> Option<DecodedImage> {
        self.buffer.lock().take()
    }

    fn accept_payload(&self, key: &ResourceKey, payload: &Payload) {
        let content_type = payload.content_type.as_deref();
        if !content_type.is_some_and(is_image_content_type) {
            self.mark_faulted(format!(
                "{key}: content type {:?} is not a supported image",
                content_type.unwrap_or("<none>")
            ));
            return;
        }

        match decode::decode(payload.bytes(), content_type, self.policy) {
            Ok(image) => {
                debug!("{}: decoded {:?} from {}", self.label, image, key);
                // Buffer first, flag second: upload gates on the flag.
                *self.buffer.lock() = Some(image);
                if !self.raise(SlotFlags::DOWNLOADED) {
                    self.buffer.lock().take();
                }
            }
            Err(err) => self.mark_faulted(format!("{key}: {err}")),
        }
    }
}

impl FetchListener for SlotShared {
    fn on_outcome(&self, key: &ResourceKey, outcome: &FetchOutcome) {
        if self.flags().is_terminal() {
            return;
        }
        match outcome {
            FetchOutcome::Success(payload) => self.accept_payload(key, payload),
            FetchOutcome::Filtered { content_type } => self.mark_faulted(format!(
                "{key}: filtered content type {:?}",
                content_type.as_deref().unwrap_or("<none>")
            )),
            FetchOutcome::TransportError(err) => {
                error!("{}: fetch of {} failed: {}", self.label, key, err);
                self.mark_faulted(format!("{key}: {err}"));
            }
        }
    }
}

impl fmt::Debug for SlotShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotShared")
            .field("label", &self.label)
            .field("policy", &self.policy)
            .field("flags", &self.flags())
            .finish()
    }
}

/// One independently tracked image of an entity.
///
/// Owned by the GPU thread. `T` is the uploader's texture type.
pub struct ImageSlot<T> {
    source: Option<ResourceKey>,
    accept: String,
    priority: Priority,
    shared: Arc<SlotShared>,
    texture: Option<T>,
    request_id: Option<RequestId>,
}

impl<T> ImageSlot<T> {
    /// A slot for `source`, or an ineligible one when `source` is `None`.
    pub fn new(
        label: impl Into<String>,
        source: Option<ResourceKey>,
        priority: Priority,
        policy: ChannelPolicy,
    ) -> Self {
        Self {
            source,
            accept: IMAGE_ACCEPT.to_string(),
            priority,
            shared: Arc::new(SlotShared::new(label.into(), policy)),
            texture: None,
            request_id: None,
        }
    }

    /// Override the `Accept` value sent with the request.
    pub fn with_accept(mut self, accept: impl Into<String>) -> Self {
        self.accept = accept.into();
        self
    }

    pub fn source(&self) -> Option<&ResourceKey> {
        self.source.as_ref()
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn is_eligible(&self) -> bool {
        self.source.is_some()
    }

    pub fn flags(&self) -> SlotFlags {
        self.shared.flags()
    }

    pub fn shared(&self) -> &Arc<SlotShared> {
        &self.shared
    }

    pub fn request_id(&self) -> Option<RequestId> {
        self.request_id
    }

    pub fn state(&self) -> SlotState {
        if self.source.is_none() {
            return SlotState::Ineligible;
        }
        let flags = self.flags();
        if flags.contains(SlotFlags::FAULTED) {
            SlotState::Faulted
        } else if flags.contains(SlotFlags::LOADED) {
            SlotState::Loaded
        } else if flags.contains(SlotFlags::DOWNLOADED) {
            SlotState::Downloaded
        } else if flags.contains(SlotFlags::REQUESTED) {
            SlotState::Requested
        } else {
            SlotState::Idle
        }
    }

    pub fn is_requested(&self) -> bool {
        self.flags().contains(SlotFlags::REQUESTED)
    }

    pub fn is_downloaded(&self) -> bool {
        self.flags().contains(SlotFlags::DOWNLOADED)
    }

    pub fn is_loaded(&self) -> bool {
        self.flags().contains(SlotFlags::LOADED)
    }

    pub fn is_faulted(&self) -> bool {
        self.flags().contains(SlotFlags::FAULTED)
    }

    pub fn fault_reason(&self) -> Option<String> {
        self.shared.fault_reason()
    }

    pub fn texture(&self) -> Option<&T> {
        self.texture.as_ref()
    }

    /// Issue the fetch. Returns whether a request went out.
    ///
    /// No-op for ineligible slots, for slots that already left `Idle`, and
    /// for slots that already hold a texture.
    pub fn request(&mut self, requester: &dyn Requester) -> bool {
        let Some(source) = self.source.clone() else {
            return false;
        };
        if self.texture.is_some() || !self.flags().is_empty() {
            return false;
        }
        if !self.shared.raise(SlotFlags::REQUESTED) {
            return false;
        }

        let request = FetchRequest::new(source)
            .accept(self.accept.clone())
            .priority(self.priority)
            .listener(self.shared.clone());
        let handle = requester.request(request);
        debug!(
            "{}: requested {} as {} ({:?})",
            self.shared.label,
            handle.key(),
            handle.id(),
            self.priority
        );
        self.request_id = Some(handle.id());

        // Nothing will ever call back for a refused request.
        if handle.status() == RequestStatus::Dropped {
            self.shared.mark_faulted(format!("{}: request refused", handle.key()));
        }
        true
    }

    /// Request on first access, then hand out the texture once loaded.
    pub fn texture_or_request(&mut self, requester: &dyn Requester) -> Option<&T> {
        self.request(requester);
        self.texture.as_ref()
    }

    /// Move a decoded buffer to the GPU. Call only on the GPU thread.
    ///
    /// No-op unless the slot is `Downloaded`, not faulted, has no texture
    /// yet and still holds a buffer. The buffer is released whatever the
    /// result.
    pub fn upload<U>(&mut self, uploader: &U) -> SlotState
    where
        U: TextureUploader<Texture = T> + ?Sized,
    {
        let flags = self.flags();
        if !flags.contains(SlotFlags::DOWNLOADED) || flags.is_terminal() || self.texture.is_some() {
            return self.state();
        }
        let Some(image) = self.shared.take_buffer() else {
            return self.state();
        };

        match self.create_texture(uploader, &image) {
            Ok(texture) => {
                self.texture = Some(texture);
                self.shared.raise(SlotFlags::LOADED);
                debug!(
                    "{}: uploaded {}x{} texture",
                    self.shared.label, image.width, image.height
                );
            }
            Err(err) => self.shared.mark_faulted(err.to_string()),
        }
        drop(image);
        self.state()
    }

    fn create_texture<U>(&self, uploader: &U, image: &DecodedImage) -> Result<T, UploadError>
    where
        U: TextureUploader<Texture = T> + ?Sized,
    {
        if !image.is_valid() {
            return Err(UploadError::InvalidBuffer(format!("{image:?}")));
        }
        let format = PixelFormat::from_channels(image.channels)?;
        let desc = TextureDesc {
            label: &self.shared.label,
            width: image.width,
            height: image.height,
            format,
        };
        uploader.create_texture(&desc, &image.pixels)
    }
}

impl<T> fmt::Debug for ImageSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageSlot")
            .field("label", &self.shared.label)
            .field("source", &self.source)
            .field("state", &self.state())
            .field("has_texture", &self.texture.is_some())
            .finish()
    }
}

// ===================================================================
// Tests
// ===================================================================
