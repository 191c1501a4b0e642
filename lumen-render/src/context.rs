//! GPU context: owns the `wgpu::Device` and `Queue` textures are created on.
//!
//! The viewer never presents, so only the headless path exists. Whichever
//! thread holds the context is the designated GPU thread: slots upload on
//! it and nowhere else.

use thiserror::Error;
use wgpu::{Adapter, Device, DeviceDescriptor, Instance, InstanceDescriptor, Queue, RequestAdapterOptions};

#[derive(Error, Debug)]
pub enum GpuError {
    #[error("No suitable GPU adapter found")]
    NoAdapter,
    #[error("Failed to request device: {0}")]
    RequestDevice(#[from] wgpu::RequestDeviceError),
}

/// Device, queue and the adapter they came from.
pub struct GpuContext {
    pub device: Device,
    pub queue: Queue,
    pub adapter: Adapter,
}

impl GpuContext {
    /// Create a context with no window or surface.
    pub async fn new_headless() -> Result<Self, GpuError> {
        let instance = Instance::new(&InstanceDescriptor::default());

        let adapter = instance
            .request_adapter(&RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::LowPower,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(GpuError::NoAdapter)?;

        let (device, queue) = adapter
            .request_device(
                &DeviceDescriptor {
                    label: Some("lumen-headless"),
                    ..Default::default()
                },
                None,
            )
            .await?;

        log::info!("GPU adapter: {}", adapter.get_info().name);
        Ok(Self {
            device,
            queue,
            adapter,
        })
    }

    /// Largest width or height a 2D texture may have on this device.
    pub fn max_texture_dimension(&self) -> u32 {
        self.device.limits().max_texture_dimension_2d
    }

    pub fn adapter_name(&self) -> String {
        self.adapter.get_info().name
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_limits() {
        let ctx = pollster::block_on(GpuContext::new_headless());
        // May fail in CI without a GPU; skip then.
        if let Ok(ctx) = ctx {
            assert!(ctx.max_texture_dimension() >= 2048);
        }
    }
}
