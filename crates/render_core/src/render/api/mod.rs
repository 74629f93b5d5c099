//! Public backend API
//!
//! This module contains the contract between the pipeline and a graphics
//! backend: the device trait, its capability report and the value types that
//! cross the boundary.

pub mod caps;
pub mod device;

// Re-export commonly used types
pub use caps::{CapsFlags, DeviceCaps};
pub use device::{
    BackendHandle, DeviceError, DeviceFactory, DeviceResult, DeviceStatus, DrawCall,
    GeometryBinding, GpuLight, GpuLightKind, GraphicsDevice, MemoryPool, PresentResult,
    ResourceDesc, ResourceKind, ScreenQuad, TransformSlot,
};
