//! # Rendering Pipeline
//!
//! The per-frame core of a multi-pass, fixed-function style renderer. It sits
//! between scene storage (which decides *what* exists) and a graphics backend
//! (which rasterizes), and decides *how* every visible span is drawn.
//!
//! ## Architecture
//!
//! - **Backend contract**: [`api::GraphicsDevice`] with explicit memory pools
//!   and device-loss polling; [`backends::RecordingDevice`] runs headless
//! - **Resources**: [`resources::DeviceResourceCache`] maps stable keys to
//!   backend handles and survives device resets
//! - **State**: [`state::StateTracker`] drops redundant state changes
//! - **Materials**: [`material::MaterialCompositor`] packs layers into passes
//! - **Lighting**: [`lighting::LightSelector`] picks the lights for each span
//! - **Shadows**: [`shadow::ShadowSubsystem`] renders and projects shadow maps
//! - **Frame**: [`frame::RenderContext`] owns all of the above and drives the
//!   frame protocol
//!
//! ## Error Handling
//!
//! Nothing below the frame level panics. Allocation failures skip the
//! affected span or shadow, compositor aborts skip the span, and device loss
//! turns every draw into a no-op until `begin_frame` resets the device.

pub mod api;
pub mod backends;
pub mod frame;
pub mod lighting;
pub mod material;
pub mod prim;
pub mod resources;
pub mod shadow;
pub mod skinning;
pub mod state;

#[cfg(test)]
mod scenario_tests;

pub use api::{DeviceCaps, DeviceError, GraphicsDevice};
pub use frame::{Camera, DeviceObserver, FrameStats, FrameStatus, RenderContext};
pub use lighting::{Light, LightId};
pub use material::{Layer, Material, Texture};
pub use prim::RenderPrim;
pub use resources::{DeviceResourceCache, ResourceError, ResourceId};
pub use shadow::ShadowCaster;

use thiserror::Error;

/// High-level rendering error types
///
/// Most failures inside a frame are absorbed and logged. The ones that reach
/// callers are listed here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// No device could be created, not even in reduced mode
    #[error("Renderer initialization failed: {0}")]
    InitializationFailed(String),

    /// An operation was called at the wrong point of the frame protocol
    #[error("Rendering failed: {0}")]
    RenderingFailed(String),

    /// A device resource could not be created
    #[error("Resource creation failed: {0}")]
    ResourceCreationFailed(String),

    /// Backend-specific error
    #[error("Backend error: {0}")]
    BackendError(String),

    /// The device was lost; rendering resumes after a successful `begin_frame`
    #[error("Device lost")]
    DeviceLost,
}

impl From<DeviceError> for RenderError {
    fn from(error: DeviceError) -> Self {
        match error {
            DeviceError::DeviceLost => Self::DeviceLost,
            other => Self::BackendError(other.to_string()),
        }
    }
}

impl From<ResourceError> for RenderError {
    fn from(error: ResourceError) -> Self {
        match error {
            ResourceError::DeviceLost => Self::DeviceLost,
            other => Self::ResourceCreationFailed(other.to_string()),
        }
    }
}

/// Result type for rendering operations
pub type RenderResult<T> = Result<T, RenderError>;
