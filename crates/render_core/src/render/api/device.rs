//! Backend abstraction traits for the rendering pipeline
//!
//! This module defines the contract a graphics backend implements so the
//! pipeline can drive it. The contract is deliberately close to a
//! fixed-function device: explicit memory pools, explicit state changes and
//! a cooperative-level poll for device loss.

use crate::config::DisplayParams;
use crate::foundation::math::Mat4;
use crate::render::api::DeviceCaps;
use crate::render::state::{ColorWriteMask, StateChange};
use std::fmt;
use thiserror::Error;

/// Opaque backend resource handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendHandle(pub u64);

impl fmt::Display for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind of backend resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Vertex data
    VertexBuffer,
    /// Index data
    IndexBuffer,
    /// Sampled texture
    Texture,
    /// Offscreen color target, sampleable as a texture
    RenderTarget,
    /// Compiled shader program
    Shader,
}

/// Backend memory region a resource lives in
///
/// Unmanaged resources cannot be relocated by the backend and must all be
/// allocated before any managed resource is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryPool {
    /// Relocatable, evictable, restored by the backend
    Managed,
    /// Device-local, lost on reset
    Unmanaged,
}

/// Everything the backend needs to allocate a resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDesc {
    /// Resource kind
    pub kind: ResourceKind,
    /// Memory pool
    pub pool: MemoryPool,
    /// Size in bytes
    pub byte_size: u64,
    /// Texel dimensions for textures and render targets
    pub extent: Option<(u32, u32)>,
    /// Debug label
    pub label: String,
}

/// Result of polling the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Operational
    Ok,
    /// Lost and not yet resettable
    Lost,
    /// Lost and ready to be reset
    NotReset,
}

/// Result of presenting a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentResult {
    /// Frame reached the display
    Presented,
    /// The swap surfaced device loss
    DeviceLost,
}

/// Matrix slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformSlot {
    /// Local to world
    World,
    /// World to camera
    View,
    /// Camera to clip
    Projection,
    /// Texture coordinate transform of a stage
    Texture(u32),
}

/// Hardware light type
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GpuLightKind {
    /// Parallel rays
    Directional,
    /// Omni light
    Point,
    /// Cone light with inner/outer angles in radians
    Spot {
        /// Full-intensity cone
        inner: f32,
        /// Zero-intensity cone
        outer: f32,
    },
}

/// Light parameters as consumed by the backend
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpuLight {
    /// Light type
    pub kind: GpuLightKind,
    /// World position
    pub position: [f32; 3],
    /// World direction
    pub direction: [f32; 3],
    /// Diffuse color, already multiplied by intensity and fade scale
    pub color: [f32; 3],
    /// Constant, linear, quadratic attenuation
    pub attenuation: [f32; 3],
    /// Cutoff radius
    pub range: f32,
}

/// Vertex and index buffers bound for drawing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryBinding {
    /// Vertex buffer
    pub vertex_buffer: BackendHandle,
    /// Index buffer
    pub index_buffer: BackendHandle,
    /// Bytes per vertex
    pub stride: u32,
}

/// Indexed triangle list draw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawCall {
    /// First vertex referenced
    pub vertex_start: u32,
    /// Number of vertices referenced
    pub vertex_count: u32,
    /// First index
    pub index_start: u32,
    /// Number of indices
    pub index_count: u32,
}

/// Full-target quad draw used by post passes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenQuad {
    /// Texture sampled in stage 0
    pub texture: BackendHandle,
    /// Texture coordinate offset in texels
    pub texel_offset: [f32; 2],
    /// Constant color factor multiplied into the sample
    pub factor: [f32; 4],
}

/// Errors reported by a backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Allocation could not be satisfied
    #[error("out of device memory allocating {requested} bytes")]
    OutOfMemory {
        /// Bytes requested
        requested: u64,
    },

    /// The device is lost; the call had no effect
    #[error("device lost")]
    DeviceLost,

    /// Handle does not name a live resource
    #[error("invalid backend handle {0}")]
    InvalidHandle(BackendHandle),

    /// Requested operation or mode is not supported
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Any other backend failure
    #[error("backend failure: {0}")]
    Backend(String),
}

/// Result type for backend operations
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Graphics backend driven by the pipeline
///
/// All calls happen on the rendering thread; blocking calls are treated as
/// opaque synchronous operations.
pub trait GraphicsDevice {
    /// Limits and features
    fn caps(&self) -> &DeviceCaps;

    /// Poll for device loss
    fn test_cooperative_level(&mut self) -> DeviceStatus;

    /// Reset the device with new display parameters, invalidating every
    /// unmanaged resource
    fn reset(&mut self, params: &DisplayParams) -> DeviceResult<()>;

    /// Allocate a resource
    fn create_resource(&mut self, desc: &ResourceDesc) -> DeviceResult<BackendHandle>;

    /// Upload resource contents
    fn upload(&mut self, handle: BackendHandle, data: &[u8]) -> DeviceResult<()>;

    /// Free a resource
    fn destroy_resource(&mut self, handle: BackendHandle);

    /// Drop every managed resource from device memory; the backend restores
    /// them on next use
    fn evict_managed_resources(&mut self);

    /// Apply one state transition
    fn apply_state(&mut self, change: &StateChange);

    /// Bind a render target, `None` for the back buffer
    fn set_render_target(&mut self, target: Option<BackendHandle>);

    /// Clear the bound target
    fn clear(&mut self, color: [f32; 4], depth: Option<f32>, mask: ColorWriteMask);

    /// Load a matrix slot
    fn set_transform(&mut self, slot: TransformSlot, matrix: &Mat4);

    /// Load or clear a hardware light slot
    fn set_light(&mut self, slot: u32, light: Option<&GpuLight>);

    /// Bind a texture to a stage, `None` to unbind
    fn bind_texture(&mut self, stage: u32, texture: Option<BackendHandle>);

    /// Bind vertex and index buffers
    fn bind_geometry(&mut self, binding: &GeometryBinding);

    /// Draw indexed triangles
    fn draw_indexed(&mut self, call: &DrawCall) -> DeviceResult<()>;

    /// Draw a full-target quad
    fn draw_screen_quad(&mut self, quad: &ScreenQuad) -> DeviceResult<()>;

    /// Open a scene
    fn begin_scene(&mut self) -> DeviceResult<()>;

    /// Close a scene
    fn end_scene(&mut self);

    /// Flip the back buffer
    fn present(&mut self) -> PresentResult;
}

/// Creates the master device object
pub trait DeviceFactory {
    /// Device type produced
    type Device: GraphicsDevice;

    /// Create a device for the given display parameters
    fn create_device(&mut self, params: &DisplayParams) -> DeviceResult<Self::Device>;
}
