//! # Render Core
//!
//! The per-frame core of a real-time, multi-pass 3D rendering pipeline.
//!
//! ## Features
//!
//! - **Resource Cache**: Stable keys for backend resources, with unmanaged
//!   allocations ordered before managed ones and recovery after device loss
//! - **State Tracking**: Redundant backend state changes are filtered out
//! - **Material Passes**: Multi-layer materials packed into as few passes as
//!   the hardware's texture stages allow
//! - **Light Selection**: Per-span light ranking with fade-out, light groups,
//!   character lights and projective lights
//! - **Projected Shadows**: Pooled render targets, depth rendering, blur and
//!   projection onto receivers
//! - **Visibility**: Frustum and occluder culling over per-drawable trees
//! - **Headless Backend**: A recording device for tests and tooling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use render_core::prelude::*;
//! use render_core::render::backends::RecordingFactory;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut factory = RecordingFactory::new(DeviceCaps::default());
//!     let mut ctx = RenderContext::create(&mut factory, PipelineConfig::default())?;
//!     ctx.load_scene(&[])?;
//!
//!     if ctx.begin_frame() == FrameStatus::Ready {
//!         // pre_render, prep_for_render and render every drawable
//!         ctx.end_frame();
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::similar_names,
    clippy::too_many_arguments,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss
)]

pub mod config;
pub mod foundation;
pub mod render;
pub mod scene;
pub mod spatial;

/// Common imports for pipeline users
pub mod prelude {
    pub use crate::{
        config::{Config, DisplayParams, PipelineConfig},
        foundation::math::{Mat4, Mat4Ext, Vec3},
        render::{
            api::{DeviceCaps, GraphicsDevice},
            lighting::{Light, LightId, LightProps},
            material::{BlendFlags, Layer, Material, Texture},
            shadow::ShadowCaster,
            Camera, DeviceObserver, FrameStats, FrameStatus, RenderContext, RenderError, RenderPrim,
        },
        scene::{BufferGroup, Drawable, DrawableKey, Span, SpanCollection, SpanProps, VisRegionFilter, AABB},
    };
}
