//! Renderable geometry ranges
//!
//! A [`Span`] is the unit the pipeline draws: a range of a shared buffer
//! group rendered with one material. Spans are created at scene load and
//! owned by their drawable. During a frame the pipeline only writes the
//! transient annotations (selected lights, shadow bits); those are scratch
//! state and are overwritten every frame.

use super::bounds::AABB;
use super::vis_region::VisRegionMask;
use crate::foundation::collections::BitVector;
use crate::foundation::math::Mat4;
use crate::render::api::DrawCall;
use crate::render::lighting::LightId;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Render properties of a span
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct SpanProps: u32 {
        /// Rendered into shadow maps of lights that reach it
        const CASTS_SHADOW = 1 << 0;
        /// Never darkened by shadow projection
        const NO_SHADOW_RECEIVE = 1 << 1;
        /// Lit by runtime lights
        const RUNTIME_LIT = 1 << 2;
        /// Blended; drawn after opaque spans, back to front
        const PARTIAL_SORT = 1 << 3;
        /// Character geometry, eligible for character-only lights
        const CHARACTER = 1 << 4;
        /// Vertices are blended on the CPU before drawing
        const SKINNED = 1 << 5;
        /// Excluded from the visible list (debug hiding)
        const HIDDEN = 1 << 6;
    }
}

/// One light attached to a span for the current frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpanLight {
    /// Light
    pub light: LightId,
    /// Strength at the span's bounds center
    pub strength: f32,
    /// Fade scale applied to the light's color, in `[0, 1]`
    pub scale: f32,
}

/// A renderable geometry range
#[derive(Debug, Clone)]
pub struct Span {
    /// Index of the owning buffer group in the drawable
    pub buffer_group: usize,
    /// First vertex referenced
    pub vertex_start: u32,
    /// Number of vertices referenced
    pub vertex_count: u32,
    /// First index
    pub index_start: u32,
    /// Number of indices
    pub index_count: u32,
    /// Index of the material in the drawable
    pub material: usize,
    /// World-space bounds
    pub world_bounds: AABB,
    /// Local to world transform
    pub local_to_world: Mat4,
    /// Render properties
    pub props: SpanProps,
    /// Visibility regions the span belongs to
    pub vis_regions: VisRegionMask,
    /// Authored light group, always lit by these lights
    pub light_group: Vec<LightId>,

    /// Lights selected for this frame
    pub lights: Vec<SpanLight>,
    /// Projective lights selected for this frame
    pub projectors: Vec<SpanLight>,
    /// Shadow slaves projecting onto this span this frame
    pub shadow_bits: BitVector,
    /// Shadow slaves this span was rendered into this frame
    pub caster_bits: BitVector,
}

impl Span {
    /// Create a span covering an index range of a buffer group
    pub fn new(buffer_group: usize, material: usize, world_bounds: AABB) -> Self {
        Self {
            buffer_group,
            vertex_start: 0,
            vertex_count: 0,
            index_start: 0,
            index_count: 0,
            material,
            world_bounds,
            local_to_world: Mat4::identity(),
            props: SpanProps::RUNTIME_LIT,
            vis_regions: VisRegionMask::NONE,
            light_group: Vec::new(),
            lights: Vec::new(),
            projectors: Vec::new(),
            shadow_bits: BitVector::new(),
            caster_bits: BitVector::new(),
        }
    }

    /// Set the vertex range
    pub fn with_vertices(mut self, start: u32, count: u32) -> Self {
        self.vertex_start = start;
        self.vertex_count = count;
        self
    }

    /// Set the index range
    pub fn with_indices(mut self, start: u32, count: u32) -> Self {
        self.index_start = start;
        self.index_count = count;
        self
    }

    /// Replace the render properties
    pub fn with_props(mut self, props: SpanProps) -> Self {
        self.props = props;
        self
    }

    /// Set the visibility regions
    pub fn with_vis_regions(mut self, regions: VisRegionMask) -> Self {
        self.vis_regions = regions;
        self
    }

    /// Bind an authored light group
    pub fn with_light_group(mut self, lights: Vec<LightId>) -> Self {
        self.light_group = lights;
        self
    }

    /// Set the local to world transform
    pub fn with_transform(mut self, local_to_world: Mat4) -> Self {
        self.local_to_world = local_to_world;
        self
    }

    /// Check a render property
    pub fn has(&self, props: SpanProps) -> bool {
        self.props.contains(props)
    }

    /// Draw parameters for the span's ranges
    pub fn draw_call(&self) -> DrawCall {
        DrawCall {
            vertex_start: self.vertex_start,
            vertex_count: self.vertex_count,
            index_start: self.index_start,
            index_count: self.index_count,
        }
    }

    /// Drop every per-frame annotation
    pub fn clear_frame_state(&mut self) {
        self.lights.clear();
        self.projectors.clear();
        self.shadow_bits.clear();
        self.caster_bits.clear();
    }
}
