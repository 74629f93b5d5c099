//! Projected shadow maps
//!
//! Shadows are submitted as [`ShadowCaster`] requests before a frame starts.
//! Inside `BeginFrame` each accepted request becomes a [`ShadowSlave`]: it
//! checks out a pooled render target, renders its caster's depth from the
//! light into it, optionally blurs it, and is then projected onto every
//! receiving span as a darkening decal pass. Slaves are destroyed in
//! `EndFrame`; nothing about a shadow survives into the next frame.

pub mod slave;
pub mod subsystem;

pub use slave::{depth_remap, LightSpace, ShadowSlave, SlaveState};
pub use subsystem::{ShadowStats, ShadowSubsystem};

use crate::render::api::DrawCall;
use crate::render::lighting::LightId;
use crate::scene::{BufferGroup, Drawable, SpanProps, SpanRef, AABB};
use crate::foundation::math::Mat4;
use std::sync::Arc;

/// One piece of caster geometry
#[derive(Debug, Clone)]
pub struct CasterSpan {
    /// Geometry the range indexes into
    pub group: Arc<BufferGroup>,
    /// Ranges to draw
    pub draw: DrawCall,
    /// Local to world transform
    pub local_to_world: Mat4,
    /// World bounds of the range
    pub world_bounds: AABB,
    /// The scene span this geometry came from, used to exclude self-shadowing
    pub source: Option<SpanRef>,
}

/// A request to cast a shadow from one light this frame
#[derive(Debug, Clone)]
pub struct ShadowCaster {
    /// Light the shadow is cast from
    pub light: LightId,
    /// Caster geometry
    pub spans: Vec<CasterSpan>,
    /// Lower values are processed first
    pub priority: i32,
    /// Blur radius in texels, zero for a hard shadow
    pub blur_scale: f32,
    /// Allow the caster to shadow itself
    pub self_shadow: bool,
    /// Requested map edge, the configured default when `None`
    pub map_size: Option<u32>,
}

impl ShadowCaster {
    /// Empty request for `light`
    pub fn new(light: LightId) -> Self {
        Self {
            light,
            spans: Vec::new(),
            priority: 0,
            blur_scale: 0.0,
            self_shadow: false,
            map_size: None,
        }
    }

    /// Request covering every shadow-casting span of a drawable
    pub fn from_drawable(light: LightId, drawable: &dyn Drawable) -> Self {
        let key = drawable.key();
        let spans = drawable
            .spans()
            .iter()
            .enumerate()
            .filter(|(_, span)| span.has(SpanProps::CASTS_SHADOW) && !span.has(SpanProps::HIDDEN))
            .filter_map(|(index, span)| {
                Some(CasterSpan {
                    group: Arc::clone(drawable.buffer_group(span.buffer_group)?),
                    draw: span.draw_call(),
                    local_to_world: span.local_to_world,
                    world_bounds: span.world_bounds,
                    source: Some(SpanRef { drawable: key, span: index }),
                })
            })
            .collect();
        Self { spans, ..Self::new(light) }
    }

    /// Add a piece of caster geometry
    pub fn with_span(mut self, span: CasterSpan) -> Self {
        self.spans.push(span);
        self
    }

    /// Lower values are processed first
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Blur the map by `blur_scale` texels
    pub fn with_blur(mut self, blur_scale: f32) -> Self {
        self.blur_scale = blur_scale;
        self
    }

    /// Let the caster receive its own shadow at reduced intensity
    pub fn with_self_shadow(mut self) -> Self {
        self.self_shadow = true;
        self
    }

    /// Request a map edge length
    pub fn with_map_size(mut self, size: u32) -> Self {
        self.map_size = Some(size);
        self
    }

    /// Union of the caster geometry bounds
    pub fn bounds(&self) -> Option<AABB> {
        self.spans
            .iter()
            .map(|span| span.world_bounds)
            .reduce(|a, b| a.union(&b))
    }
}
