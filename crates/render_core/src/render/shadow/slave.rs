//! Frame-scoped shadow jobs and their light-space setup

use super::ShadowCaster;
use crate::foundation::math::{Mat4, Mat4Ext, Vec3};
use crate::render::lighting::{Light, LightId, LightKind};
use crate::render::resources::TargetLease;
use crate::scene::{SpanRef, AABB};

/// Progress of a slave through the frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveState {
    /// Accepted, target assigned, nothing rendered yet
    Submitted,
    /// Caster depth rendered into the target
    CasterRendered,
    /// Target blurred in place
    Blurred,
    /// Projected onto at least one receiver
    ReceiverProjected,
}

/// View and projection used to render a caster from its light
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightSpace {
    /// World to light view
    pub view: Mat4,
    /// Light view to clip
    pub projection: Mat4,
    /// Distance to the near plane along the view axis
    pub near: f32,
    /// Distance to the far plane along the view axis
    pub far: f32,
}

impl LightSpace {
    /// Fit a light space around `bounds`, extending `reach` past the caster
    /// so receivers behind it fall inside the depth range. `None` when the
    /// light sits inside the caster.
    pub fn for_caster(light: &Light, bounds: &AABB, reach: f32) -> Option<Self> {
        let center = bounds.center();
        let radius = bounds.radius().max(1.0e-3);

        match light.kind {
            LightKind::Directional => {
                let direction = light.direction.try_normalize(f32::EPSILON)?;
                let eye = center - direction * (radius * 2.0);
                let near = radius;
                let far = radius * 3.0 + reach;
                Some(Self {
                    view: Mat4::look_at(eye, center, Vec3::y()),
                    projection: Mat4::orthographic(radius, radius, near, far),
                    near,
                    far,
                })
            }
            LightKind::Point | LightKind::Spot { .. } => {
                let distance = (center - light.position).norm();
                if distance <= radius {
                    return None;
                }
                let fov = 2.0 * (radius / distance).asin();
                let near = distance - radius;
                let far = distance + radius + reach;
                Some(Self {
                    view: Mat4::look_at(light.position, center, Vec3::y()),
                    projection: Mat4::perspective(fov, 1.0, near, far),
                    near,
                    far,
                })
            }
        }
    }

    /// World to clip space of the shadow map
    pub fn world_to_clip(&self) -> Mat4 {
        self.projection * self.view
    }

    /// World to shadow map texture coordinates
    pub fn world_to_texture(&self) -> Mat4 {
        Mat4::clip_to_texture() * self.world_to_clip()
    }

    /// Direction shadows are cast in, in world space
    pub fn cast_direction(&self) -> Vec3 {
        // Third row of the view rotation is the negated forward axis
        -Vec3::new(self.view[(2, 0)], self.view[(2, 1)], self.view[(2, 2)])
    }
}

/// Texture transform mapping a view-space position to the depth ramp:
/// `u` runs from 0 at `near` to 1 at `far` along the view axis
pub fn depth_remap(near: f32, far: f32) -> Mat4 {
    let range = (far - near).max(f32::EPSILON);
    Mat4::new(
        0.0, 0.0, -1.0 / range, -near / range,
        0.0, 0.0, 0.0, 0.5,
        0.0, 0.0, 0.0, 0.0,
        0.0, 0.0, 0.0, 1.0,
    )
}

/// One (light, caster) shadow job, alive for a single frame
#[derive(Debug, Clone)]
pub struct ShadowSlave {
    /// Bit index in span shadow and caster bit vectors
    pub index: usize,
    /// Light the shadow is cast from
    pub light: LightId,
    /// Processing priority, lower first
    pub priority: i32,
    /// Blur radius in texels
    pub blur_scale: f32,
    /// The caster may receive its own shadow
    pub self_shadow: bool,
    /// Maximum darkening in `[0, 1]`
    pub intensity: f32,
    /// Light-space setup of the depth render
    pub space: LightSpace,
    /// Bounds of the caster geometry
    pub caster_bounds: AABB,
    /// Region the shadow can land in
    pub receiver_bounds: AABB,
    /// Pooled target holding the depth map
    pub target: TargetLease,
    /// Scratch light slot attenuating the projection
    pub scratch_light: u32,
    /// Progress through the frame
    pub state: SlaveState,
    pub(crate) caster: ShadowCaster,
}

impl ShadowSlave {
    /// Region swept by the caster bounds along the cast direction
    pub(crate) fn sweep(space: &LightSpace, caster_bounds: &AABB, reach: f32) -> AABB {
        let offset = space.cast_direction() * reach;
        let far = AABB::new(caster_bounds.min + offset, caster_bounds.max + offset);
        caster_bounds.union(&far)
    }

    /// Whether `bounds` can receive this shadow
    pub fn reaches(&self, bounds: &AABB) -> bool {
        self.receiver_bounds.intersects(bounds)
    }

    /// True when `span` was rendered into this slave's map
    pub fn is_caster(&self, span: &SpanRef) -> bool {
        self.caster.spans.iter().any(|caster| caster.source.as_ref() == Some(span))
    }
}
