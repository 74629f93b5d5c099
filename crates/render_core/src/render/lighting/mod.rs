//! Runtime lights
//!
//! Lights live in a [`LightSet`] arena and are addressed by generation
//! checked [`LightId`]s. Spans refer to lights only by id; the per-frame
//! relation in the other direction (light to affected spans) is owned by
//! the [`LightSelector`] and rebuilt every frame.
//!
//! # Strength
//!
//! Lights are ranked by [`Light::strength_at`], evaluated at a single point
//! (the center of a span's bounds). This is a deliberate approximation: a
//! light can rank as relevant while barely touching the visible surface.
//! The ranking only needs to be cheap and stable.

pub mod selector;

pub use selector::{LightSelection, LightSelector};

use crate::foundation::collections::{new_key_type, SlotMap};
use crate::foundation::math::{utils, Mat4, Vec3};
use crate::render::api::{GpuLight, GpuLightKind};
use crate::render::material::LayerTexture;
use crate::scene::{VisRegionMask, AABB};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

new_key_type! {
    /// Handle to a light in a [`LightSet`]
    pub struct LightId;
}

bitflags! {
    /// Light behavior flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct LightProps: u32 {
        /// Only lights spans flagged as characters
        const CHARACTER_ONLY = 1 << 0;
        /// Projector rendered once after every material pass instead of per pass
        const OVERALL = 1 << 1;
        /// Switched off; never selected
        const OFF = 1 << 2;
        /// Shadows may be submitted for this light
        const CASTS_SHADOWS = 1 << 3;
    }
}

/// Types of lights supported by the pipeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LightKind {
    /// Parallel rays, unbounded
    Directional,
    /// Omni light with a cutoff radius
    Point,
    /// Cone light; angles are half-angles in radians
    Spot {
        /// Full intensity inside this angle
        inner: f32,
        /// No light outside this angle
        outer: f32,
    },
}

/// Distance falloff `1 / (constant + linear * d + quadratic * d^2)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attenuation {
    /// Constant term
    pub constant: f32,
    /// Linear term
    pub linear: f32,
    /// Quadratic term
    pub quadratic: f32,
}

impl Default for Attenuation {
    fn default() -> Self {
        Self { constant: 1.0, linear: 0.0, quadratic: 0.0 }
    }
}

impl Attenuation {
    /// Falloff factor at distance `d`
    pub fn at(&self, d: f32) -> f32 {
        let denominator = self.constant + self.linear * d + self.quadratic * d * d;
        if denominator <= f32::EPSILON {
            1.0
        } else {
            (1.0 / denominator).min(1.0)
        }
    }
}

/// Texture projected by a light (a cookie)
#[derive(Debug, Clone)]
pub struct Projection {
    /// Projected texture
    pub texture: LayerTexture,
    /// World to projector texture space
    pub world_to_texture: Mat4,
}

/// A runtime light
#[derive(Debug, Clone)]
pub struct Light {
    /// Light type
    pub kind: LightKind,
    /// World position (ignored for directional lights)
    pub position: Vec3,
    /// Direction the light points in (ignored for point lights)
    pub direction: Vec3,
    /// Light color
    pub color: Vec3,
    /// Scalar multiplier on color
    pub intensity: f32,
    /// Distance falloff
    pub attenuation: Attenuation,
    /// Cutoff radius for point and spot lights
    pub range: f32,
    /// Behavior flags
    pub props: LightProps,
    /// Projected texture, making this a projective light
    pub projection: Option<Projection>,
    /// Visibility regions the light belongs to
    pub vis_regions: VisRegionMask,
}

impl Light {
    fn base(kind: LightKind, color: Vec3, intensity: f32) -> Self {
        Self {
            kind,
            position: Vec3::zeros(),
            direction: Vec3::new(0.0, -1.0, 0.0),
            color,
            intensity,
            attenuation: Attenuation::default(),
            range: f32::INFINITY,
            props: LightProps::empty(),
            projection: None,
            vis_regions: VisRegionMask::NONE,
        }
    }

    /// Create a directional light
    pub fn directional(direction: Vec3, color: Vec3, intensity: f32) -> Self {
        Self {
            direction: direction.normalize(),
            ..Self::base(LightKind::Directional, color, intensity)
        }
    }

    /// Create a point light with linear falloff to zero at `range`
    pub fn point(position: Vec3, color: Vec3, intensity: f32, range: f32) -> Self {
        Self {
            position,
            range,
            attenuation: Attenuation { constant: 1.0, linear: 1.0 / range.max(f32::EPSILON), quadratic: 0.0 },
            ..Self::base(LightKind::Point, color, intensity)
        }
    }

    /// Create a spot light
    pub fn spot(
        position: Vec3,
        direction: Vec3,
        color: Vec3,
        intensity: f32,
        range: f32,
        inner: f32,
        outer: f32,
    ) -> Self {
        Self {
            direction: direction.normalize(),
            kind: LightKind::Spot { inner, outer: outer.max(inner) },
            ..Self::point(position, color, intensity, range)
        }
    }

    /// Replace the behavior flags
    pub fn with_props(mut self, props: LightProps) -> Self {
        self.props = props;
        self
    }

    /// Replace the attenuation
    pub fn with_attenuation(mut self, attenuation: Attenuation) -> Self {
        self.attenuation = attenuation;
        self
    }

    /// Attach a projected texture
    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    /// Set the visibility regions
    pub fn with_vis_regions(mut self, regions: VisRegionMask) -> Self {
        self.vis_regions = regions;
        self
    }

    /// True when the light can be selected at all
    pub fn is_on(&self) -> bool {
        !self.props.contains(LightProps::OFF) && self.intensity > 0.0
    }

    /// True for textured projective lights
    pub fn is_projector(&self) -> bool {
        self.projection.is_some()
    }

    /// World bounds of the lit region, `None` when unbounded
    pub fn world_bounds(&self) -> Option<AABB> {
        match self.kind {
            LightKind::Directional => None,
            _ if !self.range.is_finite() => None,
            _ => Some(AABB::from_center_extents(
                self.position,
                Vec3::new(self.range, self.range, self.range),
            )),
        }
    }

    /// Whether the lit region overlaps `bounds`
    pub fn affects(&self, bounds: &AABB) -> bool {
        self.world_bounds().map_or(true, |lit| lit.intersects(bounds))
    }

    /// Scalar brightness of the light at `point`
    pub fn strength_at(&self, point: Vec3) -> f32 {
        let base = self.intensity * utils::luminance(&self.color);
        match self.kind {
            LightKind::Directional => base,
            LightKind::Point => self.falloff(point) * base,
            LightKind::Spot { inner, outer } => {
                let to_point = point - self.position;
                let distance = to_point.norm();
                let cone = if distance <= f32::EPSILON {
                    1.0
                } else {
                    let angle = (to_point / distance).dot(&self.direction).clamp(-1.0, 1.0).acos();
                    if angle <= inner {
                        1.0
                    } else if angle >= outer {
                        0.0
                    } else {
                        1.0 - (angle - inner) / (outer - inner)
                    }
                };
                self.falloff(point) * cone * base
            }
        }
    }

    fn falloff(&self, point: Vec3) -> f32 {
        let distance = (point - self.position).norm();
        if distance > self.range {
            0.0
        } else {
            self.attenuation.at(distance)
        }
    }

    /// Backend parameters with the color scaled by `scale`
    pub fn to_gpu(&self, scale: f32) -> GpuLight {
        let color = self.color * self.intensity * scale;
        GpuLight {
            kind: match self.kind {
                LightKind::Directional => GpuLightKind::Directional,
                LightKind::Point => GpuLightKind::Point,
                LightKind::Spot { inner, outer } => GpuLightKind::Spot { inner, outer },
            },
            position: self.position.into(),
            direction: self.direction.into(),
            color: color.into(),
            attenuation: [self.attenuation.constant, self.attenuation.linear, self.attenuation.quadratic],
            range: self.range,
        }
    }
}

/// Arena of every light in the scene
#[derive(Debug, Default)]
pub struct LightSet {
    lights: SlotMap<LightId, Light>,
}

impl LightSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a light
    pub fn insert(&mut self, light: Light) -> LightId {
        self.lights.insert(light)
    }

    /// Remove a light
    pub fn remove(&mut self, id: LightId) -> Option<Light> {
        self.lights.remove(id)
    }

    /// Look up a light
    pub fn get(&self, id: LightId) -> Option<&Light> {
        self.lights.get(id)
    }

    /// Look up a light for editing
    pub fn get_mut(&mut self, id: LightId) -> Option<&mut Light> {
        self.lights.get_mut(id)
    }

    /// Lights in a stable order
    pub fn iter(&self) -> impl Iterator<Item = (LightId, &Light)> {
        self.lights.iter()
    }

    /// Number of lights
    pub fn len(&self) -> usize {
        self.lights.len()
    }

    /// True when there are no lights
    pub fn is_empty(&self) -> bool {
        self.lights.is_empty()
    }
}
