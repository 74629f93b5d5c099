//! CPU vertex blending for hardware without skinning support
//!
//! Skinned buffer groups keep their bind-pose vertices on the CPU. Once per
//! drawable per frame, immediately before its geometry is submitted, the
//! [`Skinner`] blends every skinned vertex by up to four bone matrices and
//! rewrites the group's dynamic vertex buffer. A second request for the
//! same drawable in the same frame is a no-op.

use crate::foundation::math::{Mat4, Vec3, Vec4};
use crate::foundation::time::FrameStamp;
use crate::render::api::GraphicsDevice;
use crate::render::resources::{DeviceResourceCache, ResourceError};
use crate::scene::{BufferGroup, Drawable, DrawableKey, SkinWeights, Vertex};
use std::collections::HashMap;
use thiserror::Error;

/// Software skinning failures
#[derive(Error, Debug)]
pub enum SkinningError {
    /// A skinned group carries no weights
    #[error("Buffer group '{0}' has no skin weights")]
    MissingWeights(String),

    /// A vertex names a bone past the end of the palette
    #[error("Buffer group '{group}' references bone {bone} but the palette has {palette} bones")]
    BoneOutOfRange {
        /// Buffer group label
        group: String,
        /// Bone index found in the weights
        bone: u32,
        /// Palette length
        palette: usize,
    },

    /// Writing the blended vertices failed
    #[error("Skinned vertex upload failed: {0}")]
    Upload(#[from] ResourceError),
}

/// Blends skinned buffer groups on the CPU, at most once per drawable per frame
#[derive(Debug, Default)]
pub struct Skinner {
    last_skinned: HashMap<DrawableKey, FrameStamp>,
    scratch: Vec<Vertex>,
    vertices_blended: u64,
}

impl Skinner {
    /// Create a skinner with no history
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `drawable` was already skinned in `frame`
    pub fn is_current(&self, drawable: DrawableKey, frame: FrameStamp) -> bool {
        self.last_skinned.get(&drawable) == Some(&frame)
    }

    /// Vertices blended since creation
    pub fn vertices_blended(&self) -> u64 {
        self.vertices_blended
    }

    /// Blend and upload every skinned group of `drawable`. Returns `false`
    /// when there was nothing to do this frame.
    pub fn skin_drawable(
        &mut self,
        device: &mut dyn GraphicsDevice,
        cache: &mut DeviceResourceCache,
        drawable: &dyn Drawable,
        frame: FrameStamp,
    ) -> Result<bool, SkinningError> {
        let key = drawable.key();
        if self.is_current(key, frame) {
            return Ok(false);
        }
        let palette = drawable.bone_palette();
        if palette.is_empty() {
            return Ok(false);
        }

        for group in drawable.buffer_groups().iter().filter(|group| group.is_skinned()) {
            self.blend_group(group, palette)?;
            cache.update(device, group.keys().vertex_buffer, bytemuck::cast_slice(&self.scratch))?;
        }

        self.last_skinned.insert(key, frame);
        log::trace!("Skinned drawable {:?} for frame {}", key, frame.0);
        Ok(true)
    }

    fn blend_group(&mut self, group: &BufferGroup, palette: &[Mat4]) -> Result<(), SkinningError> {
        let weights = group
            .skin()
            .ok_or_else(|| SkinningError::MissingWeights(group.label().to_string()))?;
        blend_vertices(group.vertices(), weights, palette, &mut self.scratch).map_err(|bone| {
            SkinningError::BoneOutOfRange {
                group: group.label().to_string(),
                bone,
                palette: palette.len(),
            }
        })?;
        self.vertices_blended += self.scratch.len() as u64;
        Ok(())
    }

    /// Forget drawables not skinned since `frame`
    pub fn prune_before(&mut self, frame: FrameStamp) {
        self.last_skinned.retain(|_, last| *last >= frame);
    }
}

/// Blend `vertices` by their weights into `out`. On failure returns the
/// first bone index outside `palette`.
pub fn blend_vertices(
    vertices: &[Vertex],
    weights: &[SkinWeights],
    palette: &[Mat4],
    out: &mut Vec<Vertex>,
) -> Result<(), u32> {
    out.clear();
    out.reserve(vertices.len());

    for (vertex, skin) in vertices.iter().zip(weights) {
        let position = Vec4::new(vertex.position[0], vertex.position[1], vertex.position[2], 1.0);
        let normal = Vec4::new(vertex.normal[0], vertex.normal[1], vertex.normal[2], 0.0);

        let mut blended_position = Vec4::zeros();
        let mut blended_normal = Vec4::zeros();
        let mut total = 0.0;
        for (&bone, &weight) in skin.bones.iter().zip(&skin.weights) {
            if weight <= 0.0 {
                continue;
            }
            let matrix = palette.get(bone as usize).ok_or(bone)?;
            blended_position += matrix * position * weight;
            blended_normal += matrix * normal * weight;
            total += weight;
        }

        if total <= f32::EPSILON {
            out.push(*vertex);
            continue;
        }
        let normal = Vec3::new(blended_normal.x, blended_normal.y, blended_normal.z)
            .try_normalize(f32::EPSILON)
            .unwrap_or_else(|| Vec3::new(vertex.normal[0], vertex.normal[1], vertex.normal[2]));
        out.push(Vertex {
            position: [
                blended_position.x / total,
                blended_position.y / total,
                blended_position.z / total,
            ],
            normal: normal.into(),
            tex_coord: vertex.tex_coord,
        });
    }

    // Vertices without weights keep their bind pose
    out.extend_from_slice(vertices.get(weights.len()..).unwrap_or(&[]));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::api::DeviceCaps;
    use crate::render::backends::{DeviceCall, RecordingDevice};
    use crate::render::material::Material;
    use crate::scene::{Span, SpanCollection, AABB};
    use approx::assert_relative_eq;
    use std::sync::Arc;

    #[test]
    fn test_two_bone_blend() {
        let vertices = [Vertex::new([1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0])];
        let weights = [SkinWeights { bones: [0, 1, 0, 0], weights: [0.5, 0.5, 0.0, 0.0] }];
        let palette = [Mat4::identity(), Mat4::new_translation(&Vec3::new(0.0, 2.0, 0.0))];
        let mut out = Vec::new();

        blend_vertices(&vertices, &weights, &palette, &mut out).expect("Should blend");
        assert_relative_eq!(out[0].position[1], 1.0);
        assert_relative_eq!(out[0].position[0], 1.0);
        assert_relative_eq!(out[0].normal[1], 1.0);
    }

    #[test]
    fn test_missing_bone_is_reported() {
        let vertices = [Vertex::default()];
        let weights = [SkinWeights::rigid(3)];
        let mut out = Vec::new();
        assert_eq!(blend_vertices(&vertices, &weights, &[Mat4::identity()], &mut out), Err(3));
    }

    #[test]
    fn test_skinning_runs_once_per_frame() {
        let mut device = RecordingDevice::new(DeviceCaps::default());
        let mut cache = DeviceResourceCache::new();
        let group = BufferGroup::skinned(
            &mut cache,
            "arm",
            vec![Vertex::new([0.0, 1.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0]); 3],
            vec![SkinWeights::rigid(0); 3],
            vec![0, 1, 2],
        );
        let vertex_buffer = group.keys().vertex_buffer;
        let bounds = AABB::from_center_extents(Vec3::zeros(), Vec3::new(1.0, 1.0, 1.0));
        let mut drawable = SpanCollection::builder(DrawableKey(3))
            .with_buffer_group(Arc::new(group))
            .with_material(Arc::new(Material::new("skin", Vec::new())))
            .with_span(Span::new(0, 0, bounds).with_indices(0, 3))
            .build();
        drawable.set_bone_palette(vec![Mat4::new_translation(&Vec3::new(0.0, 0.0, 5.0))]);

        let mut skinner = Skinner::new();
        let frame = FrameStamp(1);
        assert!(skinner.skin_drawable(&mut device, &mut cache, &drawable, frame).expect("Should skin"));
        assert!(!skinner.skin_drawable(&mut device, &mut cache, &drawable, frame).expect("Should skip"));
        assert_eq!(cache.upload_count(vertex_buffer), 1);

        assert!(skinner.skin_drawable(&mut device, &mut cache, &drawable, frame.next()).expect("Should skin"));
        assert_eq!(cache.upload_count(vertex_buffer), 2);
        assert_eq!(skinner.vertices_blended(), 6);

        let uploads = device
            .calls()
            .iter()
            .filter(|call| matches!(call, DeviceCall::Upload { .. }))
            .count();
        assert_eq!(uploads, 2);

        skinner.prune_before(frame.next().next());
        assert!(!skinner.is_current(DrawableKey(3), frame.next()));
    }
}
