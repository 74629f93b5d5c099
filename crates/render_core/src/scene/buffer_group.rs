//! Shared geometry buffers
//!
//! A [`BufferGroup`] owns the CPU copy of one vertex/index buffer pair that
//! many spans index into. Its backend buffers are registered with the
//! resource cache when the group is built; static groups live in the managed
//! pool, skinned groups get a dynamic vertex buffer in the unmanaged pool
//! that the skinner rewrites each frame.

use crate::render::api::{GeometryBinding, GraphicsDevice, MemoryPool, ResourceDesc, ResourceKind};
use crate::render::resources::{DeviceResourceCache, ResourceError, ResourceId};
use bytemuck::{Pod, Zeroable};

/// Maximum bone influences per vertex
pub const MAX_BONE_INFLUENCES: usize = 4;

/// Vertex layout shared by every buffer group
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct Vertex {
    /// Position in 3D space
    pub position: [f32; 3],

    /// Normal vector
    pub normal: [f32; 3],

    /// Texture coordinates
    pub tex_coord: [f32; 2],
}

impl Vertex {
    /// Create a vertex
    pub const fn new(position: [f32; 3], normal: [f32; 3], tex_coord: [f32; 2]) -> Self {
        Self { position, normal, tex_coord }
    }
}

/// Bone influences of one vertex; unused slots carry zero weight
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct SkinWeights {
    /// Palette indices
    pub bones: [u32; MAX_BONE_INFLUENCES],
    /// Blend weights, summing to one
    pub weights: [f32; MAX_BONE_INFLUENCES],
}

impl SkinWeights {
    /// Fully bound to one bone
    pub const fn rigid(bone: u32) -> Self {
        Self { bones: [bone, 0, 0, 0], weights: [1.0, 0.0, 0.0, 0.0] }
    }
}

/// Cache keys of a group's backend buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryKeys {
    /// Vertex buffer
    pub vertex_buffer: ResourceId,
    /// Index buffer
    pub index_buffer: ResourceId,
}

/// One vertex/index buffer pair shared by many spans
#[derive(Debug)]
pub struct BufferGroup {
    label: String,
    vertices: Vec<Vertex>,
    skin: Option<Vec<SkinWeights>>,
    indices: Vec<u16>,
    keys: GeometryKeys,
}

impl BufferGroup {
    /// Build a static group in the managed pool
    pub fn new(
        cache: &mut DeviceResourceCache,
        label: impl Into<String>,
        vertices: Vec<Vertex>,
        indices: Vec<u16>,
    ) -> Self {
        Self::build(cache, label.into(), vertices, None, indices)
    }

    /// Build a skinned group whose vertex buffer is rewritten every frame
    pub fn skinned(
        cache: &mut DeviceResourceCache,
        label: impl Into<String>,
        vertices: Vec<Vertex>,
        skin: Vec<SkinWeights>,
        indices: Vec<u16>,
    ) -> Self {
        Self::build(cache, label.into(), vertices, Some(skin), indices)
    }

    fn build(
        cache: &mut DeviceResourceCache,
        label: String,
        vertices: Vec<Vertex>,
        skin: Option<Vec<SkinWeights>>,
        indices: Vec<u16>,
    ) -> Self {
        let vertex_pool = if skin.is_some() { MemoryPool::Unmanaged } else { MemoryPool::Managed };
        let vertex_buffer = cache.register(ResourceDesc {
            kind: ResourceKind::VertexBuffer,
            pool: vertex_pool,
            byte_size: std::mem::size_of_val(vertices.as_slice()) as u64,
            extent: None,
            label: format!("{label}.vertices"),
        });
        let index_buffer = cache.register(ResourceDesc {
            kind: ResourceKind::IndexBuffer,
            pool: MemoryPool::Managed,
            byte_size: std::mem::size_of_val(indices.as_slice()) as u64,
            extent: None,
            label: format!("{label}.indices"),
        });

        Self {
            label,
            vertices,
            skin,
            indices,
            keys: GeometryKeys { vertex_buffer, index_buffer },
        }
    }

    /// Debug label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Bind-pose vertices
    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    /// Triangle list indices
    pub fn indices(&self) -> &[u16] {
        &self.indices
    }

    /// Per-vertex bone influences of a skinned group
    pub fn skin(&self) -> Option<&[SkinWeights]> {
        self.skin.as_deref()
    }

    /// True when the vertex buffer is rewritten by the skinner
    pub fn is_skinned(&self) -> bool {
        self.skin.is_some()
    }

    /// Backend buffer keys
    pub fn keys(&self) -> GeometryKeys {
        self.keys
    }

    /// Bytes per vertex
    pub fn stride(&self) -> u32 {
        std::mem::size_of::<Vertex>() as u32
    }

    /// Bind-pose vertex bytes
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    /// Index bytes
    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    /// Fetch both backend buffers, creating them on first use
    pub fn bind(
        &self,
        device: &mut dyn GraphicsDevice,
        cache: &mut DeviceResourceCache,
    ) -> Result<GeometryBinding, ResourceError> {
        let vertex_buffer = cache.get_or_create(device, self.keys.vertex_buffer, self.vertex_bytes())?;
        let index_buffer = cache.get_or_create(device, self.keys.index_buffer, self.index_bytes())?;
        Ok(GeometryBinding { vertex_buffer, index_buffer, stride: self.stride() })
    }

    /// Vertex positions of a triangle list range
    pub fn triangle_positions(&self, index_start: u32, index_count: u32) -> impl Iterator<Item = [f32; 3]> + '_ {
        let start = index_start as usize;
        let end = (start + index_count as usize).min(self.indices.len());
        self.indices[start.min(end)..end]
            .iter()
            .filter_map(|&index| self.vertices.get(usize::from(index)))
            .map(|vertex| vertex.position)
    }
}
