//! Material layers and their textures

use crate::foundation::math::{Color, Mat4, Vec4};
use crate::render::api::{MemoryPool, ResourceDesc, ResourceKind};
use crate::render::resources::{DeviceResourceCache, ResourceId};
use crate::render::state::{ClampFlags, TexCoordSource};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

bitflags! {
    /// How a layer combines with what is below it
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct BlendFlags: u32 {
        /// Lerp by the layer's alpha
        const ALPHA = 1 << 0;
        /// Add the layer's color
        const ADD = 1 << 1;
        /// Multiply by the layer's color
        const MULT = 1 << 2;
        /// Add the layer's color scaled by its alpha
        const ADD_COLOR_TIMES_ALPHA = 1 << 3;
        /// Write no color, only alpha
        const NO_COLOR = 1 << 4;
        /// Discard texels with low alpha
        const ALPHA_TEST = 1 << 5;
    }
}

bitflags! {
    /// Pass-structure and face flags of a layer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MiscFlags: u32 {
        /// Always start a new pass at this layer
        const RESTART_PASS_HERE = 1 << 0;
        /// The following layer must render in the same pass as this one
        const BIND_NEXT = 1 << 1;
        /// Draw both faces
        const TWO_SIDED = 1 << 2;
        /// Never share a pass with another layer
        const TROUBLED_LONER = 1 << 3;
        /// Texture coordinates are projected (textured light cookies)
        const PROJECTED = 1 << 4;
    }
}

bitflags! {
    /// Depth buffer usage of a layer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ZFlags: u32 {
        /// Do not write depth
        const NO_Z_WRITE = 1 << 0;
        /// Do not test depth
        const NO_Z_READ = 1 << 1;
        /// Bias toward the viewer (decals)
        const Z_INC = 1 << 2;
    }
}

bitflags! {
    /// Shading flags of a layer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ShadeFlags: u32 {
        /// Ignore vertex lighting; the layer renders at full brightness
        const WHITE = 1 << 0;
        /// Never fogged
        const NO_FOG = 1 << 1;
    }
}

/// CPU-side texture registered with the resource cache
#[derive(Debug)]
pub struct Texture {
    id: ResourceId,
    label: String,
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Texture {
    /// Register an RGBA8 texture in the managed pool
    pub fn new(
        cache: &mut DeviceResourceCache,
        label: impl Into<String>,
        width: u32,
        height: u32,
        pixels: Vec<u8>,
    ) -> Self {
        let label = label.into();
        let id = cache.register(ResourceDesc {
            kind: ResourceKind::Texture,
            pool: MemoryPool::Managed,
            byte_size: pixels.len() as u64,
            extent: Some((width, height)),
            label: label.clone(),
        });
        Self { id, label, width, height, pixels }
    }

    /// Cache key
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Debug label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Width and height in texels
    pub fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Pixel data
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

/// What a layer samples
#[derive(Debug, Clone)]
pub enum LayerTexture {
    /// A loaded texture
    Static(Arc<Texture>),
    /// An offscreen render target
    RenderTarget(ResourceId),
    /// A reference the asset layer could not resolve
    Missing(String),
}

/// One texture/blend stage of a material
#[derive(Debug, Clone)]
pub struct Layer {
    /// Sampled texture, `None` for a flat-colored layer
    pub texture: Option<LayerTexture>,
    /// Blend with the layers below
    pub blend: BlendFlags,
    /// Texture addressing
    pub clamp: ClampFlags,
    /// Texture coordinate source
    pub uvw: TexCoordSource,
    /// Texture coordinate transform
    pub transform: Option<Mat4>,
    /// Pass-structure flags
    pub misc: MiscFlags,
    /// Depth flags
    pub z: ZFlags,
    /// Shading flags
    pub shade: ShadeFlags,
    /// Opacity multiplier
    pub opacity: f32,
    /// Layer color
    pub color: Color,
}

impl Layer {
    /// Opaque layer sampling `texture` with its first UV set
    pub fn new(texture: Option<LayerTexture>) -> Self {
        Self {
            texture,
            blend: BlendFlags::empty(),
            clamp: ClampFlags::empty(),
            uvw: TexCoordSource::Uv(0),
            transform: None,
            misc: MiscFlags::empty(),
            z: ZFlags::empty(),
            shade: ShadeFlags::empty(),
            opacity: 1.0,
            color: Vec4::new(1.0, 1.0, 1.0, 1.0),
        }
    }

    /// Layer sampling a loaded texture
    pub fn textured(texture: Arc<Texture>) -> Self {
        Self::new(Some(LayerTexture::Static(texture)))
    }

    /// Set the blend flags
    pub fn with_blend(mut self, blend: BlendFlags) -> Self {
        self.blend = blend;
        self
    }

    /// Set the texture coordinate source
    pub fn with_uvw(mut self, uvw: TexCoordSource) -> Self {
        self.uvw = uvw;
        self
    }

    /// Set the misc flags
    pub fn with_misc(mut self, misc: MiscFlags) -> Self {
        self.misc = misc;
        self
    }

    /// Set the depth flags
    pub fn with_z(mut self, z: ZFlags) -> Self {
        self.z = z;
        self
    }

    /// Set the shading flags
    pub fn with_shade(mut self, shade: ShadeFlags) -> Self {
        self.shade = shade;
        self
    }

    /// Set the opacity
    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.opacity = opacity;
        self
    }

    /// Set the addressing mode
    pub fn with_clamp(mut self, clamp: ClampFlags) -> Self {
        self.clamp = clamp;
        self
    }

    /// Set the texture coordinate transform
    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.transform = Some(transform);
        self
    }

    /// UV set index read by this layer, `None` for generated coordinates
    pub fn uv_set(&self) -> Option<u32> {
        match self.uvw {
            TexCoordSource::Uv(index) => Some(index),
            _ => None,
        }
    }

    /// True when coordinates derive from vertex position (projection and
    /// distance fades)
    pub fn is_position_based(&self) -> bool {
        self.uvw == TexCoordSource::CameraPosition
    }
}
