//! Multi-layer materials
//!
//! A [`Material`] is an ordered stack of shared [`Layer`]s plus optional
//! piggyback layers (light maps) appended to every pass. Materials, layers
//! and textures form a DAG of shared pointers: layers never point back to
//! the materials that use them.
//!
//! The [`MaterialCompositor`] decides how many consecutive layers fit in
//! one rendering pass.

pub mod compositor;
pub mod layer;

pub use compositor::{DiffuseMode, LayerSlot, MaterialCompositor, PassAbort, PassPlan, StagePlan};
pub use layer::{BlendFlags, Layer, LayerTexture, MiscFlags, ShadeFlags, Texture, ZFlags};

use std::sync::Arc;

/// Ordered layer stack
#[derive(Debug, Clone, Default)]
pub struct Material {
    /// Debug name
    pub name: String,
    /// Layers, base first
    pub layers: Vec<Arc<Layer>>,
    /// Layers appended to every pass
    pub piggybacks: Vec<Arc<Layer>>,
}

impl Material {
    /// Create a material from its layers
    pub fn new(name: impl Into<String>, layers: Vec<Layer>) -> Self {
        Self {
            name: name.into(),
            layers: layers.into_iter().map(Arc::new).collect(),
            piggybacks: Vec::new(),
        }
    }

    /// Append a piggyback layer
    pub fn with_piggyback(mut self, layer: Layer) -> Self {
        self.piggybacks.push(Arc::new(layer));
        self
    }

    /// Number of layers
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Base layer
    pub fn base_layer(&self) -> Option<&Layer> {
        self.layers.first().map(AsRef::as_ref)
    }

    /// True when the base layer blends with the framebuffer
    pub fn is_blended(&self) -> bool {
        self.base_layer().is_some_and(|layer| {
            layer.blend.intersects(BlendFlags::ALPHA | BlendFlags::ADD | BlendFlags::MULT)
        })
    }
}
