//! In-memory drawable
//!
//! [`SpanCollection`] is the simplest [`Drawable`]: it owns its spans,
//! shares its materials and buffer groups, and builds a space tree over the
//! span bounds when it is built.

use super::buffer_group::BufferGroup;
use super::drawable::{Drawable, DrawableKey};
use super::span::Span;
use crate::foundation::math::Mat4;
use crate::render::material::Material;
use crate::spatial::{SpaceTree, SpaceTreeConfig};
use std::sync::Arc;

/// A drawable holding its spans directly
#[derive(Debug)]
pub struct SpanCollection {
    key: DrawableKey,
    spans: Vec<Span>,
    materials: Vec<Arc<Material>>,
    buffer_groups: Vec<Arc<BufferGroup>>,
    tree: SpaceTree,
    tree_config: SpaceTreeConfig,
    bone_palette: Vec<Mat4>,
}

impl SpanCollection {
    /// Start building a collection
    pub fn builder(key: DrawableKey) -> SpanCollectionBuilder {
        SpanCollectionBuilder {
            key,
            spans: Vec::new(),
            materials: Vec::new(),
            buffer_groups: Vec::new(),
            tree_config: SpaceTreeConfig::default(),
        }
    }

    /// Replace the bone matrices used for skinned spans
    pub fn set_bone_palette(&mut self, palette: Vec<Mat4>) {
        self.bone_palette = palette;
    }

    /// Rebuild the space tree after span bounds changed
    pub fn rebuild_tree(&mut self) {
        self.tree = build_tree(&self.spans, &self.tree_config);
    }
}

fn build_tree(spans: &[Span], config: &SpaceTreeConfig) -> SpaceTree {
    SpaceTree::build(spans.iter().map(|span| span.world_bounds).enumerate(), config)
}

impl Drawable for SpanCollection {
    fn key(&self) -> DrawableKey {
        self.key
    }

    fn spans(&self) -> &[Span] {
        &self.spans
    }

    fn spans_mut(&mut self) -> &mut [Span] {
        &mut self.spans
    }

    fn material(&self, index: usize) -> Option<&Arc<Material>> {
        self.materials.get(index)
    }

    fn buffer_group(&self, index: usize) -> Option<&Arc<BufferGroup>> {
        self.buffer_groups.get(index)
    }

    fn buffer_groups(&self) -> &[Arc<BufferGroup>] {
        &self.buffer_groups
    }

    fn space_tree(&self) -> &SpaceTree {
        &self.tree
    }

    fn bone_palette(&self) -> &[Mat4] {
        &self.bone_palette
    }
}

/// Builder for [`SpanCollection`]
#[derive(Debug)]
pub struct SpanCollectionBuilder {
    key: DrawableKey,
    spans: Vec<Span>,
    materials: Vec<Arc<Material>>,
    buffer_groups: Vec<Arc<BufferGroup>>,
    tree_config: SpaceTreeConfig,
}

impl SpanCollectionBuilder {
    /// Add a buffer group; spans refer to it by insertion index
    pub fn with_buffer_group(mut self, group: Arc<BufferGroup>) -> Self {
        self.buffer_groups.push(group);
        self
    }

    /// Add a material; spans refer to it by insertion index
    pub fn with_material(mut self, material: Arc<Material>) -> Self {
        self.materials.push(material);
        self
    }

    /// Add a span
    pub fn with_span(mut self, span: Span) -> Self {
        self.spans.push(span);
        self
    }

    /// Override the space tree layout
    pub fn with_tree_config(mut self, config: SpaceTreeConfig) -> Self {
        self.tree_config = config;
        self
    }

    /// Build the collection and its space tree
    pub fn build(self) -> SpanCollection {
        let tree = build_tree(&self.spans, &self.tree_config);
        log::debug!(
            "Built span collection {:?}: {} spans, {} tree nodes",
            self.key,
            self.spans.len(),
            tree.node_count()
        );
        SpanCollection {
            key: self.key,
            spans: self.spans,
            materials: self.materials,
            buffer_groups: self.buffer_groups,
            tree,
            tree_config: self.tree_config,
            bone_palette: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec3;
    use crate::scene::AABB;

    #[test]
    fn test_builder_indexes_spans() {
        let spans = (0..6).map(|i| {
            let center = Vec3::new(i as f32 * 4.0, 0.0, 0.0);
            Span::new(0, 0, AABB::from_center_extents(center, Vec3::new(1.0, 1.0, 1.0)))
        });
        let mut builder = SpanCollection::builder(DrawableKey(11))
            .with_material(Arc::new(Material::new("plain", Vec::new())));
        for span in spans {
            builder = builder.with_span(span);
        }
        let mut collection = builder.build();

        assert_eq!(collection.key(), DrawableKey(11));
        assert_eq!(collection.space_tree().span_count(), 6);
        assert!(collection.material(0).is_some());
        assert!(collection.buffer_group(0).is_none());
        assert!(collection.bone_palette().is_empty());

        collection.spans_mut()[0].world_bounds = AABB::from_center_extents(
            Vec3::new(100.0, 0.0, 0.0),
            Vec3::new(1.0, 1.0, 1.0),
        );
        collection.rebuild_tree();
        let probe = AABB::from_center_extents(Vec3::new(100.0, 0.0, 0.0), Vec3::new(2.0, 2.0, 2.0));
        assert_eq!(collection.space_tree().overlapping(&probe), vec![0]);
    }
}
