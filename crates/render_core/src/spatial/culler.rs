//! Per-drawable visibility harvesting
//!
//! The culler owns the frame's [`CullTree`] and pushes each drawable's
//! space tree through it. Whole subtrees are accepted or rejected at once;
//! surviving spans are then filtered by render properties and visibility
//! regions.

use super::cull_tree::{CullTree, Occluder};
use crate::foundation::math::{Mat4, Vec3};
use crate::scene::{Drawable, SpanProps, VisRegionFilter};

/// Builds visible span lists for drawables
#[derive(Debug, Default)]
pub struct VisibilityCuller {
    tree: CullTree,
}

impl VisibilityCuller {
    /// Create a culler with an empty occluder set
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the camera for the frame
    pub fn set_view(&mut self, view_proj: Mat4, eye: Vec3) {
        self.tree.set_view(view_proj, eye);
    }

    /// Add an occluder polygon
    pub fn add_occluder(&mut self, occluder: Occluder) {
        self.tree.add_occluder(occluder);
    }

    /// Remove every occluder
    pub fn clear_occluders(&mut self) {
        self.tree.clear_occluders();
    }

    /// The underlying cull tree
    pub fn cull_tree(&self) -> &CullTree {
        &self.tree
    }

    /// Indices of the drawable's spans that are visible, ascending
    pub fn harvest(&mut self, drawable: &dyn Drawable, filter: &VisRegionFilter) -> Vec<usize> {
        self.tree.refresh();
        let tree = &self.tree;
        let spans = drawable.spans();
        drawable
            .space_tree()
            .harvest(|bounds| tree.classify(bounds))
            .into_iter()
            .filter(|&index| {
                spans
                    .get(index)
                    .is_some_and(|span| !span.has(SpanProps::HIDDEN) && filter.admits(span.vis_regions))
            })
            .collect()
    }
}
