//! Drawable collaborator interface
//!
//! The pipeline never owns scene storage. A drawable hands out its spans,
//! the materials and buffer groups they index, a space tree over the spans
//! and, for skinned geometry, the current bone palette.

use super::buffer_group::BufferGroup;
use super::span::Span;
use crate::foundation::math::Mat4;
use crate::render::material::Material;
use crate::spatial::SpaceTree;
use std::sync::Arc;

/// Stable identity of a drawable across frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DrawableKey(pub u64);

/// A span addressed by its drawable and index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanRef {
    /// Owning drawable
    pub drawable: DrawableKey,
    /// Index into [`Drawable::spans`]
    pub span: usize,
}

/// Scene object the pipeline renders
pub trait Drawable {
    /// Stable identity, used for per-frame dedupe
    fn key(&self) -> DrawableKey;

    /// Every span of the drawable
    fn spans(&self) -> &[Span];

    /// Mutable spans, for per-frame light and shadow annotations
    fn spans_mut(&mut self) -> &mut [Span];

    /// Material referenced by a span's `material` index
    fn material(&self, index: usize) -> Option<&Arc<Material>>;

    /// Buffer group referenced by a span's `buffer_group` index
    fn buffer_group(&self, index: usize) -> Option<&Arc<BufferGroup>>;

    /// Every buffer group, for scene load
    fn buffer_groups(&self) -> &[Arc<BufferGroup>];

    /// Bounding volume hierarchy over the spans
    fn space_tree(&self) -> &SpaceTree;

    /// Bone matrices for skinned spans; empty when nothing is skinned
    fn bone_palette(&self) -> &[Mat4] {
        &[]
    }
}
