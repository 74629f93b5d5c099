//! Scene collaborator types
//!
//! The pipeline consumes scene storage through the [`Drawable`] trait and
//! never owns it. This module holds the geometry vocabulary shared by both
//! sides of that boundary:
//!
//! - [`Span`]: a drawable range of a [`BufferGroup`] with one material
//! - [`AABB`], [`Plane`], [`Frustum`]: bounding volumes and culling planes
//! - [`VisRegionMask`] / [`VisRegionFilter`]: visibility region sets
//! - [`SpanCollection`]: an in-memory [`Drawable`]

mod bounds;
mod buffer_group;
mod collection;
mod drawable;
mod span;
mod vis_region;

pub use bounds::{Frustum, Plane, PlaneSide, AABB};
pub use buffer_group::{BufferGroup, GeometryKeys, SkinWeights, Vertex, MAX_BONE_INFLUENCES};
pub use collection::{SpanCollection, SpanCollectionBuilder};
pub use drawable::{Drawable, DrawableKey, SpanRef};
pub use span::{Span, SpanLight, SpanProps};
pub use vis_region::{VisRegionFilter, VisRegionMask};
