//! Spatial structures used for visibility
//!
//! - [`CullTree`]: frustum and occluder BSP, rebuilt lazily
//! - [`SpaceTree`]: bounding volume hierarchy over one drawable's spans
//! - [`VisibilityCuller`]: pushes space trees through the cull tree

mod cull_tree;
mod culler;
mod space_tree;

pub use cull_tree::{CullTree, Occluder, Visibility};
pub use culler::VisibilityCuller;
pub use space_tree::{SpaceTree, SpaceTreeConfig, SpaceTreeNode};
