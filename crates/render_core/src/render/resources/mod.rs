//! Device resource management
//!
//! This module owns every backend handle the pipeline keeps across frames:
//! the generation-checked resource cache and the pooled shadow render
//! targets allocated from it.

pub mod cache;
pub mod target_pool;

pub use cache::{AllocationPhase, DeviceResourceCache, ResourceError, ResourceId, ResourceState};
pub use target_pool::{RenderTargetPool, TargetLease};
