//! Frame control and the pipeline entry point
//!
//! [`FrameController`] owns the frame lifecycle: device-loss polling, the
//! managed-pool eviction heuristic, the nested scene depth and the frame
//! stamp. [`RenderContext`] owns every subsystem and exposes the per-frame
//! API to the scene layer.

mod context;
mod controller;

pub use context::{Camera, RenderContext};
pub use controller::{DevicePoll, FrameController, FramePhase};

use crate::render::api::DeviceCaps;
use crate::render::shadow::ShadowStats;
use crate::render::state::StateStats;
use std::fmt;

/// Result of `BeginFrame`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// The frame is open; render and end it
    Ready,
    /// The device is not usable yet; skip this frame and call again
    Retry,
}

/// Receives the device-recreated broadcast
///
/// Owners of their own device objects rebuild them here. The broadcast is
/// sent after the pipeline has recreated its unmanaged resources and before
/// the first frame on the new device is rendered.
pub trait DeviceObserver {
    /// The device was reset or recreated with `caps`
    fn device_recreated(&self, caps: &DeviceCaps);
}

/// Counters for one frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Indexed draws issued for material passes
    pub draw_calls: u32,
    /// Material passes planned and issued
    pub passes: u32,
    /// Spans fully rendered
    pub spans_rendered: u32,
    /// Spans skipped for missing data or failed allocations
    pub spans_skipped: u32,
    /// Spans abandoned by the compositor
    pub spans_aborted: u32,
    /// Projector passes
    pub projector_passes: u32,
    /// Drawables blended on the CPU
    pub skinned_drawables: u32,
    /// State tracker traffic
    pub state: StateStats,
    /// Shadow traffic
    pub shadows: ShadowStats,
}

impl fmt::Display for FrameStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} draws in {} passes, spans {}/{} skipped/{} aborted, {} projector passes, \
             {} skinned, state {} issued/{} skipped, shadows {} rendered/{} dropped/{} projected",
            self.draw_calls,
            self.passes,
            self.spans_rendered,
            self.spans_skipped,
            self.spans_aborted,
            self.projector_passes,
            self.skinned_drawables,
            self.state.issued,
            self.state.skipped,
            self.shadows.rendered,
            self.shadows.dropped,
            self.shadows.projections,
        )
    }
}
