//! Redundant state filtering
//!
//! The tracker remembers the last value applied in every [`StateCategory`]
//! and drops requests that would not change anything. A forced re-apply
//! bypasses the comparison exactly once per category; it is raised after any
//! operation known to clobber backend state behind the tracker's back
//! (render target pops, overlay passes, device resets).

use super::{
    BlendState, ColorWriteMask, CullMode, FogState, StageState, StateCategory, StateChange, ZMode,
};
use crate::render::api::GraphicsDevice;
use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct ForcedCategories: u8 {
        const Z_MODE = 1 << 0;
        const CULL = 1 << 1;
        const BLEND = 1 << 2;
        const COLOR_WRITE = 1 << 3;
        const FOG = 1 << 4;
    }
}

/// Counters for one frame of state traffic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateStats {
    /// Changes forwarded to the backend
    pub issued: u32,
    /// Changes dropped as redundant
    pub skipped: u32,
    /// Blend changes forwarded to the backend
    pub blend_changes: u32,
}

/// Diffs requested state against last-applied state
#[derive(Debug)]
pub struct StateTracker {
    z_mode: Option<ZMode>,
    cull: Option<CullMode>,
    blend: Option<BlendState>,
    color_write: Option<ColorWriteMask>,
    fog: Option<FogState>,
    stages: Vec<Option<StageState>>,
    forced: ForcedCategories,
    forced_stages: u64,
    stats: StateStats,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    /// Create a tracker that knows nothing about the backend yet, so every
    /// first request in a category is issued
    pub fn new() -> Self {
        Self {
            z_mode: None,
            cull: None,
            blend: None,
            color_write: None,
            fog: None,
            stages: Vec::new(),
            forced: ForcedCategories::empty(),
            forced_stages: 0,
            stats: StateStats::default(),
        }
    }

    /// Bypass the diff once in every category
    pub fn force_reapply(&mut self) {
        log::trace!("State tracker: forcing full re-apply");
        self.forced = ForcedCategories::all();
        self.forced_stages = u64::MAX;
    }

    /// True while some category still has a pending forced re-apply
    pub fn is_forced(&self) -> bool {
        !self.forced.is_empty() || self.forced_stages != 0
    }

    /// Forget everything, as after a device reset
    pub fn reset(&mut self) {
        let stats = self.stats;
        *self = Self::new();
        self.stats = stats;
    }

    /// Apply a state change, returning whether the backend saw it
    pub fn apply(&mut self, device: &mut dyn GraphicsDevice, change: StateChange) -> bool {
        if self.take_forced(change.category()) || self.differs(&change) {
            self.record(change);
            device.apply_state(&change);
            self.stats.issued += 1;
            if matches!(change, StateChange::Blend(_)) {
                self.stats.blend_changes += 1;
            }
            true
        } else {
            self.stats.skipped += 1;
            false
        }
    }

    /// Disable `first_unused` so no driver is trusted to leave higher stages
    /// off. Nothing is sealed when every hardware stage is in use.
    pub fn seal_stages(&mut self, device: &mut dyn GraphicsDevice, first_unused: u32) -> bool {
        if first_unused >= device.caps().max_simultaneous_textures {
            return false;
        }
        self.apply(device, StateChange::Stage(first_unused, StageState::disabled()))
    }

    /// Last blend state the backend saw
    pub fn blend(&self) -> Option<BlendState> {
        self.blend
    }

    /// Last depth mode the backend saw
    pub fn z_mode(&self) -> Option<ZMode> {
        self.z_mode
    }

    /// Last state of stage `stage` the backend saw
    pub fn stage(&self, stage: u32) -> Option<StageState> {
        self.stages.get(stage as usize).copied().flatten()
    }

    /// Counters accumulated since the last [`take_stats`](Self::take_stats)
    pub fn stats(&self) -> StateStats {
        self.stats
    }

    /// Return and clear the counters
    pub fn take_stats(&mut self) -> StateStats {
        std::mem::take(&mut self.stats)
    }

    fn take_forced(&mut self, category: StateCategory) -> bool {
        let bit = match category {
            StateCategory::ZMode => ForcedCategories::Z_MODE,
            StateCategory::Cull => ForcedCategories::CULL,
            StateCategory::Blend => ForcedCategories::BLEND,
            StateCategory::ColorWrite => ForcedCategories::COLOR_WRITE,
            StateCategory::Fog => ForcedCategories::FOG,
            StateCategory::Stage(stage) => {
                let mask = 1u64.checked_shl(stage).unwrap_or(0);
                let forced = self.forced_stages & mask != 0;
                self.forced_stages &= !mask;
                return forced;
            }
        };
        let forced = self.forced.contains(bit);
        self.forced.remove(bit);
        forced
    }

    fn differs(&self, change: &StateChange) -> bool {
        match change {
            StateChange::ZMode(mode) => self.z_mode != Some(*mode),
            StateChange::Cull(mode) => self.cull != Some(*mode),
            StateChange::Blend(blend) => self.blend != Some(*blend),
            StateChange::ColorWrite(mask) => self.color_write != Some(*mask),
            StateChange::Fog(fog) => self.fog != Some(*fog),
            StateChange::Stage(stage, state) => self.stage(*stage) != Some(*state),
        }
    }

    fn record(&mut self, change: StateChange) {
        match change {
            StateChange::ZMode(mode) => self.z_mode = Some(mode),
            StateChange::Cull(mode) => self.cull = Some(mode),
            StateChange::Blend(blend) => self.blend = Some(blend),
            StateChange::ColorWrite(mask) => self.color_write = Some(mask),
            StateChange::Fog(fog) => self.fog = Some(fog),
            StateChange::Stage(stage, state) => {
                let index = stage as usize;
                if index >= self.stages.len() {
                    self.stages.resize(index + 1, None);
                }
                self.stages[index] = Some(state);
            }
        }
    }
}
