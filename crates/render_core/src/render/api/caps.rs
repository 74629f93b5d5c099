//! Device capability reporting
//!
//! Capability shortfalls are configuration inputs, not failures: the
//! compositor, light selector and shadow subsystem read these values and
//! degrade their output accordingly.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Boolean hardware features reported by the backend
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct CapsFlags: u32 {
        /// Anisotropic texture filtering
        const ANISOTROPY = 1 << 0;
        /// Block-compressed texture formats
        const COMPRESSED_TEXTURES = 1 << 1;
        /// Offscreen render targets usable as textures
        const RENDER_TO_TEXTURE = 1 << 2;
        /// Projective texture sampling across two stages (perspective shadows)
        const PROJECTIVE_DUAL_STAGE = 1 << 3;
        /// Per-channel color write masks
        const COLOR_WRITE_MASK = 1 << 4;
        /// Hardware vertex blending; without it skinning runs on the CPU
        const HARDWARE_SKINNING = 1 << 5;
        /// Depth bias state
        const DEPTH_BIAS = 1 << 6;
    }
}

/// Limits and features of the active device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCaps {
    /// Texture stages usable in one draw
    pub max_simultaneous_textures: u32,
    /// Hardware light slots
    pub max_lights: u32,
    /// Highest texture coordinate set index a stage may read
    pub max_uvw_source: u32,
    /// Boolean features
    pub flags: CapsFlags,
}

impl Default for DeviceCaps {
    /// A capable, modern device
    fn default() -> Self {
        Self {
            max_simultaneous_textures: 8,
            max_lights: 8,
            max_uvw_source: 7,
            flags: CapsFlags::all(),
        }
    }
}

impl DeviceCaps {
    /// A legacy two-stage device without projective or skinning support
    pub fn legacy_two_stage() -> Self {
        Self {
            max_simultaneous_textures: 2,
            max_lights: 8,
            max_uvw_source: 1,
            flags: CapsFlags::RENDER_TO_TEXTURE,
        }
    }

    /// True for hardware that cannot run more than two texture stages at once
    pub fn is_stage_limited(&self) -> bool {
        self.max_simultaneous_textures <= 2
    }

    /// Check a feature flag
    pub fn supports(&self, flag: CapsFlags) -> bool {
        self.flags.contains(flag)
    }
}
