//! Fixed-function pipeline state
//!
//! Every piece of backend state the pipeline touches is expressed as a
//! [`StateChange`] in one [`StateCategory`]. The [`StateTracker`] diffs
//! requested changes against what was last applied so redundant transitions
//! never reach the backend.

mod tracker;

pub use tracker::{StateStats, StateTracker};

use bitflags::bitflags;

/// Depth comparison function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareFunc {
    /// Never passes
    Never,
    /// Passes when incoming < stored
    Less,
    /// Passes when incoming <= stored
    LessEqual,
    /// Passes when incoming == stored
    Equal,
    /// Passes when incoming > stored
    Greater,
    /// Always passes
    Always,
}

/// Depth buffer usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ZMode {
    /// Test against the depth buffer
    pub test: bool,
    /// Write to the depth buffer
    pub write: bool,
    /// Comparison used when testing
    pub func: CompareFunc,
    /// Depth bias steps (pushes decals toward the viewer)
    pub bias: i32,
}

impl ZMode {
    /// Normal opaque rendering: test and write
    pub const fn opaque() -> Self {
        Self { test: true, write: true, func: CompareFunc::LessEqual, bias: 0 }
    }

    /// Test only, for blended layers and decals
    pub const fn test_only() -> Self {
        Self { test: true, write: false, func: CompareFunc::LessEqual, bias: 0 }
    }

    /// No depth interaction, for full-screen passes
    pub const fn disabled() -> Self {
        Self { test: false, write: false, func: CompareFunc::Always, bias: 0 }
    }

    /// Same mode with a depth bias
    pub const fn with_bias(mut self, bias: i32) -> Self {
        self.bias = bias;
        self
    }
}

/// Triangle culling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CullMode {
    /// Draw both faces
    None,
    /// Cull clockwise faces
    Clockwise,
    /// Cull counter-clockwise faces
    CounterClockwise,
}

/// Framebuffer blend factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    /// 0
    Zero,
    /// 1
    One,
    /// Source color
    SrcColor,
    /// 1 - source color
    InvSrcColor,
    /// Source alpha
    SrcAlpha,
    /// 1 - source alpha
    InvSrcAlpha,
    /// Destination color
    DestColor,
}

/// Framebuffer blend state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendState {
    /// Factor applied to the incoming fragment
    pub src: BlendFactor,
    /// Factor applied to the framebuffer
    pub dst: BlendFactor,
    /// Alpha test reference; fragments with alpha at or below it are discarded
    pub alpha_ref: Option<u8>,
}

impl BlendState {
    /// Replace the framebuffer
    pub const fn opaque() -> Self {
        Self { src: BlendFactor::One, dst: BlendFactor::Zero, alpha_ref: None }
    }

    /// Classic transparency
    pub const fn alpha() -> Self {
        Self { src: BlendFactor::SrcAlpha, dst: BlendFactor::InvSrcAlpha, alpha_ref: None }
    }

    /// Add onto the framebuffer
    pub const fn additive() -> Self {
        Self { src: BlendFactor::One, dst: BlendFactor::One, alpha_ref: None }
    }

    /// Multiply the framebuffer
    pub const fn multiply() -> Self {
        Self { src: BlendFactor::DestColor, dst: BlendFactor::Zero, alpha_ref: None }
    }

    /// `dst = dst * (1 - src)`, used to darken by a shadow intensity
    pub const fn darken() -> Self {
        Self { src: BlendFactor::Zero, dst: BlendFactor::InvSrcColor, alpha_ref: None }
    }

    /// Same blend with an alpha test
    pub const fn with_alpha_ref(mut self, alpha_ref: u8) -> Self {
        self.alpha_ref = Some(alpha_ref);
        self
    }
}

bitflags! {
    /// Framebuffer channels written by a draw
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ColorWriteMask: u8 {
        /// Red
        const RED = 1 << 0;
        /// Green
        const GREEN = 1 << 1;
        /// Blue
        const BLUE = 1 << 2;
        /// Alpha
        const ALPHA = 1 << 3;
        /// Red, green and blue
        const COLOR = Self::RED.bits() | Self::GREEN.bits() | Self::BLUE.bits();
    }
}

/// Fog state
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FogState {
    /// No fog
    Disabled,
    /// Linear fog between two view distances
    Linear {
        /// Distance where fog starts
        start: f32,
        /// Distance of full fog
        end: f32,
        /// Fog color
        color: [f32; 3],
    },
    /// Exponential fog
    Exp {
        /// Density coefficient
        density: f32,
        /// Fog color
        color: [f32; 3],
    },
}

/// Texture stage combiner operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageOp {
    /// Stage and all later stages are off
    Disable,
    /// Pass the first argument through
    SelectArg1,
    /// arg1 * arg2
    Modulate,
    /// arg1 + arg2
    Add,
    /// arg1 - arg2
    Subtract,
    /// Lerp between the arguments by the texture alpha
    BlendTextureAlpha,
    /// Lerp between the arguments by the running alpha
    BlendCurrentAlpha,
}

/// Texture stage combiner argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageArg {
    /// The stage's texture sample
    Texture,
    /// Result of the previous stage
    Current,
    /// Interpolated vertex diffuse
    Diffuse,
    /// Constant factor
    Factor,
}

/// Where a stage reads texture coordinates from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TexCoordSource {
    /// Authored UV set
    Uv(u32),
    /// Camera-space vertex position (projection, distance ramps)
    CameraPosition,
    /// Camera-space vertex normal
    CameraNormal,
    /// Camera-space reflection vector
    CameraReflection,
}

bitflags! {
    /// Texture address clamping
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClampFlags: u8 {
        /// Clamp U
        const U = 1 << 0;
        /// Clamp V
        const V = 1 << 1;
        /// Clamp both
        const UV = Self::U.bits() | Self::V.bits();
    }
}

/// State of one texture stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageState {
    /// Color combiner
    pub color_op: StageOp,
    /// Color arguments
    pub color_args: (StageArg, StageArg),
    /// Alpha combiner
    pub alpha_op: StageOp,
    /// Alpha arguments
    pub alpha_args: (StageArg, StageArg),
    /// Texture coordinate source
    pub tex_coord: TexCoordSource,
    /// Addressing
    pub clamp: ClampFlags,
    /// Projective divide on the texture coordinates
    pub projected: bool,
}

impl StageState {
    /// A disabled stage; seals every stage after it
    pub const fn disabled() -> Self {
        Self {
            color_op: StageOp::Disable,
            color_args: (StageArg::Current, StageArg::Current),
            alpha_op: StageOp::Disable,
            alpha_args: (StageArg::Current, StageArg::Current),
            tex_coord: TexCoordSource::Uv(0),
            clamp: ClampFlags::empty(),
            projected: false,
        }
    }

    /// True when the stage is off
    pub fn is_disabled(&self) -> bool {
        self.color_op == StageOp::Disable
    }
}

/// One requested backend state transition
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StateChange {
    /// Depth mode
    ZMode(ZMode),
    /// Culling
    Cull(CullMode),
    /// Framebuffer blending and alpha test
    Blend(BlendState),
    /// Channel write mask
    ColorWrite(ColorWriteMask),
    /// Fog
    Fog(FogState),
    /// A texture stage
    Stage(u32, StageState),
}

impl StateChange {
    /// The category this change belongs to
    pub fn category(&self) -> StateCategory {
        match self {
            Self::ZMode(_) => StateCategory::ZMode,
            Self::Cull(_) => StateCategory::Cull,
            Self::Blend(_) => StateCategory::Blend,
            Self::ColorWrite(_) => StateCategory::ColorWrite,
            Self::Fog(_) => StateCategory::Fog,
            Self::Stage(stage, _) => StateCategory::Stage(*stage),
        }
    }
}

/// Logical state categories diffed independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateCategory {
    /// Depth mode
    ZMode,
    /// Culling
    Cull,
    /// Blending
    Blend,
    /// Write mask
    ColorWrite,
    /// Fog
    Fog,
    /// Texture stage N
    Stage(u32),
}
