//! Pass planning for multi-layer materials
//!
//! Starting at some layer, the compositor greedily folds following layers
//! into the same pass while they fit in the hardware's texture stages and
//! can legally share a pass. The caller issues one draw per plan and
//! advances by [`PassPlan::layer_count`] until every layer is consumed.
//!
//! A layer can join the current pass ("be eaten") only when it has a
//! texture, its blend does not need the framebuffer (no `NO_COLOR`, no
//! `ADD_COLOR_TIMES_ALPHA`, no alpha blend at partial opacity), it is not a
//! `TROUBLED_LONER` and it does not write depth. `RESTART_PASS_HERE` always
//! splits. A `BIND_NEXT` pair joins a pass together; when the pass has no
//! room for both, the bound layer starts the next pass. Every layer that
//! joins a pass is validated, so a bound layer sampling the current target
//! still aborts the span.
//!
//! # Diffuse modulation
//!
//! Vertex lighting multiplies the combined layers. A single layer or a run
//! of multiplying layers folds it into stage 0. Otherwise it takes a
//! trailing stage. Two-stage hardware has no stage to spare, so a second
//! layer may only join the base layer when it multiplies (diffuse folds
//! into stage 0) or when its coordinates come from vertex position (a
//! distance fade, which defers diffuse to a separate multiply pass).

use super::layer::{BlendFlags, Layer, LayerTexture, MiscFlags, ShadeFlags, ZFlags};
use super::Material;
use crate::config::CompositorConfig;
use crate::foundation::math::Mat4;
use crate::render::api::DeviceCaps;
use crate::render::resources::ResourceId;
use crate::render::state::{
    BlendState, CullMode, StageArg, StageOp, StageState, TexCoordSource, ZMode,
};
use thiserror::Error;

/// Alpha test reference used by `ALPHA_TEST` layers
const ALPHA_TEST_REF: u8 = 0x40;

/// Why a span's render was abandoned
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PassAbort {
    /// A layer samples the render target currently being drawn into
    #[error("layer {layer} samples the bound render target")]
    SelfReferencingTarget {
        /// Offending layer
        layer: usize,
    },

    /// A layer's texture could not be resolved
    #[error("layer {layer} references unresolved texture '{name}'")]
    UnresolvedLayer {
        /// Offending layer
        layer: usize,
        /// Reference that failed
        name: String,
    },
}

/// Which layer feeds a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerSlot {
    /// A material layer by index
    Material(usize),
    /// A piggyback layer by index
    Piggyback(usize),
}

/// Where vertex diffuse modulation happens in a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffuseMode {
    /// Layers ignore lighting
    None,
    /// Folded into stage 0
    Stage0,
    /// A trailing stage multiplies the combined result
    TrailingStage,
    /// A separate multiply pass follows this one
    NextPass,
}

/// One texture stage of a pass
#[derive(Debug, Clone)]
pub struct StagePlan {
    /// Source layer, `None` for the diffuse stage
    pub layer: Option<LayerSlot>,
    /// Combiner state
    pub state: StageState,
    /// Texture to bind
    pub texture: Option<LayerTexture>,
    /// Texture coordinate transform
    pub transform: Option<Mat4>,
}

/// Everything needed to issue one pass
#[derive(Debug, Clone)]
pub struct PassPlan {
    /// First material layer drawn
    pub first_layer: usize,
    /// Material layers consumed by this pass
    pub layer_count: usize,
    /// Texture stages in order; the stage after the last is sealed
    pub stages: Vec<StagePlan>,
    /// Framebuffer blend
    pub blend: BlendState,
    /// Depth mode
    pub z_mode: ZMode,
    /// Face culling
    pub cull: CullMode,
    /// Diffuse placement
    pub diffuse: DiffuseMode,
    /// Skip fog for this pass
    pub no_fog: bool,
}

impl PassPlan {
    /// Number of stages used
    pub fn stage_count(&self) -> u32 {
        self.stages.len() as u32
    }
}

/// Plans rendering passes under a texture stage limit
#[derive(Debug, Clone, Default)]
pub struct MaterialCompositor {
    config: CompositorConfig,
}

impl MaterialCompositor {
    /// Create a compositor
    pub fn new(config: &CompositorConfig) -> Self {
        Self { config: config.clone() }
    }

    /// True when only base layers render
    pub fn base_layer_only(&self) -> bool {
        self.config.base_layer_only
    }

    /// Stages usable per pass on `caps`
    pub fn stage_limit(&self, caps: &DeviceCaps) -> u32 {
        let hardware = caps.max_simultaneous_textures.max(1);
        self.config.max_layers_at_once.map_or(hardware, |limit| limit.clamp(1, hardware))
    }

    /// Plan the pass starting at layer `first`
    ///
    /// `current_target` is the render target being drawn into, if any; a
    /// layer sampling it aborts the span.
    pub fn plan_pass(
        &self,
        material: &Material,
        first: usize,
        caps: &DeviceCaps,
        current_target: Option<ResourceId>,
    ) -> Result<PassPlan, PassAbort> {
        let layers = &material.layers;
        let base = layers
            .get(first)
            .ok_or_else(|| PassAbort::UnresolvedLayer { layer: first, name: "<out of range>".to_string() })?;
        Self::validate(base, first, current_target)?;

        let limit = self.stage_limit(caps);
        let piggybacks = (material.piggybacks.len() as u32).min(limit - 1);
        let budget = (limit - piggybacks) as usize;
        let legacy = limit <= 2;
        let needs_diffuse = !base.shade.contains(ShadeFlags::WHITE);

        let mut count = 1;
        let mut all_mult = true;
        let mut diffuse = if needs_diffuse { DiffuseMode::Stage0 } else { DiffuseMode::None };

        while !base.misc.contains(MiscFlags::TROUBLED_LONER) && first + count < layers.len() {
            let index = first + count;
            let next = &layers[index];
            let bound = layers[index - 1].misc.contains(MiscFlags::BIND_NEXT);

            if !bound
                && (next.misc.contains(MiscFlags::RESTART_PASS_HERE)
                    || next.uv_set().is_some_and(|set| set > caps.max_uvw_source)
                    || !Self::can_eat(next, index, current_target))
            {
                break;
            }

            // A pair joins or leaves together
            let group = if next.misc.contains(MiscFlags::BIND_NEXT) && index + 1 < layers.len() { 2 } else { 1 };
            let group_mult = layers[index..index + group].iter().all(|layer| layer.blend.contains(BlendFlags::MULT));

            let mut joined_diffuse = diffuse;
            if needs_diffuse && !(all_mult && group_mult) {
                if !legacy {
                    joined_diffuse = DiffuseMode::TrailingStage;
                } else if count == 1 && group == 1 && next.is_position_based() {
                    joined_diffuse = DiffuseMode::NextPass;
                } else {
                    break;
                }
            }

            let stages_needed = count + group + usize::from(joined_diffuse == DiffuseMode::TrailingStage);
            if stages_needed > budget {
                if bound {
                    log::debug!("Material '{}': layer {index} bound to layer {} but no stage is left", material.name, index - 1);
                }
                break;
            }

            for (offset, layer) in layers[index..index + group].iter().enumerate() {
                Self::validate(layer, index + offset, current_target)?;
            }
            count += group;
            diffuse = joined_diffuse;
            all_mult &= group_mult;
        }

        let stages = Self::build_stages(material, first, count, diffuse, piggybacks as usize);
        log::trace!(
            "Material '{}': pass at layer {first} eats {count} layer(s), {} stage(s), diffuse {:?}",
            material.name,
            stages.len(),
            diffuse
        );

        Ok(PassPlan {
            first_layer: first,
            layer_count: count,
            stages,
            blend: Self::framebuffer_blend(base),
            z_mode: Self::z_mode(base),
            cull: if base.misc.contains(MiscFlags::TWO_SIDED) { CullMode::None } else { CullMode::CounterClockwise },
            diffuse,
            no_fog: base.shade.contains(ShadeFlags::NO_FOG),
        })
    }

    /// Plan every pass of a material
    pub fn plan_material(
        &self,
        material: &Material,
        caps: &DeviceCaps,
        current_target: Option<ResourceId>,
    ) -> Result<Vec<PassPlan>, PassAbort> {
        let mut passes = Vec::new();
        let mut next = 0;
        while next < material.layer_count() {
            let pass = self.plan_pass(material, next, caps, current_target)?;
            next += pass.layer_count;
            passes.push(pass);
            if self.config.base_layer_only {
                break;
            }
        }
        Ok(passes)
    }

    fn validate(layer: &Layer, index: usize, current_target: Option<ResourceId>) -> Result<(), PassAbort> {
        match &layer.texture {
            Some(LayerTexture::Missing(name)) => {
                Err(PassAbort::UnresolvedLayer { layer: index, name: name.clone() })
            }
            Some(LayerTexture::RenderTarget(id)) if Some(*id) == current_target => {
                Err(PassAbort::SelfReferencingTarget { layer: index })
            }
            _ => Ok(()),
        }
    }

    fn can_eat(layer: &Layer, index: usize, current_target: Option<ResourceId>) -> bool {
        layer.texture.is_some()
            && Self::validate(layer, index, current_target).is_ok()
            && !layer.blend.intersects(BlendFlags::NO_COLOR | BlendFlags::ADD_COLOR_TIMES_ALPHA)
            && !layer.misc.contains(MiscFlags::TROUBLED_LONER)
            && !(layer.blend.contains(BlendFlags::ALPHA) && layer.opacity < 1.0)
            && layer.z.contains(ZFlags::NO_Z_WRITE)
    }

    fn build_stages(
        material: &Material,
        first: usize,
        count: usize,
        diffuse: DiffuseMode,
        piggybacks: usize,
    ) -> Vec<StagePlan> {
        let mut stages = Vec::with_capacity(count + material.piggybacks.len() + 1);

        let base = &material.layers[first];
        let fold = diffuse == DiffuseMode::Stage0;
        let (color_op, color_args) = match (&base.texture, fold) {
            (Some(_), true) => (StageOp::Modulate, (StageArg::Texture, StageArg::Diffuse)),
            (Some(_), false) => (StageOp::SelectArg1, (StageArg::Texture, StageArg::Current)),
            (None, true) => (StageOp::Modulate, (StageArg::Factor, StageArg::Diffuse)),
            (None, false) => (StageOp::SelectArg1, (StageArg::Factor, StageArg::Current)),
        };
        stages.push(StagePlan {
            layer: Some(LayerSlot::Material(first)),
            state: StageState {
                color_op,
                color_args,
                alpha_op: color_op,
                alpha_args: color_args,
                tex_coord: base.uvw,
                clamp: base.clamp,
                projected: base.misc.contains(MiscFlags::PROJECTED),
            },
            texture: base.texture.clone(),
            transform: base.transform,
        });

        for index in first + 1..first + count {
            let layer = &material.layers[index];
            stages.push(Self::upper_stage(layer, LayerSlot::Material(index)));
        }

        if diffuse == DiffuseMode::TrailingStage {
            stages.push(StagePlan {
                layer: None,
                state: StageState {
                    color_op: StageOp::Modulate,
                    color_args: (StageArg::Current, StageArg::Diffuse),
                    alpha_op: StageOp::Modulate,
                    alpha_args: (StageArg::Current, StageArg::Diffuse),
                    tex_coord: TexCoordSource::Uv(0),
                    clamp: base.clamp,
                    projected: false,
                },
                texture: None,
                transform: None,
            });
        }

        for (index, layer) in material.piggybacks.iter().enumerate().take(piggybacks) {
            stages.push(Self::upper_stage(layer, LayerSlot::Piggyback(index)));
        }
        stages
    }

    fn upper_stage(layer: &Layer, slot: LayerSlot) -> StagePlan {
        let (color_op, alpha_op) = if layer.blend.contains(BlendFlags::MULT) {
            (StageOp::Modulate, StageOp::Modulate)
        } else if layer.blend.contains(BlendFlags::ADD) {
            (StageOp::Add, StageOp::SelectArg1)
        } else if layer.blend.contains(BlendFlags::ALPHA) {
            (StageOp::BlendTextureAlpha, StageOp::SelectArg1)
        } else {
            (StageOp::SelectArg1, StageOp::SelectArg1)
        };
        let alpha_args = if alpha_op == StageOp::SelectArg1 {
            (StageArg::Current, StageArg::Texture)
        } else {
            (StageArg::Texture, StageArg::Current)
        };

        StagePlan {
            layer: Some(slot),
            state: StageState {
                color_op,
                color_args: (StageArg::Texture, StageArg::Current),
                alpha_op,
                alpha_args,
                tex_coord: layer.uvw,
                clamp: layer.clamp,
                projected: layer.misc.contains(MiscFlags::PROJECTED),
            },
            texture: layer.texture.clone(),
            transform: layer.transform,
        }
    }

    fn framebuffer_blend(layer: &Layer) -> BlendState {
        let blend = if layer.blend.contains(BlendFlags::ALPHA) {
            BlendState::alpha()
        } else if layer.blend.intersects(BlendFlags::ADD | BlendFlags::ADD_COLOR_TIMES_ALPHA) {
            BlendState::additive()
        } else if layer.blend.contains(BlendFlags::MULT) {
            BlendState::multiply()
        } else {
            BlendState::opaque()
        };
        if layer.blend.contains(BlendFlags::ALPHA_TEST) {
            blend.with_alpha_ref(ALPHA_TEST_REF)
        } else {
            blend
        }
    }

    fn z_mode(layer: &Layer) -> ZMode {
        let mut mode = if layer.z.contains(ZFlags::NO_Z_WRITE) { ZMode::test_only() } else { ZMode::opaque() };
        if layer.z.contains(ZFlags::NO_Z_READ) {
            mode.test = false;
        }
        if layer.z.contains(ZFlags::Z_INC) {
            mode = mode.with_bias(1);
        }
        mode
    }
}
