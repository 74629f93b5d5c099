//! # Render Context
//!
//! The single object the scene layer talks to. It owns the backend device and
//! every pipeline subsystem; nothing in the pipeline is global.
//!
//! ## Frame protocol
//!
//! ```text
//! submit_shadow_caster(..)*          queue shadow requests
//! begin_frame() -> Ready | Retry     device check, eviction, shadow depth pre-pass
//!   pre_render(drawable, ..)         cull, for every drawable
//!   prep_for_render(drawable, ..)    select lights, attach shadows, for every drawable
//!   render(drawable, ..)             issue passes, for every drawable
//! end_frame() -> presented
//! ```
//!
//! All visible drawables finish the first two phases before any is rendered,
//! so callers can sort across drawables in between.

use super::controller::{DevicePoll, FrameController};
use super::{DeviceObserver, FrameStats, FrameStatus};
use crate::config::{DisplayParams, PipelineConfig};
use crate::foundation::math::{Mat4, Vec3};
use crate::foundation::time::{Clock, SystemClock};
use crate::render::api::{
    BackendHandle, DeviceCaps, DeviceError, DeviceFactory, DrawCall, GraphicsDevice, MemoryPool,
    PresentResult, TransformSlot,
};
use crate::render::lighting::{Light, LightId, LightProps, LightSelector, LightSet};
use crate::render::material::{DiffuseMode, LayerTexture, Material, MaterialCompositor, PassPlan};
use crate::render::prim::RenderPrim;
use crate::render::resources::{DeviceResourceCache, ResourceError, ResourceId};
use crate::render::shadow::{ShadowCaster, ShadowSubsystem};
use crate::render::skinning::{Skinner, SkinningError};
use crate::render::state::{
    BlendState, ClampFlags, ColorWriteMask, FogState, StageArg, StageOp, StageState, StateChange,
    StateTracker, TexCoordSource, ZMode,
};
use crate::render::{RenderError, RenderResult};
use crate::scene::{Drawable, Span, SpanProps, SpanRef, VisRegionFilter};
use crate::spatial::{Occluder, VisibilityCuller};
use std::rc::Rc;
use std::sync::Arc;

/// Viewer transforms for the frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    /// World to camera
    pub view: Mat4,
    /// Camera to clip
    pub projection: Mat4,
}

impl Default for Camera {
    fn default() -> Self {
        Self { view: Mat4::identity(), projection: Mat4::identity() }
    }
}

impl Camera {
    /// Camera from a view and a projection matrix
    pub fn new(view: Mat4, projection: Mat4) -> Self {
        Self { view, projection }
    }

    /// Camera to world; identity for a degenerate view
    pub fn camera_to_world(&self) -> Mat4 {
        self.view.try_inverse().unwrap_or_else(Mat4::identity)
    }

    /// World-space eye position
    pub fn eye(&self) -> Vec3 {
        let inverse = self.camera_to_world();
        Vec3::new(inverse[(0, 3)], inverse[(1, 3)], inverse[(2, 3)])
    }

    /// World to clip
    pub fn view_projection(&self) -> Mat4 {
        self.projection * self.view
    }
}

/// What happened to one span in `render`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpanOutcome {
    Rendered,
    Skipped,
    Aborted,
}

/// # Render Context
///
/// Owns the device, the resource cache, the state tracker and every
/// rendering subsystem, and drives them through the frame protocol.
///
/// ## Responsibilities
///
/// - **Lifecycle**: device creation with a reduced-mode fallback, scene
///   load in two allocation phases, device-loss recovery
/// - **Frame sequencing**: shadow pre-pass, culling, light selection and
///   material passes in the documented order
/// - **Scoped overrides**: render target and override material stacks
///
/// Failures below the frame level are logged and skipped; only device loss
/// interrupts a frame.
pub struct RenderContext<D: GraphicsDevice> {
    device: D,
    config: PipelineConfig,
    display: DisplayParams,
    caps: DeviceCaps,

    cache: DeviceResourceCache,
    tracker: StateTracker,
    compositor: MaterialCompositor,
    lights: LightSet,
    selector: LightSelector,
    shadows: ShadowSubsystem,
    culler: VisibilityCuller,
    skinner: Skinner,
    frames: FrameController,

    prim: RenderPrim,
    camera: Camera,
    fog: FogState,
    vis_filter: VisRegionFilter,
    target_stack: Vec<ResourceId>,
    override_stack: Vec<Arc<Material>>,
    observers: Vec<Rc<dyn DeviceObserver>>,

    /// Light slots possibly enabled on the device
    enabled_light_slots: u32,
    /// The outermost frame opened a scene on the device
    frame_open: bool,
    stats: FrameStats,
    last_stats: FrameStats,
}

impl<D: GraphicsDevice> RenderContext<D> {
    /// Create the master device and every subsystem
    ///
    /// Creation is retried once with [`DisplayParams::reduced`] when the
    /// configured parameters fail. Failure of both is the only fatal error
    /// the pipeline produces.
    pub fn create<F>(factory: &mut F, config: PipelineConfig) -> RenderResult<Self>
    where
        F: DeviceFactory<Device = D>,
    {
        Self::create_with_clock(factory, config, Box::new(SystemClock::new()))
    }

    /// [`create`](Self::create) with an explicit wall-clock source
    pub fn create_with_clock<F>(factory: &mut F, config: PipelineConfig, clock: Box<dyn Clock>) -> RenderResult<Self>
    where
        F: DeviceFactory<Device = D>,
    {
        let (device, display) = match factory.create_device(&config.display) {
            Ok(device) => (device, config.display.clone()),
            Err(first) => {
                let reduced = DisplayParams::reduced();
                if config.display == reduced {
                    return Err(RenderError::InitializationFailed(format!("no usable graphics device: {first}")));
                }
                log::warn!(
                    "Device creation failed at {}x{}x{}: {first}; retrying with reduced parameters",
                    config.display.width,
                    config.display.height,
                    config.display.color_depth
                );
                let device = factory.create_device(&reduced).map_err(|second| {
                    RenderError::InitializationFailed(format!(
                        "no usable graphics device: {first}; reduced mode: {second}"
                    ))
                })?;
                (device, reduced)
            }
        };

        let caps = device.caps().clone();
        log::info!(
            "Render context created: {}x{}, {} texture stages, {} lights, flags {:?}",
            display.width,
            display.height,
            caps.max_simultaneous_textures,
            caps.max_lights,
            caps.flags
        );

        let mut cache = DeviceResourceCache::new();
        let shadows = ShadowSubsystem::new(config.shadows.clone(), &mut cache);
        Ok(Self {
            selector: LightSelector::new(config.lighting.clone(), &caps),
            compositor: MaterialCompositor::new(&config.compositor),
            frames: FrameController::new(config.memory.clone(), clock),
            device,
            display,
            enabled_light_slots: caps.max_lights,
            caps,
            cache,
            tracker: StateTracker::new(),
            lights: LightSet::new(),
            shadows,
            culler: VisibilityCuller::new(),
            skinner: Skinner::new(),
            prim: RenderPrim::default(),
            camera: Camera::default(),
            fog: FogState::Disabled,
            vis_filter: VisRegionFilter::all(),
            target_stack: Vec::new(),
            override_stack: Vec::new(),
            observers: Vec::new(),
            frame_open: false,
            stats: FrameStats::default(),
            last_stats: FrameStats::default(),
            config,
        })
    }

    // ---- Scene load -------------------------------------------------------

    /// Allocate device resources for a scene in two phases
    ///
    /// Phase 1 vacates the unmanaged pool, evicts managed memory and
    /// allocates every unmanaged resource (shadow targets, dynamic vertex
    /// buffers). Phase 2 creates the drawables' managed geometry. Textures
    /// are created on first use.
    pub fn load_scene(&mut self, drawables: &[&dyn Drawable]) -> RenderResult<()> {
        if self.frames.depth() > 0 {
            return Err(RenderError::RenderingFailed("scene load inside an open frame".to_string()));
        }
        self.frames.begin_scene_load();
        let result = self.allocate_scene(drawables);
        self.frames.finish_scene_load();
        if matches!(result, Err(RenderError::DeviceLost)) {
            self.frames.mark_device_lost();
        }
        result
    }

    fn allocate_scene(&mut self, drawables: &[&dyn Drawable]) -> RenderResult<()> {
        self.cache.release_pool(&mut self.device, MemoryPool::Unmanaged);
        self.cache.begin_unmanaged_phase(&mut self.device);

        self.shadows.release_targets(&mut self.cache, &mut self.device);
        match self.shadows.allocate_targets(&mut self.cache, &mut self.device) {
            Ok(count) => log::debug!("Allocated {count} shadow targets"),
            Err(ResourceError::DeviceLost) => return Err(RenderError::DeviceLost),
            Err(e) => log::warn!("Shadow targets unavailable: {e}"),
        }

        for group in drawables.iter().flat_map(|drawable| drawable.buffer_groups()) {
            let vertex_buffer = group.keys().vertex_buffer;
            if self.cache.pool_of(vertex_buffer) == Some(MemoryPool::Unmanaged) {
                keep_going(self.cache.get_or_create(&mut self.device, vertex_buffer, group.vertex_bytes()))?;
            }
        }
        self.restore_unmanaged()?;
        self.cache.finish_unmanaged_phase();

        for group in drawables.iter().flat_map(|drawable| drawable.buffer_groups()) {
            keep_going(group.bind(&mut self.device, &mut self.cache))?;
        }

        log::info!(
            "Scene loaded: {} drawables, {} resources, {} bytes resident",
            drawables.len(),
            self.cache.len(),
            self.cache.allocated_bytes()
        );
        Ok(())
    }

    /// Create every unmanaged resource that has no live handle. Must run in
    /// the unmanaged phase.
    fn restore_unmanaged(&mut self) -> RenderResult<()> {
        for id in self.cache.ids_in_pool(MemoryPool::Unmanaged) {
            keep_going(self.cache.get_or_create(&mut self.device, id, &[]))?;
        }
        Ok(())
    }

    // ---- Frame ------------------------------------------------------------

    /// Open a frame
    ///
    /// Returns [`FrameStatus::Retry`] while the device is lost and cannot be
    /// reset yet; nothing reaches the backend in that case. On the call that
    /// resets a lost device the frame opens normally after observers were
    /// told about the recreation. A nested call only deepens the frame.
    pub fn begin_frame(&mut self) -> FrameStatus {
        if self.frames.depth() > 0 {
            self.frames.enter_frame();
            return FrameStatus::Ready;
        }

        match self.frames.poll_device(&mut self.device) {
            DevicePoll::Healthy => {}
            DevicePoll::Lost => {
                log::debug!("Device lost and not resettable yet, skipping frame");
                return FrameStatus::Retry;
            }
            DevicePoll::NeedsReset => {
                if !self.recover_device() {
                    return FrameStatus::Retry;
                }
            }
        }

        if self.frames.should_evict(self.cache.managed_bytes_seen()) {
            self.device.evict_managed_resources();
            self.cache.reset_managed_bytes_seen();
        }

        let Some(frame) = self.frames.enter_frame() else {
            return FrameStatus::Ready;
        };
        self.cache.set_frame(frame);

        if let Err(e) = self.device.begin_scene() {
            log::warn!("BeginScene failed: {e}");
            if e == DeviceError::DeviceLost {
                self.frames.mark_device_lost();
            }
            self.frames.leave_frame();
            return FrameStatus::Retry;
        }
        self.frame_open = true;

        self.selector.begin_frame(&self.lights, &self.vis_filter);
        match self.shadows.preprocess_all(&mut self.device, &mut self.cache, &mut self.tracker, &self.lights) {
            Ok(0) => {}
            Ok(count) => log::trace!("Frame {}: {count} shadow maps rendered", frame.0),
            Err(ResourceError::DeviceLost) => self.frames.mark_device_lost(),
            Err(e) => log::warn!("Shadow pre-pass failed: {e}"),
        }

        // The shadow pre-pass leaves light-space transforms behind
        self.upload_camera();
        FrameStatus::Ready
    }

    /// Close a frame. Returns `true` when the outermost frame was presented.
    pub fn end_frame(&mut self) -> bool {
        if !self.frames.leave_frame() {
            return false;
        }

        if !self.target_stack.is_empty() {
            log::warn!("{} render target(s) still pushed at EndFrame, unwinding", self.target_stack.len());
            self.target_stack.clear();
            self.device.set_render_target(None);
            self.tracker.force_reapply();
        }
        if !self.override_stack.is_empty() {
            log::warn!("{} override material(s) still pushed at EndFrame, unwinding", self.override_stack.len());
            self.override_stack.clear();
        }

        let mut presented = false;
        if self.frame_open {
            self.device.end_scene();
            if !self.frames.is_device_lost() {
                match self.device.present() {
                    PresentResult::Presented => presented = true,
                    PresentResult::DeviceLost => self.frames.mark_device_lost(),
                }
            }
        }
        self.frame_open = false;

        let frame = self.frames.frame();
        self.shadows.end_frame();
        self.skinner.prune_before(frame);

        self.stats.state = self.tracker.take_stats();
        self.stats.shadows = self.shadows.take_stats();
        log::trace!("Frame {}: {}", frame.0, self.stats);
        self.last_stats = std::mem::take(&mut self.stats);
        presented
    }

    /// Reset the device with new display parameters
    ///
    /// A no-op when `params` match the current parameters. Otherwise the
    /// unmanaged pool is vacated, the device reset (falling back to the
    /// reduced parameters), unmanaged resources recreated and observers
    /// notified.
    pub fn reset_display_mode(&mut self, params: DisplayParams) -> RenderResult<()> {
        if params == self.display && !self.frames.is_device_lost() {
            log::debug!("Display mode unchanged, nothing to reset");
            return Ok(());
        }
        if self.frames.depth() > 0 {
            return Err(RenderError::RenderingFailed("display reset inside an open frame".to_string()));
        }

        self.cache.release_pool(&mut self.device, MemoryPool::Unmanaged);
        match self.reset_with_fallback(&params) {
            Ok(applied) => {
                self.display = applied;
                self.rebuild_after_reset();
                Ok(())
            }
            Err(e) => {
                self.frames.mark_device_lost();
                Err(e.into())
            }
        }
    }

    fn recover_device(&mut self) -> bool {
        log::info!("Resetting lost device");
        self.cache.release_pool(&mut self.device, MemoryPool::Unmanaged);
        let params = self.display.clone();
        match self.reset_with_fallback(&params) {
            Ok(applied) => {
                self.display = applied;
                self.rebuild_after_reset();
                true
            }
            Err(e) => {
                log::warn!("Device reset failed: {e}");
                false
            }
        }
    }

    fn reset_with_fallback(&mut self, params: &DisplayParams) -> Result<DisplayParams, DeviceError> {
        match self.device.reset(params) {
            Ok(()) => Ok(params.clone()),
            Err(DeviceError::DeviceLost) => Err(DeviceError::DeviceLost),
            Err(e) => {
                let reduced = DisplayParams::reduced();
                if *params == reduced {
                    return Err(e);
                }
                log::warn!("Reset to {}x{} failed: {e}; falling back to reduced mode", params.width, params.height);
                self.device.reset(&reduced).map(|()| reduced)
            }
        }
    }

    fn rebuild_after_reset(&mut self) {
        self.caps = self.device.caps().clone();
        self.selector.set_caps(&self.caps);

        self.cache.begin_unmanaged_phase(&mut self.device);
        if let Err(e) = self.shadows.restore_targets(&mut self.cache, &mut self.device) {
            log::warn!("Shadow targets not restored: {e}");
        }
        if let Err(e) = self.restore_unmanaged() {
            log::warn!("Unmanaged resources not restored: {e}");
        }
        self.cache.finish_unmanaged_phase();

        self.tracker.reset();
        self.tracker.force_reapply();
        self.enabled_light_slots = self.caps.max_lights;
        self.frames.mark_device_restored();

        log::info!(
            "Device recreated at {}x{}, notifying {} observer(s)",
            self.display.width,
            self.display.height,
            self.observers.len()
        );
        for observer in &self.observers {
            observer.device_recreated(&self.caps);
        }
    }

    // ---- Per-drawable phases ---------------------------------------------

    /// Phase 1: collect the drawable's visible spans into `vis_list`.
    /// Returns whether anything is visible.
    pub fn pre_render(&mut self, drawable: &dyn Drawable, vis_list: &mut Vec<usize>, filter: &VisRegionFilter) -> bool {
        vis_list.clear();
        if !self.frame_open {
            return false;
        }
        vis_list.extend(self.culler.harvest(drawable, filter));
        !vis_list.is_empty()
    }

    /// Phase 2: select lights and attach shadows for every visible span
    pub fn prep_for_render(&mut self, drawable: &mut dyn Drawable, vis_list: &[usize], filter: &VisRegionFilter) {
        if !self.frame_open {
            return;
        }
        let key = drawable.key();
        let blended: Vec<bool> = vis_list
            .iter()
            .map(|&index| match self.override_stack.last() {
                Some(material) => material.is_blended(),
                None => drawable
                    .spans()
                    .get(index)
                    .and_then(|span| drawable.material(span.material))
                    .is_some_and(|material| material.is_blended()),
            })
            .collect();

        for (&index, base_blended) in vis_list.iter().zip(blended) {
            let Some(span) = drawable.spans_mut().get_mut(index) else {
                continue;
            };
            span.clear_frame_state();
            if !filter.admits(span.vis_regions) {
                continue;
            }
            let at = SpanRef { drawable: key, span: index };
            let selection = self.selector.select(&self.lights, span, at);
            span.lights = selection.lights;
            span.projectors = selection.projectors;
            self.shadows.attach_receivers(span, at, base_blended, &self.caps);
        }
    }

    /// Phase 3: draw the visible spans
    ///
    /// Blended (`PARTIAL_SORT`) spans draw after the rest, farthest first.
    /// Spans with missing data or failed allocations are skipped. Returns
    /// [`RenderError::DeviceLost`] when the device was lost during the call;
    /// later calls in the frame are no-ops.
    pub fn render(&mut self, drawable: &dyn Drawable, vis_list: &[usize]) -> RenderResult<()> {
        if !self.frame_open || self.frames.is_device_lost() || vis_list.is_empty() {
            return Ok(());
        }

        let spans = drawable.spans();
        if vis_list.iter().any(|&index| spans.get(index).is_some_and(|span| span.has(SpanProps::SKINNED))) {
            match self.skinner.skin_drawable(&mut self.device, &mut self.cache, drawable, self.frames.frame()) {
                Ok(true) => self.stats.skinned_drawables += 1,
                Ok(false) => {}
                Err(SkinningError::Upload(ResourceError::DeviceLost)) => {
                    self.frames.mark_device_lost();
                    return Err(RenderError::DeviceLost);
                }
                Err(e) => log::warn!("Skinning {:?} failed: {e}", drawable.key()),
            }
        }

        for index in self.draw_order(spans, vis_list) {
            match self.render_span(drawable, &spans[index], index) {
                Ok(SpanOutcome::Rendered) => self.stats.spans_rendered += 1,
                Ok(SpanOutcome::Skipped) => self.stats.spans_skipped += 1,
                Ok(SpanOutcome::Aborted) => self.stats.spans_aborted += 1,
                Err(ResourceError::DeviceLost) => {
                    self.frames.mark_device_lost();
                    return Err(RenderError::DeviceLost);
                }
                Err(e) => {
                    log::warn!("Skipping span {index} of {:?}: {e}", drawable.key());
                    self.stats.spans_skipped += 1;
                }
            }
        }
        Ok(())
    }

    fn draw_order(&self, spans: &[Span], vis_list: &[usize]) -> Vec<usize> {
        let (mut sorted, mut order): (Vec<usize>, Vec<usize>) = vis_list
            .iter()
            .copied()
            .filter(|&index| index < spans.len())
            .partition(|&index| spans[index].has(SpanProps::PARTIAL_SORT));

        let eye = self.camera.eye();
        let distance = |index: usize| (spans[index].world_bounds.center() - eye).norm_squared();
        sorted.sort_by(|&a, &b| distance(b).total_cmp(&distance(a)));
        order.extend(sorted);
        order
    }

    fn render_span(&mut self, drawable: &dyn Drawable, span: &Span, index: usize) -> Result<SpanOutcome, ResourceError> {
        let material = match self.override_stack.last().or_else(|| drawable.material(span.material)) {
            Some(material) => Arc::clone(material),
            None => {
                log::debug!("Span {index} of {:?} has no material {}", drawable.key(), span.material);
                return Ok(SpanOutcome::Skipped);
            }
        };
        let Some(group) = drawable.buffer_group(span.buffer_group) else {
            log::debug!("Span {index} of {:?} has no buffer group {}", drawable.key(), span.buffer_group);
            return Ok(SpanOutcome::Skipped);
        };

        let passes = match self.compositor.plan_material(&material, &self.caps, self.target_stack.last().copied()) {
            Ok(passes) if passes.is_empty() => return Ok(SpanOutcome::Skipped),
            Ok(passes) => passes,
            Err(abort) => {
                log::debug!("Material '{}' aborted span {index}: {abort}", material.name);
                return Ok(SpanOutcome::Aborted);
            }
        };

        let binding = group.bind(&mut self.device, &mut self.cache)?;
        self.device.bind_geometry(&binding);
        self.device.set_transform(TransformSlot::World, &span.local_to_world);

        let draw = span.draw_call();
        let mut lights_dirty = true;
        for plan in &passes {
            if lights_dirty {
                self.selector.apply(&mut self.device, &self.lights, &span.lights, &mut self.enabled_light_slots);
                lights_dirty = false;
            }
            match self.apply_pass(plan) {
                Ok(()) => {}
                Err(ResourceError::DeviceLost) => return Err(ResourceError::DeviceLost),
                Err(e) => {
                    log::warn!("Pass at layer {} of '{}' skipped: {e}", plan.first_layer, material.name);
                    continue;
                }
            }
            self.issue_draw(&draw)?;
            self.stats.passes += 1;

            if plan.diffuse == DiffuseMode::NextPass {
                self.diffuse_pass(&draw)?;
            }
            lights_dirty |= self.projector_passes(span, false)?;
        }

        if !span.shadow_bits.is_empty() && self.prim == RenderPrim::TriList {
            let camera_to_world = self.camera.camera_to_world();
            self.shadows.project_onto(&mut self.device, &mut self.cache, &mut self.tracker, span, &camera_to_world)?;
            // Projection repurposes the light slots
            self.enabled_light_slots = self.caps.max_lights;
        }
        self.projector_passes(span, true)?;
        Ok(SpanOutcome::Rendered)
    }

    fn issue_draw(&mut self, draw: &DrawCall) -> Result<(), ResourceError> {
        if self.prim.draw(&mut self.device, draw)? {
            self.stats.draw_calls += 1;
        }
        Ok(())
    }

    fn apply_pass(&mut self, plan: &PassPlan) -> Result<(), ResourceError> {
        let fog = if plan.no_fog { FogState::Disabled } else { self.fog };
        let tracker = &mut self.tracker;
        let device = &mut self.device;
        tracker.apply(device, StateChange::ZMode(plan.z_mode));
        tracker.apply(device, StateChange::Cull(plan.cull));
        tracker.apply(device, StateChange::Blend(plan.blend));
        tracker.apply(device, StateChange::ColorWrite(ColorWriteMask::all()));
        tracker.apply(device, StateChange::Fog(fog));

        for (stage, stage_plan) in (0u32..).zip(&plan.stages) {
            tracker.apply(device, StateChange::Stage(stage, stage_plan.state));
            let texture = match &stage_plan.texture {
                Some(texture) => Some(resolve_texture(&mut self.cache, device, texture)?),
                None => None,
            };
            device.bind_texture(stage, texture);
            device.set_transform(TransformSlot::Texture(stage), &stage_plan.transform.unwrap_or_else(Mat4::identity));
        }
        tracker.seal_stages(device, plan.stage_count());
        Ok(())
    }

    /// Multiply vertex lighting over what the previous pass drew
    fn diffuse_pass(&mut self, draw: &DrawCall) -> Result<(), ResourceError> {
        let tracker = &mut self.tracker;
        let device = &mut self.device;
        tracker.apply(device, StateChange::ZMode(ZMode::test_only()));
        tracker.apply(device, StateChange::Blend(BlendState::multiply()));
        tracker.apply(
            device,
            StateChange::Stage(
                0,
                StageState {
                    color_op: StageOp::SelectArg1,
                    color_args: (StageArg::Diffuse, StageArg::Current),
                    alpha_op: StageOp::SelectArg1,
                    alpha_args: (StageArg::Diffuse, StageArg::Current),
                    ..StageState::disabled()
                },
            ),
        );
        tracker.seal_stages(device, 1);
        device.bind_texture(0, None);
        self.issue_draw(draw)?;
        self.stats.passes += 1;
        Ok(())
    }

    /// Add the span's projective lights. `overall` selects the projectors
    /// drawn once after every pass instead of after each pass. Returns
    /// whether the light slots were changed.
    fn projector_passes(&mut self, span: &Span, overall: bool) -> Result<bool, ResourceError> {
        let camera_to_world = self.camera.camera_to_world();
        let mut touched = false;
        for chosen in &span.projectors {
            let Some(light) = self.lights.get(chosen.light) else {
                continue;
            };
            if light.props.contains(LightProps::OVERALL) != overall {
                continue;
            }
            let Some(projection) = &light.projection else {
                continue;
            };
            let texture = match resolve_texture(&mut self.cache, &mut self.device, &projection.texture) {
                Ok(handle) => handle,
                Err(ResourceError::DeviceLost) => return Err(ResourceError::DeviceLost),
                Err(e) => {
                    log::warn!("Projector texture unavailable: {e}");
                    continue;
                }
            };

            self.selector.apply(&mut self.device, &self.lights, std::slice::from_ref(chosen), &mut self.enabled_light_slots);
            touched = true;

            let tracker = &mut self.tracker;
            let device = &mut self.device;
            tracker.apply(device, StateChange::ZMode(ZMode::test_only()));
            tracker.apply(device, StateChange::Blend(BlendState::additive()));
            tracker.apply(device, StateChange::Fog(FogState::Disabled));
            tracker.apply(
                device,
                StateChange::Stage(
                    0,
                    StageState {
                        color_op: StageOp::Modulate,
                        color_args: (StageArg::Texture, StageArg::Diffuse),
                        alpha_op: StageOp::SelectArg1,
                        alpha_args: (StageArg::Texture, StageArg::Current),
                        tex_coord: TexCoordSource::CameraPosition,
                        clamp: ClampFlags::UV,
                        projected: true,
                    },
                ),
            );
            tracker.seal_stages(device, 1);
            device.set_transform(TransformSlot::Texture(0), &(projection.world_to_texture * camera_to_world));
            device.bind_texture(0, Some(texture));

            self.issue_draw(&span.draw_call())?;
            self.stats.projector_passes += 1;
        }
        Ok(touched)
    }

    // ---- Shadows, lights, camera -------------------------------------------

    /// Queue a shadow caster for the next frame's pre-pass. Must be called
    /// between frames; returns whether the request was accepted.
    pub fn submit_shadow_caster(&mut self, caster: ShadowCaster) -> bool {
        if self.frames.depth() > 0 {
            log::warn!("Shadow caster submitted inside a frame; submit before BeginFrame");
            return false;
        }
        self.shadows.submit(caster, &self.lights, &self.caps, &self.cache)
    }

    /// Add a runtime light
    pub fn add_light(&mut self, light: Light) -> LightId {
        self.lights.insert(light)
    }

    /// Remove a runtime light
    pub fn remove_light(&mut self, id: LightId) -> Option<Light> {
        self.lights.remove(id)
    }

    /// Edit a light in place
    pub fn light_mut(&mut self, id: LightId) -> Option<&mut Light> {
        self.lights.get_mut(id)
    }

    /// Every runtime light
    pub fn lights(&self) -> &LightSet {
        &self.lights
    }

    /// Set the viewer; takes effect immediately and for culling
    pub fn set_camera(&mut self, camera: Camera) {
        self.camera = camera;
        self.culler.set_view(camera.view_projection(), camera.eye());
        if self.frame_open {
            self.upload_camera();
        }
    }

    /// Current viewer
    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    fn upload_camera(&mut self) {
        self.device.set_transform(TransformSlot::View, &self.camera.view);
        self.device.set_transform(TransformSlot::Projection, &self.camera.projection);
    }

    /// Fog applied to passes whose base layer allows it
    pub fn set_fog(&mut self, fog: FogState) {
        self.fog = fog;
    }

    /// Region filter applied to light candidates from the next frame on
    pub fn set_vis_region_filter(&mut self, filter: VisRegionFilter) {
        self.vis_filter = filter;
    }

    /// Choose between drawing and the no-draw debug path
    pub fn set_render_prim(&mut self, prim: RenderPrim) {
        self.prim = prim;
    }

    /// Add an occluder to the cull tree
    pub fn add_occluder(&mut self, occluder: Occluder) {
        self.culler.add_occluder(occluder);
    }

    /// Drop every occluder
    pub fn clear_occluders(&mut self) {
        self.culler.clear_occluders();
    }

    // ---- Scoped overrides -------------------------------------------------

    /// Redirect rendering into `target` until the matching pop
    pub fn push_render_target(&mut self, target: ResourceId) -> RenderResult<()> {
        let handle = self.cache.get_or_create(&mut self.device, target, &[])?;
        self.device.set_render_target(Some(handle));
        self.target_stack.push(target);
        Ok(())
    }

    /// Restore the previous render target
    pub fn pop_render_target(&mut self) -> Option<ResourceId> {
        let Some(popped) = self.target_stack.pop() else {
            log::warn!("PopRenderTarget with an empty stack");
            return None;
        };
        let restored: Option<BackendHandle> = self.target_stack.last().and_then(|id| self.cache.handle(*id));
        self.device.set_render_target(restored);
        self.tracker.force_reapply();
        Some(popped)
    }

    /// Render every span with `material` until the matching pop
    pub fn push_override_material(&mut self, material: Arc<Material>) {
        self.override_stack.push(material);
    }

    /// Restore the previous override material, if any
    pub fn pop_override_material(&mut self) -> Option<Arc<Material>> {
        let popped = self.override_stack.pop();
        if popped.is_none() {
            log::warn!("PopOverrideMaterial with an empty stack");
        }
        popped
    }

    // ---- Observers and accessors -------------------------------------------

    /// Register for the device-recreated broadcast
    pub fn add_observer(&mut self, observer: Rc<dyn DeviceObserver>) {
        self.observers.push(observer);
    }

    /// The backend device
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Mutable access to the backend
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Capabilities of the current device
    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    /// Display parameters in effect
    pub fn display(&self) -> &DisplayParams {
        &self.display
    }

    /// Pipeline settings
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Resource cache, for registering textures and targets
    pub fn cache_mut(&mut self) -> &mut DeviceResourceCache {
        &mut self.cache
    }

    /// Device resource cache
    pub fn cache(&self) -> &DeviceResourceCache {
        &self.cache
    }

    /// State tracker
    pub fn tracker(&self) -> &StateTracker {
        &self.tracker
    }

    /// Shadow subsystem
    pub fn shadows(&self) -> &ShadowSubsystem {
        &self.shadows
    }

    /// Light selector
    pub fn selector(&self) -> &LightSelector {
        &self.selector
    }

    /// Frame protocol state
    pub fn frames(&self) -> &FrameController {
        &self.frames
    }

    /// Statistics of the last completed frame
    pub fn stats(&self) -> FrameStats {
        self.last_stats
    }
}

impl<D: GraphicsDevice> Drop for RenderContext<D> {
    fn drop(&mut self) {
        self.shadows.release_targets(&mut self.cache, &mut self.device);
        self.cache.release_all(&mut self.device);
    }
}

/// Log allocation failures and carry on; only device loss stops the caller
fn keep_going<T>(result: Result<T, ResourceError>) -> RenderResult<()> {
    match result {
        Ok(_) => Ok(()),
        Err(ResourceError::DeviceLost) => Err(RenderError::DeviceLost),
        Err(e) => {
            log::warn!("{e}");
            Ok(())
        }
    }
}

fn resolve_texture(
    cache: &mut DeviceResourceCache,
    device: &mut dyn GraphicsDevice,
    texture: &LayerTexture,
) -> Result<BackendHandle, ResourceError> {
    match texture {
        LayerTexture::Static(texture) => cache.get_or_create(device, texture.id(), texture.pixels()),
        LayerTexture::RenderTarget(id) => cache.get_or_create(device, *id, &[]),
        LayerTexture::Missing(name) => Err(ResourceError::Backend(format!("unresolved texture '{name}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Mat4Ext;
    use crate::render::backends::{DeviceCall, RecordingDevice, RecordingFactory};
    use crate::render::material::{BlendFlags, Layer, Texture};
    use crate::scene::{BufferGroup, DrawableKey, SpanCollection, Vertex, AABB};

    fn quad(cache: &mut DeviceResourceCache) -> Arc<BufferGroup> {
        let vertices = vec![
            Vertex::new([-1.0, -1.0, 0.0], [0.0, 0.0, 1.0], [0.0, 0.0]),
            Vertex::new([1.0, -1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0]),
            Vertex::new([1.0, 1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 1.0]),
            Vertex::new([-1.0, 1.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0]),
        ];
        Arc::new(BufferGroup::new(cache, "quad", vertices, vec![0, 1, 2, 0, 2, 3]))
    }

    fn context() -> RenderContext<RecordingDevice> {
        let mut factory = RecordingFactory::new(DeviceCaps::default());
        RenderContext::create(&mut factory, PipelineConfig::default()).expect("Should create context")
    }

    fn scene(ctx: &mut RenderContext<RecordingDevice>, spans: Vec<Span>) -> SpanCollection {
        let group = quad(ctx.cache_mut());
        let texture = Arc::new(Texture::new(ctx.cache_mut(), "white", 1, 1, vec![255; 4]));
        let mut builder = SpanCollection::builder(DrawableKey(1))
            .with_buffer_group(group)
            .with_material(Arc::new(Material::new("plain", vec![Layer::textured(texture)])));
        for span in spans {
            builder = builder.with_span(span);
        }
        builder.build()
    }

    fn span_at(z: f32) -> Span {
        Span::new(0, 0, AABB::from_center_extents(Vec3::new(0.0, 0.0, z), Vec3::new(1.0, 1.0, 0.1)))
            .with_indices(0, 6)
    }

    fn render_all(ctx: &mut RenderContext<RecordingDevice>, drawable: &mut SpanCollection) {
        let mut visible = Vec::new();
        let filter = VisRegionFilter::all();
        ctx.pre_render(drawable, &mut visible, &filter);
        ctx.prep_for_render(drawable, &visible, &filter);
        ctx.render(drawable, &visible).expect("Should render");
    }

    #[test]
    fn test_creation_falls_back_to_reduced_mode() {
        let mut factory = RecordingFactory::new(DeviceCaps::default()).reject_mode(DisplayParams::default());
        let ctx = RenderContext::create(&mut factory, PipelineConfig::default()).expect("Should fall back");
        assert!(ctx.display().is_reduced());

        let mut hopeless = RecordingFactory::new(DeviceCaps::default())
            .reject_mode(DisplayParams::default())
            .reject_mode(DisplayParams::reduced());
        let result = RenderContext::create(&mut hopeless, PipelineConfig::default());
        assert!(matches!(result, Err(RenderError::InitializationFailed(_))));
    }

    #[test]
    fn test_partial_sort_spans_draw_last_back_to_front() {
        let mut ctx = context();
        let mut drawable = scene(
            &mut ctx,
            vec![
                span_at(-2.0).with_props(SpanProps::PARTIAL_SORT).with_indices(0, 3),
                span_at(-10.0).with_props(SpanProps::PARTIAL_SORT).with_indices(3, 3),
                span_at(-5.0).with_indices(0, 6),
            ],
        );
        ctx.load_scene(&[&drawable]).expect("Should load");
        ctx.set_camera(Camera::new(
            Mat4::look_at(Vec3::zeros(), Vec3::new(0.0, 0.0, -1.0), Vec3::y()),
            Mat4::perspective(1.2, 1.0, 0.1, 100.0),
        ));

        assert_eq!(ctx.begin_frame(), FrameStatus::Ready);
        ctx.device_mut().clear_calls();
        render_all(&mut ctx, &mut drawable);

        let draws: Vec<(u32, u32)> = ctx
            .device()
            .calls()
            .iter()
            .filter_map(|call| match call {
                DeviceCall::Draw(draw) => Some((draw.index_start, draw.index_count)),
                _ => None,
            })
            .collect();
        // Opaque first, then the far blended span, then the near one
        assert_eq!(draws, vec![(0, 6), (3, 3), (0, 3)]);
        assert!(ctx.end_frame());
        assert_eq!(ctx.stats().spans_rendered, 3);
    }

    #[test]
    fn test_override_material_and_nil_prim() {
        let mut ctx = context();
        let mut drawable = scene(&mut ctx, vec![span_at(-5.0)]);
        ctx.load_scene(&[&drawable]).expect("Should load");
        ctx.set_render_prim(RenderPrim::Nil);

        assert_eq!(ctx.begin_frame(), FrameStatus::Ready);
        let two_layers = Material::new(
            "override",
            vec![Layer::new(None), Layer::new(None).with_blend(BlendFlags::ADD)],
        );
        ctx.push_override_material(Arc::new(two_layers));
        render_all(&mut ctx, &mut drawable);
        assert!(ctx.end_frame(), "Unbalanced override is unwound, frame still presents");

        assert_eq!(ctx.device().draw_count(), 0);
        let stats = ctx.stats();
        assert_eq!(stats.draw_calls, 0);
        assert!(stats.passes >= 1);
        assert_eq!(stats.spans_rendered, 1);
        assert!(ctx.pop_override_material().is_none());
    }

    #[test]
    fn test_nested_frames_present_once() {
        let mut ctx = context();
        assert_eq!(ctx.begin_frame(), FrameStatus::Ready);
        assert_eq!(ctx.begin_frame(), FrameStatus::Ready);
        assert!(!ctx.end_frame());
        assert!(ctx.end_frame());
        assert!(!ctx.end_frame());

        let presents = ctx.device().calls().iter().filter(|call| **call == DeviceCall::Present).count();
        assert_eq!(presents, 1);
    }

    #[test]
    fn test_render_target_stack_restores_previous() {
        let mut ctx = context();
        let first = ctx.cache_mut().register(crate::render::api::ResourceDesc {
            kind: crate::render::api::ResourceKind::RenderTarget,
            pool: MemoryPool::Unmanaged,
            byte_size: 64,
            extent: Some((4, 4)),
            label: "mirror".to_string(),
        });
        ctx.load_scene(&[]).expect("Should load");
        let handle = ctx.cache().handle(first).expect("Should allocate target at load");

        assert_eq!(ctx.begin_frame(), FrameStatus::Ready);
        ctx.push_render_target(first).expect("Should push");
        ctx.push_render_target(first).expect("Should push again");
        assert_eq!(ctx.pop_render_target(), Some(first));
        assert_eq!(ctx.device().calls().last(), Some(&DeviceCall::SetRenderTarget(Some(handle))));
        assert_eq!(ctx.pop_render_target(), Some(first));
        assert_eq!(ctx.device().calls().last(), Some(&DeviceCall::SetRenderTarget(None)));
        assert_eq!(ctx.pop_render_target(), None);
        assert!(ctx.end_frame());
    }

    #[test]
    fn test_reset_display_mode_is_noop_for_same_params() {
        let mut ctx = context();
        ctx.device_mut().clear_calls();
        ctx.reset_display_mode(DisplayParams::default()).expect("Should accept same mode");
        assert!(ctx.device().calls().is_empty());

        let wide = DisplayParams { width: 1920, height: 1080, ..DisplayParams::default() };
        ctx.reset_display_mode(wide.clone()).expect("Should reset");
        assert_eq!(ctx.display(), &wide);
        assert!(ctx.device().calls().contains(&DeviceCall::Reset(wide)));
    }
}
