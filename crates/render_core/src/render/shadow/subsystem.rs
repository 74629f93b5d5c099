//! Shadow request queue, depth pre-pass and receiver projection

use super::slave::{depth_remap, LightSpace, ShadowSlave, SlaveState};
use super::ShadowCaster;
use crate::config::ShadowConfig;
use crate::foundation::math::Mat4;
use crate::render::api::{
    CapsFlags, DeviceCaps, GpuLight, GpuLightKind, GraphicsDevice, ScreenQuad, TransformSlot,
};
use crate::render::lighting::{LightKind, LightSet};
use crate::render::material::Texture;
use crate::render::resources::{DeviceResourceCache, RenderTargetPool, ResourceError, ResourceId, ResourceState};
use crate::render::state::{
    BlendState, ClampFlags, ColorWriteMask, CullMode, FogState, StageArg, StageOp, StageState,
    StateChange, StateTracker, TexCoordSource, ZMode,
};
use crate::scene::{Span, SpanProps, SpanRef};
use std::sync::Arc;

/// Texels with alpha below this lie outside the caster and are skipped
const SHADOW_ALPHA_REF: u8 = 0x80;

/// Width of the depth ramp texture
const RAMP_WIDTH: u32 = 256;

/// Shadow counters for one frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShadowStats {
    /// Requests accepted by `submit`
    pub submitted: u32,
    /// Requests rejected by `submit`
    pub rejected: u32,
    /// Slaves whose caster was rendered
    pub rendered: u32,
    /// Requests dropped during preprocessing
    pub dropped: u32,
    /// Slaves blurred
    pub blurred: u32,
    /// Blur requests that found no scratch target
    pub blur_skipped: u32,
    /// Receiver projection passes drawn
    pub projections: u32,
}

/// Owns shadow requests, the render target pool and the frame's slaves
#[derive(Debug)]
pub struct ShadowSubsystem {
    config: ShadowConfig,
    pool: RenderTargetPool,
    ramp: Arc<Texture>,
    requests: Vec<ShadowCaster>,
    slaves: Vec<ShadowSlave>,
    next_scratch: u32,
    stats: ShadowStats,
}

impl ShadowSubsystem {
    /// Create the subsystem and register its depth ramp texture
    pub fn new(config: ShadowConfig, cache: &mut DeviceResourceCache) -> Self {
        let pixels = (0..RAMP_WIDTH)
            .flat_map(|texel| {
                let depth = (texel * 255 / (RAMP_WIDTH - 1)) as u8;
                [depth, depth, depth, 0xff]
            })
            .collect();
        let ramp = Arc::new(Texture::new(cache, "shadow_depth_ramp", RAMP_WIDTH, 1, pixels));
        Self {
            pool: RenderTargetPool::new(&config),
            config,
            ramp,
            requests: Vec::new(),
            slaves: Vec::new(),
            next_scratch: 0,
            stats: ShadowStats::default(),
        }
    }

    /// Shadow settings
    pub fn config(&self) -> &ShadowConfig {
        &self.config
    }

    /// Pooled render targets
    pub fn pool(&self) -> &RenderTargetPool {
        &self.pool
    }

    /// Allocate the target pool. Must run in the cache's unmanaged phase.
    pub fn allocate_targets(
        &mut self,
        cache: &mut DeviceResourceCache,
        device: &mut dyn GraphicsDevice,
    ) -> Result<usize, ResourceError> {
        if !self.config.enabled {
            return Ok(0);
        }
        self.pool.allocate(cache, device)
    }

    /// Recreate pooled targets after a device reset. Must run in the cache's
    /// unmanaged phase.
    pub fn restore_targets(
        &mut self,
        cache: &mut DeviceResourceCache,
        device: &mut dyn GraphicsDevice,
    ) -> Result<(), ResourceError> {
        self.slaves.clear();
        self.pool.restore(cache, device)
    }

    /// Release the target pool
    pub fn release_targets(&mut self, cache: &mut DeviceResourceCache, device: &mut dyn GraphicsDevice) {
        self.pool.release(cache, device);
    }

    /// Queue a caster for the next frame. Invalid requests are ignored and
    /// `false` is returned.
    pub fn submit(
        &mut self,
        caster: ShadowCaster,
        lights: &LightSet,
        caps: &DeviceCaps,
        cache: &DeviceResourceCache,
    ) -> bool {
        if !self.accepts(&caster, lights, caps, cache) {
            self.stats.rejected += 1;
            return false;
        }
        // Ascending priority, ties in submission order
        let at = self.requests.partition_point(|queued| queued.priority <= caster.priority);
        self.requests.insert(at, caster);
        self.stats.submitted += 1;
        true
    }

    fn accepts(
        &self,
        caster: &ShadowCaster,
        lights: &LightSet,
        caps: &DeviceCaps,
        cache: &DeviceResourceCache,
    ) -> bool {
        if !self.config.enabled || !caps.supports(CapsFlags::RENDER_TO_TEXTURE) {
            return false;
        }
        let Some(light) = lights.get(caster.light) else {
            log::debug!("Shadow caster rejected: unknown light");
            return false;
        };
        if light.kind == LightKind::Point && !caps.supports(CapsFlags::PROJECTIVE_DUAL_STAGE) {
            log::debug!("Shadow caster rejected: point light shadows need projective dual-stage sampling");
            return false;
        }
        let resolvable = !caster.spans.is_empty()
            && caster.spans.iter().all(|span| {
                let keys = span.group.keys();
                cache.state(keys.vertex_buffer) != ResourceState::Released
                    && cache.state(keys.index_buffer) != ResourceState::Released
            });
        if !resolvable {
            log::debug!("Shadow caster rejected: no resolvable geometry");
        }
        resolvable
    }

    /// Requests waiting for the next preprocessing step
    pub fn pending(&self) -> usize {
        self.requests.len()
    }

    /// Slaves alive this frame
    pub fn live_slaves(&self) -> usize {
        self.slaves.len()
    }

    /// Slaves alive this frame, in processing order
    pub fn slaves(&self) -> &[ShadowSlave] {
        &self.slaves
    }

    /// Counters since the last [`take_stats`](Self::take_stats)
    pub fn stats(&self) -> ShadowStats {
        self.stats
    }

    /// Return and reset the counters
    pub fn take_stats(&mut self) -> ShadowStats {
        std::mem::take(&mut self.stats)
    }

    /// Turn every queued request into a slave and render its depth map.
    /// Requests that cannot get a target or fail to render are dropped for
    /// this frame. Only device loss is returned as an error.
    pub fn preprocess_all(
        &mut self,
        device: &mut dyn GraphicsDevice,
        cache: &mut DeviceResourceCache,
        tracker: &mut StateTracker,
        lights: &LightSet,
    ) -> Result<usize, ResourceError> {
        let requests = std::mem::take(&mut self.requests);
        if requests.is_empty() {
            return Ok(0);
        }

        let scratch_slots = self.config.scratch_lights.min(device.caps().max_lights).max(1);
        for caster in requests {
            if self.slaves.len() >= self.config.max_slaves {
                self.stats.dropped += 1;
                continue;
            }
            let Some(slave) = self.make_slave(caster, lights, scratch_slots) else {
                self.stats.dropped += 1;
                continue;
            };
            self.slaves.push(slave);
            let index = self.slaves.len() - 1;

            match self.render_slave(index, device, cache, tracker) {
                Ok(()) => self.stats.rendered += 1,
                Err(ResourceError::DeviceLost) => {
                    self.restore_frame_target(device, tracker);
                    return Err(ResourceError::DeviceLost);
                }
                Err(e) => {
                    log::warn!("Shadow slave dropped: {e}");
                    if let Some(dropped) = self.slaves.pop() {
                        self.pool.checkin(dropped.target);
                    }
                    self.stats.dropped += 1;
                }
            }
        }

        self.restore_frame_target(device, tracker);
        log::trace!("Shadow preprocessing produced {} slaves", self.slaves.len());
        Ok(self.slaves.len())
    }

    fn make_slave(&mut self, caster: ShadowCaster, lights: &LightSet, scratch_slots: u32) -> Option<ShadowSlave> {
        let light = lights.get(caster.light)?;
        let caster_bounds = caster.bounds()?;
        let reach = self.config.attenuation_distance;
        let Some(space) = LightSpace::for_caster(light, &caster_bounds, reach) else {
            log::debug!("Shadow slave dropped: light inside caster bounds");
            return None;
        };

        let requested = caster.map_size.unwrap_or(self.config.default_map_size);
        let Some(target) = self.pool.checkout(requested) else {
            log::debug!("Shadow slave dropped: no render target at or below {requested}");
            return None;
        };

        let scratch_light = self.next_scratch % scratch_slots;
        self.next_scratch = self.next_scratch.wrapping_add(1);

        let intensity = if caster.self_shadow { self.config.self_shadow_cap.clamp(0.0, 1.0) } else { 1.0 };
        Some(ShadowSlave {
            index: self.slaves.len(),
            light: caster.light,
            priority: caster.priority,
            blur_scale: caster.blur_scale,
            self_shadow: caster.self_shadow,
            intensity,
            receiver_bounds: ShadowSlave::sweep(&space, &caster_bounds, reach),
            space,
            caster_bounds,
            target,
            scratch_light,
            state: SlaveState::Submitted,
            caster,
        })
    }

    fn render_slave(
        &mut self,
        index: usize,
        device: &mut dyn GraphicsDevice,
        cache: &mut DeviceResourceCache,
        tracker: &mut StateTracker,
    ) -> Result<(), ResourceError> {
        self.render_caster(&self.slaves[index], device, cache, tracker)?;
        self.slaves[index].state = SlaveState::CasterRendered;

        if self.slaves[index].blur_scale > 0.0 {
            if self.blur(index, device, cache, tracker)? {
                self.slaves[index].state = SlaveState::Blurred;
                self.stats.blurred += 1;
            } else {
                log::warn!("Shadow slave {index} left unblurred: no scratch target free");
                self.stats.blur_skipped += 1;
            }
        }
        Ok(())
    }

    fn render_caster(
        &self,
        slave: &ShadowSlave,
        device: &mut dyn GraphicsDevice,
        cache: &mut DeviceResourceCache,
        tracker: &mut StateTracker,
    ) -> Result<(), ResourceError> {
        let target = cache.get_or_create(device, slave.target.id, &[])?;
        let ramp = cache.get_or_create(device, self.ramp.id(), self.ramp.pixels())?;

        device.set_render_target(Some(target));
        // Far and empty: white with zero alpha
        device.clear([1.0, 1.0, 1.0, 0.0], Some(1.0), ColorWriteMask::all());

        tracker.apply(device, StateChange::ZMode(ZMode::opaque()));
        tracker.apply(device, StateChange::Cull(CullMode::None));
        tracker.apply(device, StateChange::Blend(BlendState::opaque()));
        tracker.apply(device, StateChange::ColorWrite(ColorWriteMask::all()));
        tracker.apply(device, StateChange::Fog(FogState::Disabled));
        tracker.apply(device, StateChange::Stage(0, ramp_stage(StageOp::SelectArg1, StageArg::Texture)));
        tracker.seal_stages(device, 1);

        device.set_transform(TransformSlot::View, &slave.space.view);
        device.set_transform(TransformSlot::Projection, &slave.space.projection);
        device.set_transform(TransformSlot::Texture(0), &depth_remap(slave.space.near, slave.space.far));
        device.bind_texture(0, Some(ramp));

        for span in &slave.caster.spans {
            let binding = match span.group.bind(device, cache) {
                Ok(binding) => binding,
                Err(ResourceError::DeviceLost) => return Err(ResourceError::DeviceLost),
                Err(e) => {
                    log::warn!("Skipping caster geometry '{}': {e}", span.group.label());
                    continue;
                }
            };
            device.bind_geometry(&binding);
            device.set_transform(TransformSlot::World, &span.local_to_world);
            device.draw_indexed(&span.draw)?;
        }
        Ok(())
    }

    /// Blur a slave's map in place. The scratch target may be smaller than
    /// the map; the composite pass resamples it. Returns `false` when no
    /// scratch target was free.
    fn blur(
        &mut self,
        index: usize,
        device: &mut dyn GraphicsDevice,
        cache: &mut DeviceResourceCache,
        tracker: &mut StateTracker,
    ) -> Result<bool, ResourceError> {
        let size = self.slaves[index].target.size;
        let Some(scratch) = self.pool.checkout(size) else {
            return Ok(false);
        };
        if scratch.size != size {
            log::debug!("Shadow blur at {size} goes through a {} scratch target", scratch.size);
        }

        let result = self.blur_through(index, scratch.id, device, cache, tracker);
        self.pool.checkin(scratch);
        result.map(|()| true)
    }

    fn blur_through(
        &self,
        index: usize,
        scratch: ResourceId,
        device: &mut dyn GraphicsDevice,
        cache: &mut DeviceResourceCache,
        tracker: &mut StateTracker,
    ) -> Result<(), ResourceError> {
        let slave = &self.slaves[index];
        let source = cache.get_or_create(device, slave.target.id, &[])?;
        let scratch = cache.get_or_create(device, scratch, &[])?;

        // Accumulate offset samples into the scratch target. Alpha marks
        // caster presence and is never written.
        device.set_render_target(Some(scratch));
        device.clear([0.0; 4], None, ColorWriteMask::COLOR);
        tracker.apply(device, StateChange::ZMode(ZMode::disabled()));
        tracker.apply(device, StateChange::Blend(BlendState::additive()));
        tracker.apply(device, StateChange::ColorWrite(ColorWriteMask::COLOR));
        tracker.apply(device, StateChange::Stage(0, screen_stage(StageOp::Modulate)));
        tracker.seal_stages(device, 1);

        let samples = self.config.blur_samples.max(1);
        let weight = 1.0 / samples as f32;
        for (dx, dy) in blur_offsets(samples, slave.blur_scale) {
            device.draw_screen_quad(&ScreenQuad {
                texture: source,
                texel_offset: [dx, dy],
                factor: [weight; 4],
            })?;
        }

        // Copy the blurred color back over the original
        device.set_render_target(Some(source));
        tracker.apply(device, StateChange::Blend(BlendState::opaque()));
        tracker.apply(device, StateChange::Stage(0, screen_stage(StageOp::SelectArg1)));
        device.draw_screen_quad(&ScreenQuad {
            texture: scratch,
            texel_offset: [0.0, 0.0],
            factor: [1.0; 4],
        })?;
        Ok(())
    }

    fn restore_frame_target(&self, device: &mut dyn GraphicsDevice, tracker: &mut StateTracker) {
        device.set_render_target(None);
        tracker.force_reapply();
    }

    /// Mark which slaves land on `span`. Sets `shadow_bits` for every slave
    /// the span receives and `caster_bits` for every slave it was rendered
    /// into. Returns the number of shadows the span receives.
    pub fn attach_receivers(&self, span: &mut Span, at: SpanRef, base_blended: bool, caps: &DeviceCaps) -> usize {
        if self.slaves.is_empty() || span.has(SpanProps::NO_SHADOW_RECEIVE) {
            return 0;
        }
        let stage_limited = caps.max_simultaneous_textures <= 2;
        if stage_limited && base_blended {
            return 0;
        }

        let mut received = 0;
        for slave in &self.slaves {
            if !slave.reaches(&span.world_bounds) {
                continue;
            }
            if slave.is_caster(&at) {
                span.caster_bits.set(slave.index);
                // Without a modulate stage the intensity cap cannot apply
                if !slave.self_shadow || stage_limited {
                    continue;
                }
            }
            span.shadow_bits.set(slave.index);
            received += 1;
        }
        received
    }

    /// Draw one darkening pass per shadow attached to `span`. Geometry and
    /// the world transform must already be bound. Leaves device light slots
    /// modified; callers re-upload their lights afterwards.
    pub fn project_onto(
        &mut self,
        device: &mut dyn GraphicsDevice,
        cache: &mut DeviceResourceCache,
        tracker: &mut StateTracker,
        span: &Span,
        camera_to_world: &Mat4,
    ) -> Result<u32, ResourceError> {
        if span.shadow_bits.is_empty() {
            return Ok(0);
        }
        let caps = device.caps().clone();
        let modulate_stage = caps.max_simultaneous_textures > 2;
        let ramp = cache.get_or_create(device, self.ramp.id(), self.ramp.pixels())?;

        tracker.apply(device, StateChange::ZMode(ZMode::test_only().with_bias(1)));
        tracker.apply(device, StateChange::Blend(BlendState::darken().with_alpha_ref(SHADOW_ALPHA_REF)));
        tracker.apply(device, StateChange::ColorWrite(ColorWriteMask::COLOR));
        tracker.apply(device, StateChange::Fog(FogState::Disabled));

        let mut projected = 0;
        for index in span.shadow_bits.iter() {
            let Some(slave) = self.slaves.get_mut(index) else {
                continue;
            };
            let map = match cache.get_or_create(device, slave.target.id, &[]) {
                Ok(handle) => handle,
                Err(ResourceError::DeviceLost) => return Err(ResourceError::DeviceLost),
                Err(e) => {
                    log::warn!("Shadow projection skipped: {e}");
                    continue;
                }
            };

            // Stage 0: caster depth projected from the light, alpha marks the caster
            tracker.apply(
                device,
                StateChange::Stage(
                    0,
                    StageState {
                        color_op: StageOp::SelectArg1,
                        color_args: (StageArg::Texture, StageArg::Current),
                        alpha_op: StageOp::SelectArg1,
                        alpha_args: (StageArg::Texture, StageArg::Current),
                        tex_coord: TexCoordSource::CameraPosition,
                        clamp: ClampFlags::UV,
                        projected: true,
                    },
                ),
            );
            // Stage 1: receiver depth from the ramp minus caster depth
            tracker.apply(device, StateChange::Stage(1, ramp_stage(StageOp::Subtract, StageArg::Current)));
            let mut stages = 2;
            if modulate_stage {
                // Stage 2: scale by the attenuated scratch light
                tracker.apply(
                    device,
                    StateChange::Stage(
                        2,
                        StageState {
                            color_op: StageOp::Modulate,
                            color_args: (StageArg::Current, StageArg::Diffuse),
                            alpha_op: StageOp::SelectArg1,
                            alpha_args: (StageArg::Current, StageArg::Current),
                            ..StageState::disabled()
                        },
                    ),
                );
                stages = 3;
            }
            tracker.seal_stages(device, stages);

            device.set_transform(TransformSlot::Texture(0), &(slave.space.world_to_texture() * camera_to_world));
            device.set_transform(
                TransformSlot::Texture(1),
                &(depth_remap(slave.space.near, slave.space.far) * slave.space.view * camera_to_world),
            );
            device.bind_texture(0, Some(map));
            device.bind_texture(1, Some(ramp));

            if modulate_stage {
                for slot in 0..caps.max_lights {
                    device.set_light(slot, None);
                }
                device.set_light(slave.scratch_light, Some(&scratch_light(slave, self.config.attenuation_distance)));
            }

            device.draw_indexed(&span.draw_call())?;
            slave.state = SlaveState::ReceiverProjected;
            projected += 1;
        }

        self.stats.projections += projected;
        Ok(projected)
    }

    /// Destroy every slave and return their targets to the pool
    pub fn end_frame(&mut self) {
        if !self.requests.is_empty() {
            log::debug!("Discarding {} unprocessed shadow requests", self.requests.len());
            self.requests.clear();
        }
        self.slaves.clear();
        self.pool.reset();
    }
}

/// Stage sampling the depth ramp with view-space position coordinates
fn ramp_stage(color_op: StageOp, second: StageArg) -> StageState {
    StageState {
        color_op,
        color_args: (StageArg::Texture, second),
        alpha_op: StageOp::SelectArg1,
        alpha_args: (StageArg::Texture, StageArg::Current),
        tex_coord: TexCoordSource::CameraPosition,
        clamp: ClampFlags::UV,
        projected: false,
    }
}

/// Stage for screen quads, combining the texture with the quad factor
fn screen_stage(color_op: StageOp) -> StageState {
    StageState {
        color_op,
        color_args: (StageArg::Texture, StageArg::Factor),
        alpha_op: StageOp::SelectArg1,
        alpha_args: (StageArg::Texture, StageArg::Current),
        tex_coord: TexCoordSource::Uv(0),
        clamp: ClampFlags::UV,
        projected: false,
    }
}

/// Sub-texel sample offsets on a ring of radius `scale`
fn blur_offsets(samples: u32, scale: f32) -> impl Iterator<Item = (f32, f32)> {
    (0..samples).map(move |sample| {
        let angle = std::f32::consts::TAU * sample as f32 / samples as f32;
        (angle.cos() * scale, angle.sin() * scale)
    })
}

/// Light fading the projected shadow with distance from the caster
fn scratch_light(slave: &ShadowSlave, reach: f32) -> GpuLight {
    let range = slave.caster_bounds.radius() + reach;
    GpuLight {
        kind: GpuLightKind::Point,
        position: slave.caster_bounds.center().into(),
        direction: slave.space.cast_direction().into(),
        color: [slave.intensity; 3],
        attenuation: [1.0, 1.0 / range.max(f32::EPSILON), 0.0],
        range,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec3;
    use crate::render::backends::{DeviceCall, RecordingDevice};
    use crate::render::lighting::Light;
    use crate::render::api::DrawCall;
    use crate::render::lighting::LightId;
    use crate::render::shadow::CasterSpan;
    use crate::scene::{BufferGroup, DrawableKey, Vertex, AABB};
    use approx::assert_relative_eq;

    struct Fixture {
        device: RecordingDevice,
        cache: DeviceResourceCache,
        tracker: StateTracker,
        lights: LightSet,
        shadows: ShadowSubsystem,
        group: Arc<BufferGroup>,
    }

    impl Fixture {
        fn new(config: ShadowConfig) -> Self {
            Self::with_caps(config, DeviceCaps::default())
        }

        fn with_caps(config: ShadowConfig, caps: DeviceCaps) -> Self {
            let mut device = RecordingDevice::new(caps);
            let mut cache = DeviceResourceCache::new();
            let mut shadows = ShadowSubsystem::new(config, &mut cache);
            shadows.allocate_targets(&mut cache, &mut device).expect("Should allocate targets");
            cache.finish_unmanaged_phase();

            let vertices = vec![
                Vertex::new([0.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0]),
                Vertex::new([1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [1.0, 0.0]),
                Vertex::new([0.0, 0.0, 1.0], [0.0, 1.0, 0.0], [0.0, 1.0]),
            ];
            let group = Arc::new(BufferGroup::new(&mut cache, "caster", vertices, vec![0, 1, 2]));
            Self {
                device,
                cache,
                tracker: StateTracker::new(),
                lights: LightSet::new(),
                shadows,
                group,
            }
        }

        fn caster(&self, light: LightId, span: usize) -> ShadowCaster {
            ShadowCaster::new(light).with_span(CasterSpan {
                group: Arc::clone(&self.group),
                draw: DrawCall { vertex_start: 0, vertex_count: 3, index_start: 0, index_count: 3 },
                local_to_world: Mat4::new_translation(&Vec3::new(0.0, 5.0, 0.0)),
                world_bounds: AABB::new(Vec3::new(0.0, 5.0, 0.0), Vec3::new(1.0, 5.1, 1.0)),
                source: Some(SpanRef { drawable: DrawableKey(7), span }),
            })
        }

        fn sun(&mut self) -> LightId {
            self.lights.insert(Light::directional(Vec3::new(0.0, -1.0, 0.0), Vec3::new(1.0, 1.0, 1.0), 1.0))
        }

        fn preprocess(&mut self) -> usize {
            self.shadows
                .preprocess_all(&mut self.device, &mut self.cache, &mut self.tracker, &self.lights)
                .expect("Should preprocess")
        }

        fn submit(&mut self, caster: ShadowCaster) -> bool {
            let caps = self.device.caps().clone();
            self.shadows.submit(caster, &self.lights, &caps, &self.cache)
        }
    }

    fn small_pool() -> ShadowConfig {
        ShadowConfig { min_target_size: 64, max_target_size: 128, targets_per_size: 1, ..ShadowConfig::default() }
    }

    #[test]
    fn test_submissions_order_by_ascending_priority() {
        let mut fx = Fixture::new(ShadowConfig::default());
        let sun = fx.sun();
        for (priority, span) in [(5, 0), (1, 1), (5, 2), (0, 3)] {
            let caster = fx.caster(sun, span).with_priority(priority);
            assert!(fx.submit(caster));
        }
        fx.preprocess();

        let order: Vec<_> = fx.shadows.slaves().iter().map(|slave| (slave.priority, slave.index)).collect();
        assert_eq!(order, vec![(0, 0), (1, 1), (5, 2), (5, 3)]);
        let sources: Vec<_> = fx
            .shadows
            .slaves()
            .iter()
            .map(|slave| slave.caster.spans[0].source.map(|source| source.span))
            .collect();
        assert_eq!(sources, vec![Some(3), Some(1), Some(0), Some(2)]);
    }

    #[test]
    fn test_point_shadows_need_projective_stages() {
        let caps = DeviceCaps { flags: CapsFlags::RENDER_TO_TEXTURE, ..DeviceCaps::default() };
        let mut fx = Fixture::with_caps(ShadowConfig::default(), caps);
        let bulb = fx.lights.insert(Light::point(Vec3::new(0.0, 10.0, 0.0), Vec3::new(1.0, 1.0, 1.0), 1.0, 30.0));
        let sun = fx.sun();

        assert!(!fx.submit(fx.caster(bulb, 0)));
        assert!(fx.submit(fx.caster(sun, 0)));
        assert!(!fx.submit(ShadowCaster::new(sun)));
        assert_eq!(fx.shadows.stats().rejected, 2);
    }

    #[test]
    fn test_target_fallback_and_drop() {
        let mut fx = Fixture::new(small_pool());
        let sun = fx.sun();
        for span in 0..3 {
            let caster = fx.caster(sun, span).with_map_size(128);
            assert!(fx.submit(caster));
        }
        assert_eq!(fx.preprocess(), 2);

        let sizes: Vec<_> = fx.shadows.slaves().iter().map(|slave| slave.target.size).collect();
        assert_eq!(sizes, vec![128, 64]);
        assert_eq!(fx.shadows.stats().dropped, 1);
    }

    #[test]
    fn test_caster_renders_depth_into_target() {
        let mut fx = Fixture::new(ShadowConfig::default());
        let sun = fx.sun();
        fx.submit(fx.caster(sun, 0));
        fx.device.clear_calls();
        fx.preprocess();

        let slave = &fx.shadows.slaves()[0];
        assert_eq!(slave.state, SlaveState::CasterRendered);
        let target = fx.cache.handle(slave.target.id).expect("Should have target handle");

        let calls = fx.device.calls();
        let first_target = calls.iter().find(|call| matches!(call, DeviceCall::SetRenderTarget(_)));
        assert!(matches!(first_target, Some(DeviceCall::SetRenderTarget(Some(handle))) if *handle == target));
        assert!(calls.iter().any(|call| matches!(
            call,
            DeviceCall::Clear { color, .. } if color[3] == 0.0
        )));
        assert_eq!(fx.device.draw_count(), 1);
        assert!(matches!(calls.last(), Some(DeviceCall::SetRenderTarget(None))));
        assert!(fx.tracker.is_forced());
    }

    #[test]
    fn test_blur_never_writes_alpha() {
        let mut fx = Fixture::new(ShadowConfig { blur_samples: 3, ..ShadowConfig::default() });
        let sun = fx.sun();
        fx.submit(fx.caster(sun, 0).with_blur(0.5));
        fx.device.clear_calls();
        fx.preprocess();

        assert_eq!(fx.shadows.slaves()[0].state, SlaveState::Blurred);
        let calls = fx.device.calls();
        let quads = calls.iter().filter(|call| matches!(call, DeviceCall::DrawScreenQuad(_))).count();
        assert_eq!(quads, 4);

        // Every quad is drawn with alpha writes off
        let mut mask = ColorWriteMask::all();
        for call in calls {
            match call {
                DeviceCall::ApplyState(StateChange::ColorWrite(new_mask)) => mask = *new_mask,
                DeviceCall::DrawScreenQuad(_) => assert!(!mask.contains(ColorWriteMask::ALPHA)),
                _ => {}
            }
        }
        // Scratch target went back to the pool
        assert_eq!(fx.shadows.pool().checked_out(), 1);
    }

    #[test]
    fn test_blur_shares_pool_with_same_size_maps() {
        let mut fx = Fixture::new(ShadowConfig::default());
        let sun = fx.sun();
        assert!(fx.submit(fx.caster(sun, 0).with_blur(0.5)));
        assert!(fx.submit(fx.caster(sun, 1).with_blur(0.5)));
        assert_eq!(fx.preprocess(), 2);

        let slaves: Vec<_> = fx.shadows.slaves().iter().map(|slave| (slave.target.size, slave.state)).collect();
        assert_eq!(slaves, vec![(256, SlaveState::Blurred), (256, SlaveState::Blurred)]);
        assert_eq!(fx.shadows.stats().blurred, 2);
        assert_eq!(fx.shadows.stats().blur_skipped, 0);
        assert_eq!(fx.shadows.pool().checked_out(), 2);
    }

    #[test]
    fn test_blur_without_scratch_target_is_counted() {
        let config = ShadowConfig { min_target_size: 64, max_target_size: 64, targets_per_size: 1, ..ShadowConfig::default() };
        let mut fx = Fixture::new(config);
        let sun = fx.sun();
        assert!(fx.submit(fx.caster(sun, 0).with_blur(0.5)));
        assert_eq!(fx.preprocess(), 1);

        assert_eq!(fx.shadows.slaves()[0].state, SlaveState::CasterRendered);
        assert_eq!(fx.shadows.stats().blurred, 0);
        assert_eq!(fx.shadows.stats().blur_skipped, 1);
    }

    #[test]
    fn test_receivers_and_self_shadow() {
        let mut fx = Fixture::new(ShadowConfig::default());
        let sun = fx.sun();
        fx.submit(fx.caster(sun, 0));
        fx.submit(fx.caster(sun, 1).with_self_shadow());
        fx.preprocess();
        let caps = fx.device.caps().clone();

        let ground = AABB::from_center_extents(Vec3::new(0.5, 0.0, 0.5), Vec3::new(5.0, 0.1, 5.0));
        let mut receiver = Span::new(0, 0, ground);
        let at = SpanRef { drawable: DrawableKey(7), span: 9 };
        assert_eq!(fx.shadows.attach_receivers(&mut receiver, at, false, &caps), 2);

        // The first caster never shadows itself, the second does
        let mut caster = Span::new(0, 0, AABB::new(Vec3::new(0.0, 5.0, 0.0), Vec3::new(1.0, 5.1, 1.0)));
        let own = SpanRef { drawable: DrawableKey(7), span: 0 };
        assert_eq!(fx.shadows.attach_receivers(&mut caster, own, false, &caps), 1);
        assert!(caster.caster_bits.is_set(0));
        assert!(!caster.shadow_bits.is_set(0));
        assert!(caster.shadow_bits.is_set(1));
        assert_relative_eq!(fx.shadows.slaves()[1].intensity, fx.shadows.config().self_shadow_cap);

        let mut opted_out = Span::new(0, 0, ground).with_props(SpanProps::NO_SHADOW_RECEIVE);
        assert_eq!(fx.shadows.attach_receivers(&mut opted_out, at, false, &caps), 0);
    }

    #[test]
    fn test_projection_darkens_with_alpha_test() {
        let mut fx = Fixture::new(ShadowConfig::default());
        let sun = fx.sun();
        fx.submit(fx.caster(sun, 0));
        fx.preprocess();
        let caps = fx.device.caps().clone();

        let ground = AABB::from_center_extents(Vec3::new(0.5, 0.0, 0.5), Vec3::new(5.0, 0.1, 5.0));
        let mut receiver = Span::new(0, 0, ground).with_indices(0, 3);
        let at = SpanRef { drawable: DrawableKey(7), span: 9 };
        fx.shadows.attach_receivers(&mut receiver, at, false, &caps);

        fx.device.clear_calls();
        let projected = fx
            .shadows
            .project_onto(&mut fx.device, &mut fx.cache, &mut fx.tracker, &receiver, &Mat4::identity())
            .expect("Should project");
        assert_eq!(projected, 1);
        assert_eq!(fx.device.draw_count(), 1);
        assert_eq!(fx.tracker.blend(), Some(BlendState::darken().with_alpha_ref(SHADOW_ALPHA_REF)));
        assert_eq!(fx.shadows.slaves()[0].state, SlaveState::ReceiverProjected);
    }

    #[test]
    fn test_slaves_die_at_end_of_frame() {
        let mut fx = Fixture::new(ShadowConfig::default());
        let sun = fx.sun();
        fx.submit(fx.caster(sun, 0));
        fx.preprocess();
        assert_eq!(fx.shadows.live_slaves(), 1);
        assert_eq!(fx.shadows.pool().checked_out(), 1);

        fx.shadows.end_frame();
        assert_eq!(fx.shadows.live_slaves(), 0);
        assert_eq!(fx.shadows.pool().checked_out(), 0);
        assert_eq!(fx.shadows.pending(), 0);
    }

    #[test]
    fn test_blur_offsets_form_a_ring() {
        let offsets: Vec<_> = blur_offsets(4, 0.5).collect();
        assert_eq!(offsets.len(), 4);
        for (dx, dy) in offsets {
            assert_relative_eq!((dx * dx + dy * dy).sqrt(), 0.5, epsilon = 1e-6);
        }
    }
}
