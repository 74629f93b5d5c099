//! Whole-pipeline scenarios driven through the recording backend

use super::api::{DeviceCaps, DeviceStatus, MemoryPool, TransformSlot};
use super::backends::{DeviceCall, RecordingDevice, RecordingFactory};
use super::frame::{Camera, DeviceObserver, FrameStatus, RenderContext};
use super::lighting::{Attenuation, Light, LightProps, Projection};
use super::material::{BlendFlags, Layer, LayerTexture, Material, Texture, ZFlags};
use super::shadow::ShadowCaster;
use super::state::{BlendState, ClampFlags, StageArg, StateChange, TexCoordSource};
use crate::config::{DisplayParams, PipelineConfig};
use crate::foundation::math::{Mat4, Mat4Ext, Vec3};
use crate::scene::{
    BufferGroup, Drawable, DrawableKey, SkinWeights, Span, SpanCollection, SpanProps, Vertex,
    VisRegionFilter, VisRegionMask, AABB,
};
use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

#[derive(Default)]
struct CountingObserver {
    recreated: Cell<u32>,
}

impl DeviceObserver for CountingObserver {
    fn device_recreated(&self, _caps: &DeviceCaps) {
        self.recreated.set(self.recreated.get() + 1);
    }
}

fn quad_vertices() -> Vec<Vertex> {
    vec![
        Vertex::new([-1.0, 0.0, -1.0], [0.0, 1.0, 0.0], [0.0, 0.0]),
        Vertex::new([1.0, 0.0, -1.0], [0.0, 1.0, 0.0], [1.0, 0.0]),
        Vertex::new([1.0, 0.0, 1.0], [0.0, 1.0, 0.0], [1.0, 1.0]),
        Vertex::new([-1.0, 0.0, 1.0], [0.0, 1.0, 0.0], [0.0, 1.0]),
    ]
}

fn context_with(caps: DeviceCaps, config: PipelineConfig) -> RenderContext<RecordingDevice> {
    let mut factory = RecordingFactory::new(caps);
    RenderContext::create(&mut factory, config).expect("Should create context")
}

fn white(ctx: &mut RenderContext<RecordingDevice>, label: &str) -> Arc<Texture> {
    Arc::new(Texture::new(ctx.cache_mut(), label, 2, 2, vec![255; 16]))
}

/// One drawable with a single material and the given spans over a quad
fn drawable(
    ctx: &mut RenderContext<RecordingDevice>,
    key: u64,
    material: Material,
    spans: Vec<Span>,
) -> SpanCollection {
    let group = Arc::new(BufferGroup::new(ctx.cache_mut(), "quad", quad_vertices(), vec![0, 1, 2, 0, 2, 3]));
    let mut builder = SpanCollection::builder(DrawableKey(key))
        .with_buffer_group(group)
        .with_material(Arc::new(material));
    for span in spans {
        builder = builder.with_span(span);
    }
    builder.build()
}

fn ground() -> Span {
    let bounds = AABB::from_center_extents(Vec3::new(0.5, 0.0, 0.5), Vec3::new(5.0, 0.1, 5.0));
    Span::new(0, 0, bounds).with_indices(0, 6)
}

fn draw_frame(ctx: &mut RenderContext<RecordingDevice>, drawables: &mut [&mut SpanCollection]) {
    let filter = VisRegionFilter::all();
    let mut lists = Vec::new();
    for drawable in drawables.iter() {
        let mut visible = Vec::new();
        ctx.pre_render(&**drawable, &mut visible, &filter);
        lists.push(visible);
    }
    for (drawable, visible) in drawables.iter_mut().zip(&lists) {
        ctx.prep_for_render(&mut **drawable, visible, &filter);
    }
    for (drawable, visible) in drawables.iter().zip(&lists) {
        ctx.render(&**drawable, visible).expect("Should render");
    }
}

fn sun() -> Light {
    Light::directional(Vec3::new(0.0, -1.0, 0.0), Vec3::new(1.0, 1.0, 1.0), 1.0)
}

#[test]
fn test_lost_device_retries_until_resettable() {
    let mut ctx = context_with(DeviceCaps::default(), PipelineConfig::default());
    let material = Material::new("ground", vec![Layer::textured(white(&mut ctx, "ground"))]);
    let mut floor = drawable(&mut ctx, 1, material, vec![ground()]);
    ctx.load_scene(&[&floor]).expect("Should load");
    let observer = Rc::new(CountingObserver::default());
    ctx.add_observer(observer.clone());

    assert_eq!(ctx.begin_frame(), FrameStatus::Ready);
    draw_frame(&mut ctx, &mut [&mut floor]);
    assert!(ctx.end_frame());

    ctx.device_mut().script_status(&[DeviceStatus::Lost, DeviceStatus::Lost, DeviceStatus::NotReset]);
    ctx.device_mut().clear_calls();

    for _ in 0..2 {
        assert_eq!(ctx.begin_frame(), FrameStatus::Retry);
        draw_frame(&mut ctx, &mut [&mut floor]);
        assert!(!ctx.end_frame());
    }
    assert!(ctx.device().calls().iter().all(|call| !call.is_draw() && *call != DeviceCall::BeginScene));
    assert_eq!(observer.recreated.get(), 0);

    assert_eq!(ctx.begin_frame(), FrameStatus::Ready);
    assert_eq!(observer.recreated.get(), 1);
    let calls = ctx.device().calls();
    let reset = calls.iter().position(|call| matches!(call, DeviceCall::Reset(_))).expect("Should reset");
    let scene = calls.iter().position(|call| *call == DeviceCall::BeginScene).expect("Should open scene");
    assert!(reset < scene);

    draw_frame(&mut ctx, &mut [&mut floor]);
    assert!(ctx.end_frame());
    assert_eq!(ctx.device().draw_count(), 1);
    assert_eq!(observer.recreated.get(), 1);
}

#[test]
fn test_loss_at_present_recovers_next_frame() {
    let mut ctx = context_with(DeviceCaps::default(), PipelineConfig::default());
    ctx.load_scene(&[]).expect("Should load");
    let observer = Rc::new(CountingObserver::default());
    ctx.add_observer(observer.clone());

    assert_eq!(ctx.begin_frame(), FrameStatus::Ready);
    ctx.device_mut().lose_on_next_present();
    assert!(!ctx.end_frame());
    assert!(ctx.frames().is_device_lost());

    assert_eq!(ctx.begin_frame(), FrameStatus::Ready);
    assert!(!ctx.frames().is_device_lost());
    assert_eq!(observer.recreated.get(), 1);
    assert!(ctx.end_frame());
}

#[test]
fn test_alpha_layer_on_two_stage_hardware() {
    let mut ctx = context_with(DeviceCaps::legacy_two_stage(), PipelineConfig::default());
    let base = Layer::textured(white(&mut ctx, "base"));
    let glaze = Layer::textured(white(&mut ctx, "glaze")).with_blend(BlendFlags::ALPHA);
    let mut floor = drawable(&mut ctx, 1, Material::new("glazed", vec![base, glaze]), vec![ground()]);
    ctx.load_scene(&[&floor]).expect("Should load");
    ctx.add_light(sun());

    assert_eq!(ctx.begin_frame(), FrameStatus::Ready);
    ctx.device_mut().clear_calls();
    draw_frame(&mut ctx, &mut [&mut floor]);
    assert!(ctx.end_frame());

    let calls = ctx.device().calls();
    let draws: Vec<usize> = calls
        .iter()
        .enumerate()
        .filter(|(_, call)| matches!(call, DeviceCall::Draw(_)))
        .map(|(at, _)| at)
        .collect();
    assert_eq!(draws.len(), 2);

    let blends_between = calls[draws[0]..draws[1]]
        .iter()
        .filter(|call| matches!(call, DeviceCall::ApplyState(StateChange::Blend(_))))
        .count();
    assert_eq!(blends_between, 1);

    // The light reached the device before the first pass
    let first_light = calls
        .iter()
        .position(|call| matches!(call, DeviceCall::SetLight { light: Some(_), .. }))
        .expect("Should upload the sun");
    assert!(first_light < draws[0]);
    assert_eq!(ctx.stats().passes, 2);
}

#[test]
fn test_scene_load_orders_unmanaged_before_managed() {
    let mut ctx = context_with(DeviceCaps::default(), PipelineConfig::default());
    let texture = white(&mut ctx, "skin");
    let rigid = vec![SkinWeights::rigid(0); 4];
    let skinned = Arc::new(BufferGroup::skinned(ctx.cache_mut(), "body", quad_vertices(), rigid, vec![0, 1, 2]));
    let mut body = SpanCollection::builder(DrawableKey(2))
        .with_buffer_group(skinned)
        .with_material(Arc::new(Material::new("skin", vec![Layer::textured(texture)])))
        .with_span(ground().with_props(SpanProps::RUNTIME_LIT | SpanProps::SKINNED).with_indices(0, 3))
        .build();
    body.set_bone_palette(vec![Mat4::new_translation(&Vec3::new(0.0, 1.0, 0.0))]);
    let material = Material::new("ground", vec![Layer::textured(white(&mut ctx, "ground"))]);
    let mut floor = drawable(&mut ctx, 1, material, vec![ground()]);

    ctx.load_scene(&[&floor, &body]).expect("Should load");
    let pools: Vec<MemoryPool> = ctx
        .device()
        .calls()
        .iter()
        .filter_map(|call| match call {
            DeviceCall::CreateResource { pool, .. } => Some(*pool),
            _ => None,
        })
        .collect();
    let first_managed = pools.iter().position(|pool| *pool == MemoryPool::Managed).expect("Should create geometry");
    assert!(first_managed > 0);
    assert!(pools[first_managed..].iter().all(|pool| *pool == MemoryPool::Managed));

    // Skinning rewrites the unmanaged buffer in place during the frame
    assert_eq!(ctx.begin_frame(), FrameStatus::Ready);
    draw_frame(&mut ctx, &mut [&mut floor, &mut body]);
    assert!(ctx.end_frame());
    assert_eq!(ctx.stats().skinned_drawables, 1);
    assert_eq!(ctx.stats().spans_rendered, 2);
}

#[test]
fn test_shadow_slaves_live_for_one_frame() {
    let mut ctx = context_with(DeviceCaps::default(), PipelineConfig::default());
    let caster_bounds = AABB::new(Vec3::new(0.0, 5.0, 0.0), Vec3::new(1.0, 5.1, 1.0));
    let caster_span = Span::new(0, 0, caster_bounds)
        .with_indices(0, 6)
        .with_props(SpanProps::RUNTIME_LIT | SpanProps::CASTS_SHADOW)
        .with_transform(Mat4::new_translation(&Vec3::new(0.0, 5.0, 0.0)));
    let material = Material::new("stone", vec![Layer::textured(white(&mut ctx, "stone"))]);
    let mut scene = drawable(&mut ctx, 3, material, vec![ground(), caster_span]);
    ctx.load_scene(&[&scene]).expect("Should load");
    let light = ctx.add_light(sun());

    assert!(ctx.submit_shadow_caster(ShadowCaster::from_drawable(light, &scene)));
    assert_eq!(ctx.begin_frame(), FrameStatus::Ready);
    assert!(!ctx.submit_shadow_caster(ShadowCaster::from_drawable(light, &scene)));
    assert_eq!(ctx.shadows().live_slaves(), 1);
    draw_frame(&mut ctx, &mut [&mut scene]);
    assert!(scene.spans()[0].shadow_bits.is_set(0));
    assert!(scene.spans()[1].caster_bits.is_set(0));
    assert!(ctx.end_frame());

    let stats = ctx.stats();
    assert_eq!(stats.shadows.rendered, 1);
    assert_eq!(stats.shadows.projections, 1);
    assert_eq!(ctx.shadows().live_slaves(), 0);

    assert_eq!(ctx.begin_frame(), FrameStatus::Ready);
    assert_eq!(ctx.shadows().live_slaves(), 0);
    assert!(ctx.end_frame());
}

#[test]
fn test_light_ranking_is_stable_across_frames() {
    let mut config = PipelineConfig::default();
    config.lighting.max_lights = 2;
    let mut ctx = context_with(DeviceCaps::default(), config);
    let material = Material::new("ground", vec![Layer::textured(white(&mut ctx, "ground"))]);
    let mut floor = drawable(&mut ctx, 1, material, vec![ground()]);
    ctx.load_scene(&[&floor]).expect("Should load");
    for distance in [3.0, 1.0, 6.0] {
        let falloff = Attenuation { constant: 1.0, linear: 0.5, quadratic: 0.0 };
        ctx.add_light(
            Light::point(Vec3::new(0.5, distance, 0.5), Vec3::new(1.0, 1.0, 1.0), 1.0, 50.0).with_attenuation(falloff),
        );
    }

    let mut uploads = Vec::new();
    for _ in 0..2 {
        assert_eq!(ctx.begin_frame(), FrameStatus::Ready);
        ctx.device_mut().clear_calls();
        draw_frame(&mut ctx, &mut [&mut floor]);
        assert!(ctx.end_frame());
        let lights: Vec<(u32, [f32; 3])> = ctx
            .device()
            .calls()
            .iter()
            .filter_map(|call| match call {
                DeviceCall::SetLight { slot, light: Some(light) } => Some((*slot, light.position)),
                _ => None,
            })
            .collect();
        uploads.push(lights);
    }

    assert_eq!(uploads[0], uploads[1]);
    assert_eq!(uploads[0], vec![(0, [0.5, 1.0, 0.5]), (1, [0.5, 3.0, 0.5])]);
}

#[test]
fn test_excluded_vis_region_is_not_drawn() {
    let mut ctx = context_with(DeviceCaps::default(), PipelineConfig::default());
    let cellar = VisRegionMask::region(3);
    let material = Material::new("ground", vec![Layer::textured(white(&mut ctx, "ground"))]);
    let mut floor = drawable(&mut ctx, 1, material, vec![ground().with_vis_regions(cellar), ground()]);
    ctx.load_scene(&[&floor]).expect("Should load");
    ctx.set_camera(Camera::new(
        Mat4::look_at(Vec3::new(0.0, 10.0, 10.0), Vec3::zeros(), Vec3::y()),
        Mat4::perspective(1.0, 1.0, 0.1, 100.0),
    ));

    let filter = VisRegionFilter { include: VisRegionMask::NONE, exclude: cellar };
    assert_eq!(ctx.begin_frame(), FrameStatus::Ready);
    let mut visible = Vec::new();
    assert!(ctx.pre_render(&floor, &mut visible, &filter));
    assert_eq!(visible, vec![1]);
    ctx.prep_for_render(&mut floor, &visible, &filter);
    ctx.render(&floor, &visible).expect("Should render");
    assert!(ctx.device().calls().contains(&DeviceCall::SetTransform(TransformSlot::View)));
    assert!(ctx.end_frame());
    assert_eq!(ctx.stats().spans_rendered, 1);
    assert_eq!(ctx.stats().draw_calls, 1);
}

/// A white directional projector of the given intensity
fn projector(ctx: &mut RenderContext<RecordingDevice>, label: &str, intensity: f32, props: LightProps) -> Light {
    let cookie = white(ctx, label);
    Light::directional(Vec3::new(0.0, -1.0, 0.0), Vec3::new(1.0, 1.0, 1.0), intensity)
        .with_props(props)
        .with_projection(Projection { texture: LayerTexture::Static(cookie), world_to_texture: Mat4::identity() })
}

#[test]
fn test_projectors_render_per_pass_and_overall() {
    let mut config = PipelineConfig::default();
    config.lighting.max_projectors = 2;
    let mut ctx = context_with(DeviceCaps::default(), config);
    // The second layer writes depth, so the material takes two passes
    let material = Material::new(
        "tiles",
        vec![Layer::textured(white(&mut ctx, "tiles")), Layer::textured(white(&mut ctx, "grout"))],
    );
    let mut floor = drawable(&mut ctx, 1, material, vec![ground()]);
    ctx.load_scene(&[&floor]).expect("Should load");
    ctx.add_light(sun());
    let per_pass = projector(&mut ctx, "window", 0.9, LightProps::empty());
    ctx.add_light(per_pass);
    let overall = projector(&mut ctx, "caustics", 0.8, LightProps::OVERALL);
    ctx.add_light(overall);
    let faint = projector(&mut ctx, "faint", 0.1, LightProps::empty());
    ctx.add_light(faint);

    assert_eq!(ctx.begin_frame(), FrameStatus::Ready);
    ctx.device_mut().clear_calls();
    draw_frame(&mut ctx, &mut [&mut floor]);
    assert!(ctx.end_frame());

    // Uploaded light intensity, or `None` for a draw
    let events: Vec<Option<f32>> = ctx
        .device()
        .calls()
        .iter()
        .filter_map(|call| match call {
            DeviceCall::SetLight { light: Some(light), .. } => Some(Some(light.color[0])),
            DeviceCall::Draw(_) => Some(None),
            _ => None,
        })
        .collect();
    assert_eq!(
        events,
        vec![
            Some(1.0),
            None,
            Some(0.9),
            None,
            Some(1.0),
            None,
            Some(0.9),
            None,
            Some(0.8),
            None,
        ]
    );

    let stats = ctx.stats();
    assert_eq!(stats.passes, 2);
    assert_eq!(stats.projector_passes, 3);
    assert_eq!(stats.draw_calls, 5);
}

#[test]
fn test_distance_fade_defers_diffuse_to_multiply_pass() {
    let mut ctx = context_with(DeviceCaps::legacy_two_stage(), PipelineConfig::default());
    let base = Layer::textured(white(&mut ctx, "brick"));
    let fade = Layer::textured(white(&mut ctx, "fog ramp"))
        .with_blend(BlendFlags::ALPHA)
        .with_z(ZFlags::NO_Z_WRITE)
        .with_uvw(TexCoordSource::CameraPosition)
        .with_clamp(ClampFlags::UV);
    let mut wall = drawable(&mut ctx, 1, Material::new("faded brick", vec![base, fade]), vec![ground()]);
    ctx.load_scene(&[&wall]).expect("Should load");
    ctx.add_light(sun());

    assert_eq!(ctx.begin_frame(), FrameStatus::Ready);
    ctx.device_mut().clear_calls();
    draw_frame(&mut ctx, &mut [&mut wall]);
    assert!(ctx.end_frame());

    let calls = ctx.device().calls();
    let draws: Vec<usize> = calls
        .iter()
        .enumerate()
        .filter(|(_, call)| matches!(call, DeviceCall::Draw(_)))
        .map(|(at, _)| at)
        .collect();
    assert_eq!(draws.len(), 2);

    let between = &calls[draws[0]..draws[1]];
    assert!(between.contains(&DeviceCall::ApplyState(StateChange::Blend(BlendState::multiply()))));
    assert!(between.iter().any(|call| matches!(
        call,
        DeviceCall::ApplyState(StateChange::Stage(0, stage)) if stage.color_args.0 == StageArg::Diffuse
    )));
    assert!(between.contains(&DeviceCall::BindTexture { stage: 0, texture: None }));
    assert_eq!(ctx.stats().passes, 2);
}

#[test]
fn test_display_reset_falls_back_to_reduced_mode() {
    let mut ctx = context_with(DeviceCaps::default(), PipelineConfig::default());
    let material = Material::new("ground", vec![Layer::textured(white(&mut ctx, "ground"))]);
    let mut floor = drawable(&mut ctx, 1, material, vec![ground()]);
    ctx.load_scene(&[&floor]).expect("Should load");
    let observer = Rc::new(CountingObserver::default());
    ctx.add_observer(observer.clone());

    let wide = DisplayParams { width: 1920, height: 1080, ..DisplayParams::default() };
    ctx.device_mut().reject_mode(wide.clone());
    ctx.reset_display_mode(wide.clone()).expect("Should fall back");
    assert_eq!(*ctx.display(), DisplayParams::reduced());
    assert!(ctx.device().calls().contains(&DeviceCall::Reset(wide)));
    assert!(ctx.device().calls().contains(&DeviceCall::Reset(DisplayParams::reduced())));
    assert_eq!(observer.recreated.get(), 1);

    assert_eq!(ctx.begin_frame(), FrameStatus::Ready);
    ctx.device_mut().clear_calls();
    draw_frame(&mut ctx, &mut [&mut floor]);
    assert!(ctx.end_frame());
    assert_eq!(ctx.device().draw_count(), 1);
}

#[test]
fn test_lost_device_recovers_in_reduced_mode() {
    let mut ctx = context_with(DeviceCaps::default(), PipelineConfig::default());
    ctx.load_scene(&[]).expect("Should load");
    let observer = Rc::new(CountingObserver::default());
    ctx.add_observer(observer.clone());

    let current = ctx.display().clone();
    ctx.device_mut().reject_mode(current);
    ctx.device_mut().script_status(&[DeviceStatus::NotReset]);

    assert_eq!(ctx.begin_frame(), FrameStatus::Ready);
    assert_eq!(*ctx.display(), DisplayParams::reduced());
    assert_eq!(observer.recreated.get(), 1);
    assert!(ctx.end_frame());
}

#[test]
fn test_failed_display_reset_recovers_on_next_frame() {
    let mut ctx = context_with(DeviceCaps::default(), PipelineConfig::default());
    ctx.load_scene(&[]).expect("Should load");
    let observer = Rc::new(CountingObserver::default());
    ctx.add_observer(observer.clone());
    let original = ctx.display().clone();

    let wide = DisplayParams { width: 1920, height: 1080, ..DisplayParams::default() };
    ctx.device_mut().reject_mode(wide.clone());
    ctx.device_mut().reject_mode(DisplayParams::reduced());
    assert!(ctx.reset_display_mode(wide).is_err());
    assert!(ctx.frames().is_device_lost());
    assert_eq!(observer.recreated.get(), 0);

    // The next frame resets back into the last working mode
    assert_eq!(ctx.begin_frame(), FrameStatus::Ready);
    assert_eq!(*ctx.display(), original);
    assert_eq!(observer.recreated.get(), 1);
    assert!(ctx.end_frame());
}
