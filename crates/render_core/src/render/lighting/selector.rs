//! Per-span light selection
//!
//! Once per frame the selector builds two candidate lists from the light
//! set: unrestricted lights and lights restricted to characters. Both are
//! filtered by the frame's visibility regions. Per span it then:
//!
//! 1. takes the span's authored light group, unranked, against the budget;
//! 2. ranks the remaining candidates that reach the span by strength at the
//!    span's bounds center (stable, so ties keep candidate order);
//! 3. fills the rest of the budget from the top of the ranking;
//! 4. fades selected lights whose strength is close to the strongest
//!    rejected candidate, so lights swapping in and out do not pop.
//!
//! Projective lights go through the same steps into their own list with
//! their own cap and no fade.

use super::{LightId, LightProps, LightSet};
use crate::config::LightingConfig;
use crate::foundation::collections::SecondaryMap;
use crate::render::api::{DeviceCaps, GraphicsDevice};
use crate::scene::{Span, SpanLight, SpanProps, SpanRef, VisRegionFilter};

/// Lights chosen for one span
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LightSelection {
    /// Vertex lights, light group first then by descending strength
    pub lights: Vec<SpanLight>,
    /// Projective lights
    pub projectors: Vec<SpanLight>,
}

/// Chooses the lights that illuminate each span
#[derive(Debug)]
pub struct LightSelector {
    config: LightingConfig,
    max_lights: usize,
    unrestricted: Vec<LightId>,
    character: Vec<LightId>,
    affected: SecondaryMap<LightId, Vec<SpanRef>>,
}

impl LightSelector {
    /// Create a selector; the light budget is clamped to the device
    pub fn new(config: LightingConfig, caps: &DeviceCaps) -> Self {
        let mut selector = Self {
            config,
            max_lights: 0,
            unrestricted: Vec::new(),
            character: Vec::new(),
            affected: SecondaryMap::new(),
        };
        selector.set_caps(caps);
        selector
    }

    /// Re-clamp the light budget after the device changed
    pub fn set_caps(&mut self, caps: &DeviceCaps) {
        self.max_lights = self.config.max_lights.min(caps.max_lights) as usize;
        log::debug!(
            "Light budget {} (configured {}, device {})",
            self.max_lights,
            self.config.max_lights,
            caps.max_lights
        );
    }

    /// Lights per span
    pub fn max_lights(&self) -> usize {
        self.max_lights
    }

    /// Projective lights per span
    pub fn max_projectors(&self) -> usize {
        self.config.max_projectors as usize
    }

    /// Rebuild the candidate lists and clear last frame's affected spans
    pub fn begin_frame(&mut self, lights: &LightSet, filter: &VisRegionFilter) {
        self.unrestricted.clear();
        self.character.clear();
        self.affected.clear();

        for (id, light) in lights.iter() {
            if !light.is_on() || !filter.admits(light.vis_regions) {
                continue;
            }
            if light.props.contains(LightProps::CHARACTER_ONLY) {
                self.character.push(id);
            } else {
                self.unrestricted.push(id);
            }
        }
        log::trace!(
            "Light candidates: {} unrestricted, {} character",
            self.unrestricted.len(),
            self.character.len()
        );
    }

    /// Unrestricted candidates this frame
    pub fn candidates(&self) -> &[LightId] {
        &self.unrestricted
    }

    /// Character-only candidates this frame
    pub fn character_candidates(&self) -> &[LightId] {
        &self.character
    }

    /// Spans a light was selected for this frame
    pub fn affected_spans(&self, light: LightId) -> &[SpanRef] {
        self.affected.get(light).map_or(&[], Vec::as_slice)
    }

    /// Select lights for a span and record it against every chosen light
    pub fn select(&mut self, lights: &LightSet, span: &Span, at: SpanRef) -> LightSelection {
        let center = span.world_bounds.center();
        let mut selection = LightSelection::default();

        for &id in &span.light_group {
            let Some(light) = lights.get(id).filter(|light| light.is_on()) else {
                continue;
            };
            let (list, cap) = if light.is_projector() {
                (&mut selection.projectors, self.max_projectors())
            } else {
                (&mut selection.lights, self.max_lights)
            };
            if list.len() < cap && list.iter().all(|chosen| chosen.light != id) {
                list.push(SpanLight { light: id, strength: light.strength_at(center), scale: 1.0 });
            }
        }

        let mut ranked = Vec::new();
        let mut ranked_projectors = Vec::new();
        let character_lights: &[LightId] = if span.has(SpanProps::CHARACTER) { &self.character } else { &[] };
        for &id in self.unrestricted.iter().chain(character_lights) {
            if span.light_group.contains(&id) {
                continue;
            }
            let Some(light) = lights.get(id) else {
                continue;
            };
            if !light.is_projector() && !span.has(SpanProps::RUNTIME_LIT) {
                continue;
            }
            if !light.affects(&span.world_bounds) {
                continue;
            }
            let strength = light.strength_at(center);
            if strength < self.config.min_strength {
                continue;
            }
            let entry = SpanLight { light: id, strength, scale: 1.0 };
            if light.is_projector() {
                ranked_projectors.push(entry);
            } else {
                ranked.push(entry);
            }
        }

        // Stable: equal strengths keep candidate order
        ranked.sort_by(|a, b| b.strength.total_cmp(&a.strength));
        ranked_projectors.sort_by(|a, b| b.strength.total_cmp(&a.strength));

        let first_ranked = selection.lights.len();
        let room = self.max_lights.saturating_sub(first_ranked);
        let rejected = ranked.get(room).map(|light| light.strength);
        ranked.truncate(room);
        selection.lights.extend(ranked);
        if let Some(threshold) = rejected {
            self.fade(&mut selection.lights[first_ranked..], threshold);
        }

        let room = self.max_projectors().saturating_sub(selection.projectors.len());
        ranked_projectors.truncate(room);
        selection.projectors.extend(ranked_projectors);

        for chosen in selection.lights.iter().chain(&selection.projectors) {
            if let Some(spans) = self.affected.entry(chosen.light).map(|entry| entry.or_default()) {
                spans.push(at);
            }
        }

        selection
    }

    /// Scale lights whose strength lies within the hold band above the
    /// strongest rejected candidate
    fn fade(&self, chosen: &mut [SpanLight], rejected: f32) {
        let hold = rejected * (1.0 + self.config.fade_hold);
        if hold <= rejected {
            return;
        }
        for light in chosen.iter_mut().filter(|light| light.strength < hold) {
            light.scale = ((light.strength - rejected) / (hold - rejected)).clamp(0.0, 1.0);
        }
    }

    /// Upload a selection into the device light slots, disabling the rest
    pub fn apply(
        &self,
        device: &mut dyn GraphicsDevice,
        lights: &LightSet,
        selection: &[SpanLight],
        enabled_slots: &mut u32,
    ) {
        let mut slot = 0;
        for chosen in selection.iter().take(self.max_lights) {
            if let Some(light) = lights.get(chosen.light) {
                device.set_light(slot, Some(&light.to_gpu(chosen.scale)));
                slot += 1;
            }
        }
        for stale in slot..*enabled_slots {
            device.set_light(stale, None);
        }
        *enabled_slots = slot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec3;
    use crate::render::api::GpuLightKind;
    use crate::render::backends::{DeviceCall, RecordingDevice};
    use crate::render::lighting::Light;
    use crate::scene::{DrawableKey, VisRegionMask, AABB};
    use approx::assert_relative_eq;

    fn white() -> Vec3 {
        Vec3::new(1.0, 1.0, 1.0)
    }

    fn span_at(center: Vec3) -> Span {
        Span::new(0, 0, AABB::from_center_extents(center, Vec3::new(0.5, 0.5, 0.5)))
    }

    fn at(span: usize) -> SpanRef {
        SpanRef { drawable: DrawableKey(1), span }
    }

    fn selector(max_lights: u32) -> LightSelector {
        let config = LightingConfig { max_lights, ..LightingConfig::default() };
        LightSelector::new(config, &DeviceCaps::default())
    }

    #[test]
    fn test_budget_is_clamped_to_device() {
        let config = LightingConfig { max_lights: 16, ..LightingConfig::default() };
        let caps = DeviceCaps { max_lights: 4, ..DeviceCaps::default() };
        assert_eq!(LightSelector::new(config, &caps).max_lights(), 4);
    }

    #[test]
    fn test_strongest_lights_win() {
        let mut lights = LightSet::new();
        let weak = lights.insert(Light::directional(Vec3::y(), white(), 0.2));
        let strong = lights.insert(Light::directional(Vec3::y(), white(), 1.0));
        let medium = lights.insert(Light::directional(Vec3::y(), white(), 0.6));

        let mut selector = selector(2);
        selector.begin_frame(&lights, &VisRegionFilter::all());
        let selection = selector.select(&lights, &span_at(Vec3::zeros()), at(0));

        let ids: Vec<_> = selection.lights.iter().map(|light| light.light).collect();
        assert_eq!(ids, vec![strong, medium]);
        assert!(!ids.contains(&weak));
        assert_eq!(selector.affected_spans(strong), &[at(0)]);
        assert!(selector.affected_spans(weak).is_empty());
    }

    #[test]
    fn test_ranking_is_deterministic() {
        let mut lights = LightSet::new();
        let ids: Vec<_> = (0..6)
            .map(|i| lights.insert(Light::directional(Vec3::y(), white(), if i % 2 == 0 { 1.0 } else { 0.5 })))
            .collect();

        let mut selector = selector(4);
        selector.begin_frame(&lights, &VisRegionFilter::all());
        let span = span_at(Vec3::zeros());
        let first = selector.select(&lights, &span, at(0));
        for _ in 0..10 {
            assert_eq!(selector.select(&lights, &span, at(0)), first);
        }
        // Ties keep candidate order
        let chosen: Vec<_> = first.lights.iter().map(|light| light.light).collect();
        assert_eq!(chosen, vec![ids[0], ids[2], ids[4], ids[1]]);
    }

    #[test]
    fn test_light_group_bypasses_ranking() {
        let mut lights = LightSet::new();
        let dim = lights.insert(Light::directional(Vec3::y(), white(), 0.01));
        let bright = lights.insert(Light::directional(Vec3::y(), white(), 1.0));
        let brighter = lights.insert(Light::directional(Vec3::y(), white(), 2.0));

        let mut selector = selector(2);
        selector.begin_frame(&lights, &VisRegionFilter::all());
        let span = span_at(Vec3::zeros()).with_light_group(vec![dim]);
        let selection = selector.select(&lights, &span, at(0));

        let ids: Vec<_> = selection.lights.iter().map(|light| light.light).collect();
        assert_eq!(ids, vec![dim, brighter]);
        assert_relative_eq!(selection.lights[0].scale, 1.0);
        assert!(!ids.contains(&bright));
    }

    #[test]
    fn test_lights_near_cutoff_fade() {
        let mut lights = LightSet::new();
        let strong = lights.insert(Light::directional(Vec3::y(), white(), 1.0));
        let close = lights.insert(Light::directional(Vec3::y(), white(), 0.55));
        lights.insert(Light::directional(Vec3::y(), white(), 0.5));

        let config = LightingConfig { max_lights: 2, fade_hold: 0.2, ..LightingConfig::default() };
        let mut selector = LightSelector::new(config, &DeviceCaps::default());
        selector.begin_frame(&lights, &VisRegionFilter::all());
        let selection = selector.select(&lights, &span_at(Vec3::zeros()), at(0));

        // t = 0.5, h = 0.6: 0.55 sits halfway through the band
        assert_eq!(selection.lights[0].light, strong);
        assert_relative_eq!(selection.lights[0].scale, 1.0);
        assert_eq!(selection.lights[1].light, close);
        assert_relative_eq!(selection.lights[1].scale, 0.5, epsilon = 1e-4);
    }

    #[test]
    fn test_character_and_region_filters() {
        let mut lights = LightSet::new();
        let character = lights.insert(
            Light::directional(Vec3::y(), white(), 1.0).with_props(LightProps::CHARACTER_ONLY),
        );
        let outside = lights.insert(
            Light::directional(Vec3::y(), white(), 1.0).with_vis_regions(VisRegionMask::region(3)),
        );
        let everywhere = lights.insert(Light::directional(Vec3::y(), white(), 0.5));

        let mut selector = selector(8);
        let filter = VisRegionFilter { include: VisRegionMask::region(1), exclude: VisRegionMask::NONE };
        selector.begin_frame(&lights, &filter);
        assert_eq!(selector.candidates(), &[everywhere]);
        assert_eq!(selector.character_candidates(), &[character]);

        let prop = selector.select(&lights, &span_at(Vec3::zeros()), at(0));
        assert_eq!(prop.lights.len(), 1);

        let actor = span_at(Vec3::zeros()).with_props(SpanProps::RUNTIME_LIT | SpanProps::CHARACTER);
        let ids: Vec<_> = selector.select(&lights, &actor, at(1)).lights.iter().map(|l| l.light).collect();
        assert_eq!(ids, vec![character, everywhere]);
        assert!(!ids.contains(&outside));
    }

    #[test]
    fn test_out_of_range_lights_are_ignored() {
        let mut lights = LightSet::new();
        lights.insert(Light::point(Vec3::new(100.0, 0.0, 0.0), white(), 1.0, 5.0));

        let mut selector = selector(8);
        selector.begin_frame(&lights, &VisRegionFilter::all());
        let selection = selector.select(&lights, &span_at(Vec3::zeros()), at(0));
        assert!(selection.lights.is_empty());
    }

    #[test]
    fn test_apply_disables_stale_slots() {
        let mut lights = LightSet::new();
        let a = lights.insert(Light::directional(Vec3::y(), white(), 1.0));
        let b = lights.insert(Light::point(Vec3::zeros(), white(), 1.0, 10.0));
        let selector = selector(8);
        let mut device = RecordingDevice::new(DeviceCaps::default());
        let mut enabled = 0;

        let both = [
            SpanLight { light: a, strength: 1.0, scale: 1.0 },
            SpanLight { light: b, strength: 1.0, scale: 1.0 },
        ];
        selector.apply(&mut device, &lights, &both, &mut enabled);
        assert_eq!(enabled, 2);

        device.clear_calls();
        selector.apply(&mut device, &lights, &both[..1], &mut enabled);
        assert_eq!(enabled, 1);
        assert!(matches!(
            device.calls(),
            [
                DeviceCall::SetLight { slot: 0, light: Some(light) },
                DeviceCall::SetLight { slot: 1, light: None },
            ] if light.kind == GpuLightKind::Directional
        ));
    }
}
