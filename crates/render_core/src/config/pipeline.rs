//! Pipeline configuration structures

use super::Config;
use serde::{Deserialize, Serialize};

/// # Pipeline Configuration
///
/// Top-level settings for a [`RenderContext`](crate::render::RenderContext).
/// Every section falls back to its defaults when omitted from a file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Display surface parameters
    pub display: DisplayParams,
    /// Light selection settings
    pub lighting: LightingConfig,
    /// Shadow map settings
    pub shadows: ShadowConfig,
    /// Managed-pool eviction settings
    pub memory: MemoryConfig,
    /// Material pass planning settings
    pub compositor: CompositorConfig,
}

impl Config for PipelineConfig {}

/// Display surface parameters handed to the backend on creation and reset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayParams {
    /// Back buffer width in pixels
    pub width: u32,
    /// Back buffer height in pixels
    pub height: u32,
    /// Color depth in bits per pixel
    pub color_depth: u32,
    /// Windowed rather than exclusive fullscreen
    pub windowed: bool,
    /// Wait for vertical blank on present
    pub vsync: bool,
}

impl Default for DisplayParams {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            color_depth: 32,
            windowed: true,
            vsync: true,
        }
    }
}

impl DisplayParams {
    /// The reduced configuration used when (re)creation with the requested
    /// parameters fails
    pub fn reduced() -> Self {
        Self {
            width: 640,
            height: 480,
            color_depth: 16,
            windowed: true,
            vsync: false,
        }
    }

    /// True when these parameters already are the reduced fallback
    pub fn is_reduced(&self) -> bool {
        *self == Self::reduced()
    }
}

/// Light selection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LightingConfig {
    /// Maximum simultaneous lights per span, clamped to the device limit
    pub max_lights: u32,
    /// Maximum projective lights per span
    pub max_projectors: u32,
    /// Fraction above the strongest rejected light inside which selected
    /// lights are faded
    pub fade_hold: f32,
    /// Candidates weaker than this are ignored entirely
    pub min_strength: f32,
}

impl Default for LightingConfig {
    fn default() -> Self {
        Self {
            max_lights: 8,
            max_projectors: 12,
            fade_hold: 0.3,
            min_strength: 1.0e-3,
        }
    }
}

/// Shadow map settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    /// Master switch for shadow rendering
    pub enabled: bool,
    /// Smallest pooled render target edge
    pub min_target_size: u32,
    /// Largest pooled render target edge
    pub max_target_size: u32,
    /// Pre-allocated targets per size
    pub targets_per_size: u32,
    /// Upper bound on slaves rendered per frame
    pub max_slaves: usize,
    /// Map size requested for casters that do not ask for one
    pub default_map_size: u32,
    /// Offset samples accumulated by one blur pass
    pub blur_samples: u32,
    /// Maximum darkening for a slave that shadows its own caster
    pub self_shadow_cap: f32,
    /// Number of scratch light slots handed out to slaves
    pub scratch_lights: u32,
    /// How far past the caster a shadow reaches, in world units
    pub attenuation_distance: f32,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_target_size: 32,
            max_target_size: 512,
            targets_per_size: 2,
            max_slaves: 16,
            default_map_size: 256,
            blur_samples: 4,
            self_shadow_cap: 0.5,
            scratch_lights: 4,
            attenuation_distance: 20.0,
        }
    }
}

impl ShadowConfig {
    /// Pooled target edges from largest to smallest
    pub fn pooled_sizes(&self) -> Vec<u32> {
        let min = self.min_target_size.max(1).next_power_of_two();
        let mut sizes = Vec::new();
        let mut size = self.max_target_size.max(min).next_power_of_two();
        while size >= min {
            sizes.push(size);
            size /= 2;
        }
        sizes
    }
}

/// Managed-pool eviction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Managed bytes touched since the last eviction that trigger another
    pub evict_threshold_bytes: u64,
    /// Minimum wall-clock seconds between evictions
    pub evict_min_interval_secs: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            evict_threshold_bytes: 64 * 1024 * 1024,
            evict_min_interval_secs: 10.0,
        }
    }
}

/// Material pass planning settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositorConfig {
    /// Lower the simultaneous texture stage limit below the hardware's
    pub max_layers_at_once: Option<u32>,
    /// Render only each material's base layer (debugging aid)
    pub base_layer_only: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pooled_sizes_descend_by_powers_of_two() {
        let config = ShadowConfig::default();
        assert_eq!(config.pooled_sizes(), vec![512, 256, 128, 64, 32]);

        let odd = ShadowConfig {
            min_target_size: 100,
            max_target_size: 300,
            ..ShadowConfig::default()
        };
        assert_eq!(odd.pooled_sizes(), vec![512, 256, 128]);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [lighting]
            max_lights = 4

            [shadows]
            enabled = false
            "#,
        )
        .expect("Should parse partial config");

        assert_eq!(config.lighting.max_lights, 4);
        assert_eq!(config.lighting.max_projectors, 12);
        assert!(!config.shadows.enabled);
        assert_eq!(config.display, DisplayParams::default());
    }

    #[test]
    fn test_ron_document_parses() {
        let config = PipelineConfig::from_ron_str(
            "(compositor: (max_layers_at_once: Some(2)), memory: (evict_threshold_bytes: 1024))",
        )
        .expect("Should parse RON config");

        assert_eq!(config.compositor.max_layers_at_once, Some(2));
        assert_eq!(config.memory.evict_threshold_bytes, 1024);
        assert_eq!(config.shadows, ShadowConfig::default());
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        let result = PipelineConfig::load_from_file("pipeline.json");
        assert!(matches!(result, Err(crate::config::ConfigError::UnsupportedFormat(_))));
    }
}
