//! Display modes and engine settings

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Identifier of a [`DisplayConfig`], unique per display across hotplugs
pub type ConfigId = u32;

/// Refresh period used before a display reports its own
pub const DEFAULT_VSYNC_PERIOD: Duration = Duration::from_nanos(16_666_667);

/// One admissible display mode
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayConfig {
    /// Identifier handed to clients
    pub id: ConfigId,
    /// Width in pixels
    pub width: i32,
    /// Height in pixels
    pub height: i32,
    /// Horizontal dots per inch
    pub dpi_x: f32,
    /// Vertical dots per inch
    pub dpi_y: f32,
    /// Time between two refreshes
    pub vsync_period: Duration,
    /// Configs in the same group can be switched between seamlessly
    pub config_group: i32,
    /// Backend defined mode identifier, 0 if the config has no hardware mode
    pub mode_id: u64,
}

impl DisplayConfig {
    /// Builds a config from a refresh rate in Hz
    pub fn new(id: ConfigId, width: i32, height: i32, refresh_hz: u32, dpi: f32) -> DisplayConfig {
        DisplayConfig {
            id,
            width,
            height,
            dpi_x: dpi,
            dpi_y: dpi,
            vsync_period: period_from_hz(refresh_hz),
            config_group: 0,
            mode_id: 0,
        }
    }

    /// Refresh rate in Hz, rounded
    pub fn refresh_hz(&self) -> u32 {
        let nanos = self.vsync_period.as_nanos();
        if nanos == 0 {
            return 0;
        }
        ((1_000_000_000u128 + nanos / 2) / nanos) as u32
    }
}

/// Converts a refresh rate to a refresh period, falling back to 60Hz for 0
pub fn period_from_hz(hz: u32) -> Duration {
    let hz = if hz == 0 { 60 } else { hz };
    Duration::from_nanos(1_000_000_000 / hz as u64)
}

/// How the client target reaches the screen when its size differs from the mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiScale {
    /// The primary plane scales from the config size to the mode size
    Hardware,
    /// The client renders at mode size
    Software,
    /// No scaling, the target is shown at its own size
    #[default]
    None,
}

/// Mode preferred when building the config set of a display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferredMode {
    /// Width in pixels
    pub width: i32,
    /// Height in pixels
    pub height: i32,
    /// Refresh rate in Hz, 0 for any
    pub refresh: u32,
}

/// Engine wide settings
///
/// Built by the embedding service; every field has a default so partial
/// JSON documents deserialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Allow layers on overlay planes
    pub overlay_enabled: bool,
    /// Prefer the 2D blit engine over client composition
    pub blit_enabled: bool,
    /// Buffer identity cache entries per display
    pub buffer_cache_per_display: usize,
    /// Blit targets rotated per display
    pub composer_targets: usize,
    /// Upper bound for waiting on acquire fences, in milliseconds
    pub fence_timeout_ms: u64,
    /// Period used when a display does not report one, in nanoseconds
    pub default_vsync_period_ns: u64,
    /// Wait for hardware vblank events instead of software timing
    pub hardware_vsync: bool,
    /// Location of the persisted key-value store
    pub store_path: PathBuf,
    /// sysfs class directory holding backlight devices
    pub backlight_root: PathBuf,
    /// Backlight device driven by the primary display
    pub backlight_device: String,
    /// Vendor suffix of the blit library, `libg2d-<suffix>.so`
    pub blit_library: Option<String>,
    /// Client target scaling on the primary plane
    pub ui_scale: UiScale,
    /// Preferred mode for newly connected displays
    pub preferred_mode: Option<PreferredMode>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            overlay_enabled: true,
            blit_enabled: true,
            buffer_cache_per_display: 10,
            composer_targets: 3,
            fence_timeout_ms: 3000,
            default_vsync_period_ns: DEFAULT_VSYNC_PERIOD.as_nanos() as u64,
            hardware_vsync: true,
            store_path: PathBuf::from("/var/lib/hwcomposer/settings.json"),
            backlight_root: PathBuf::from("/sys/class/backlight"),
            backlight_device: String::from("pwm-backlight"),
            blit_library: None,
            ui_scale: UiScale::None,
            preferred_mode: None,
        }
    }
}

impl EngineConfig {
    /// Fence wait bound as a [`Duration`]
    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }

    /// Default refresh period as a [`Duration`]
    pub fn default_vsync_period(&self) -> Duration {
        Duration::from_nanos(self.default_vsync_period_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_round_trips_common_rates() {
        for hz in [30, 50, 60, 75, 90, 120] {
            assert_eq!(DisplayConfig::new(0, 1, 1, hz, 160.0).refresh_hz(), hz);
        }
        assert_eq!(period_from_hz(0), period_from_hz(60));
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "overlay_enabled": false, "ui_scale": "hardware" }"#).unwrap();
        assert!(!config.overlay_enabled);
        assert_eq!(config.ui_scale, UiScale::Hardware);
        assert_eq!(config.buffer_cache_per_display, 10);
        assert_eq!(config.fence_timeout(), Duration::from_secs(3));
    }
}
