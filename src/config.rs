// SPDX-License-Identifier: GPL-3.0-only
//! Persisted display configuration
//!
//! A [`GlassConfig`] is one user-level virtual display entry. The ordered list
//! of entries plus [`Settings`] is everything that gets written to disk; live
//! device, stream and window handles never are.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

pub type GlassId = String;
pub type DisplayId = u32;

pub const DEFAULT_DISPLAY_NAME: &str = "New Display";
pub const DEFAULT_UNREGISTER_DELAY_SECS: f64 = 5.0 * 60.0;

static NEXT_GLASS_SEQ: AtomicU64 = AtomicU64::new(0);

/// Allocate a fresh entry id.
///
/// The sequence number keeps ids unique within a run, the timestamp keeps
/// them apart from ids loaded from a previous run.
pub fn next_glass_id() -> GlassId {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let seq = NEXT_GLASS_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("glass-{millis:x}-{seq}")
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayMode {
    pub width_pixels: u32,
    pub height_pixels: u32,
    pub refresh_rate_hz: f64,
}

impl Default for DisplayMode {
    fn default() -> Self {
        Self {
            width_pixels: 1920,
            height_pixels: 1024,
            refresh_rate_hz: 60.0,
        }
    }
}

/// Description handed to the device factory
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayConfig {
    /// Overwritten with the id the device reports once registered
    pub id: DisplayId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub product_id: u32,
    pub vendor_id: u32,
    pub serial_number: u32,
    pub width_in_millimeters: u32,
    pub height_in_millimeters: u32,
    pub max_width_pixels: u32,
    pub max_height_pixels: u32,
    #[serde(default = "default_display_modes")]
    pub display_modes: Vec<DisplayMode>,
}

fn default_display_modes() -> Vec<DisplayMode> {
    vec![DisplayMode::default()]
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            id: rand::random::<DisplayId>(),
            name: Some(String::new()),
            product_id: rand::random(),
            vendor_id: rand::random(),
            serial_number: rand::random(),
            width_in_millimeters: 1800,
            height_in_millimeters: 1012,
            max_width_pixels: 1920,
            max_height_pixels: 1080,
            display_modes: default_display_modes(),
        }
    }
}

impl DisplayConfig {
    pub fn add_mode(&mut self, mode: DisplayMode) {
        self.display_modes.push(mode);
    }

    /// Remove the first mode equal to `mode`.
    ///
    /// The list never ends up empty: removing the last mode puts the default
    /// one back.
    pub fn remove_mode(&mut self, mode: &DisplayMode) -> bool {
        let removed = match self.display_modes.iter().position(|m| m == mode) {
            Some(index) => {
                self.display_modes.remove(index);
                true
            }
            None => false,
        };
        self.normalize();
        removed
    }

    pub fn normalize(&mut self) {
        if self.display_modes.is_empty() {
            self.display_modes.push(DisplayMode::default());
        }
    }
}

/// One virtual display entry as the editor sees it
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlassConfig {
    pub id: GlassId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub display_config: DisplayConfig,
    /// Intent from the last run until the controller reconciles it
    #[serde(default)]
    pub registered: bool,
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_width_pixels: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_height_pixels: Option<u32>,
    #[serde(default)]
    pub render_delay_seconds: f32,
    #[serde(default = "default_window_width")]
    pub window_width_pixels: u32,
    #[serde(default = "default_window_height")]
    pub window_height_pixels: u32,
}

fn default_window_width() -> u32 {
    800
}

fn default_window_height() -> u32 {
    450
}

impl GlassConfig {
    /// A fresh entry with a new id and default display parameters
    pub fn new_default() -> Self {
        Self {
            id: next_glass_id(),
            name: Some(String::new()),
            display_config: DisplayConfig::default(),
            registered: false,
            active: false,
            render_width_pixels: None,
            render_height_pixels: None,
            render_delay_seconds: 0.0,
            window_width_pixels: default_window_width(),
            window_height_pixels: default_window_height(),
        }
    }

    /// The entry the editor adds when asked for a new display
    pub fn new_display(name: Option<String>) -> Self {
        let mut config = Self::new_default();
        config.display_config.name = Some(DEFAULT_DISPLAY_NAME.to_string());
        if let Some(name) = name {
            config.name = Some(name);
        }
        config
    }

    /// Title for the presentation window.
    ///
    /// First non-blank of: entry name, display name, device id. Falls back to
    /// the entry id so the title is never empty.
    pub fn window_title(&self, display_id: Option<DisplayId>) -> String {
        let named = [self.name.as_deref(), self.display_config.name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|s| !s.is_empty())
            .map(str::to_string);

        named
            .or_else(|| display_id.map(|id| id.to_string()))
            .unwrap_or_else(|| self.id.clone())
    }

    pub fn window_size(&self) -> (u32, u32) {
        (self.window_width_pixels, self.window_height_pixels)
    }

    /// Stream output size: render override per axis, else the window size
    pub fn output_size(&self) -> (u32, u32) {
        (
            self.render_width_pixels.unwrap_or(self.window_width_pixels),
            self.render_height_pixels.unwrap_or(self.window_height_pixels),
        )
    }

    /// Minimum time between frames. Negative or NaN means no delay.
    pub fn frame_delay(&self) -> Duration {
        seconds_or_max(self.render_delay_seconds.into())
    }

    /// Copy the user-editable fields of `other` into `self`.
    ///
    /// Identity, runtime flags and the device-assigned display id stay put.
    pub fn apply_edit(&mut self, other: &GlassConfig) {
        let display_id = self.display_config.id;

        self.name = other.name.clone();
        self.display_config = other.display_config.clone();
        self.display_config.id = display_id;
        self.display_config.normalize();
        self.render_width_pixels = other.render_width_pixels;
        self.render_height_pixels = other.render_height_pixels;
        self.render_delay_seconds = other.render_delay_seconds;
        self.window_width_pixels = other.window_width_pixels;
        self.window_height_pixels = other.window_height_pixels;
    }
}

/// Remove an entry, keeping at least one entry in the list
pub fn remove_config(configs: &mut Vec<GlassConfig>, id: &str) -> Option<GlassConfig> {
    let removed = configs
        .iter()
        .position(|c| c.id == id)
        .map(|index| configs.remove(index));
    ensure_not_empty(configs);
    removed
}

pub fn ensure_not_empty(configs: &mut Vec<GlassConfig>) {
    if configs.is_empty() {
        configs.push(GlassConfig::new_display(None));
    }
}

/// Application-wide settings stored next to the display list
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_unregister_enabled")]
    pub automatic_unregister_enabled: bool,
    #[serde(default = "default_unregister_delay")]
    pub automatic_unregister_delay_in_seconds: f64,
}

fn default_unregister_enabled() -> bool {
    true
}

fn default_unregister_delay() -> f64 {
    DEFAULT_UNREGISTER_DELAY_SECS
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            automatic_unregister_enabled: default_unregister_enabled(),
            automatic_unregister_delay_in_seconds: default_unregister_delay(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        let delay = self.automatic_unregister_delay_in_seconds;
        if !delay.is_finite() || delay < 0.0 {
            return Err(AppError::Config(format!(
                "automatic unregister delay must be a non-negative number of seconds, got {delay}"
            )));
        }
        Ok(())
    }

    /// Delays too long for a `Duration` saturate rather than wrap to zero
    pub fn unregister_delay(&self) -> Duration {
        seconds_or_max(self.automatic_unregister_delay_in_seconds)
    }
}

fn seconds_or_max(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
