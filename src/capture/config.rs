//! Recording configuration
//!
//! `RecordingConfig` is resolved once per session from the capture mode, the
//! target, the user's settings and the target's geometry. Resolution is a pure
//! function: identical inputs always produce an identical config.

use crate::capture::content::{DisplayInfo, SourceGeometry};
use crate::export::ExportQuality;
use crate::recorder::state::CaptureMode;
use crate::settings::UserSettings;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Frame rates a session may record at
pub const ALLOWED_FPS: [u32; 2] = [30, 60];

/// Frame rate used when the requested one is not allowed
pub const DEFAULT_FPS: u32 = 60;

/// Resolution/bitrate ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    /// 720p, 5 Mbps
    Low,
    /// 1080p, 8 Mbps
    Medium,
    /// Native, 12 Mbps
    High,
}

impl QualityPreset {
    /// Height cap, `None` for native
    pub fn max_height(&self) -> Option<u32> {
        match self {
            QualityPreset::Low => Some(720),
            QualityPreset::Medium => Some(1080),
            QualityPreset::High => None,
        }
    }

    /// Target video bitrate in bits per second
    pub fn bitrate(&self) -> u32 {
        match self {
            QualityPreset::Low => 5_000_000,
            QualityPreset::Medium => 8_000_000,
            QualityPreset::High => 12_000_000,
        }
    }

    /// Scale a native size down to this preset
    ///
    /// Capped presets keep the aspect ratio and round the width to an even
    /// pixel count; `High` passes the native size through unchanged.
    pub fn scale(&self, native: Size) -> Size {
        match self.max_height() {
            Some(cap) if native.height > cap => {
                let width = native.width as f64 * cap as f64 / native.height as f64;
                Size {
                    width: round_even(width),
                    height: cap,
                }
            }
            _ => native,
        }
    }
}

fn round_even(value: f64) -> u32 {
    (((value / 2.0).round() as u32) * 2).max(2)
}

/// yuv420p needs even dimensions
fn floor_even(value: u32) -> u32 {
    value & !1
}

/// Width and height in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    /// Round both dimensions down to even, never below 2
    pub fn even(self) -> Self {
        Self {
            width: floor_even(self.width).max(2),
            height: floor_even(self.height).max(2),
        }
    }
}

/// A rectangle in display points, relative to the display origin
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CaptureRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// A rectangle in physical pixels, relative to the display origin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn size(&self) -> Size {
        Size {
            width: self.width,
            height: self.height,
        }
    }
}

/// What to capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CaptureTarget {
    Fullscreen {
        #[serde(default)]
        display_id: Option<u32>,
    },
    Window {
        window_id: u32,
    },
    Area {
        rect: CaptureRect,
        display_id: u32,
    },
}

impl CaptureTarget {
    pub fn fullscreen() -> Self {
        CaptureTarget::Fullscreen { display_id: None }
    }
}

/// Invalid or unsupported settings detected before any engine starts
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Capture area is empty ({width}x{height})")]
    EmptyArea { width: f64, height: f64 },

    #[error("Capture area lies outside display {display_id}")]
    AreaOutsideDisplay { display_id: u32 },

    #[error("Target geometry does not match the requested target")]
    GeometryMismatch,
}

/// Audio input device names passed through to the engines
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioDevices {
    pub microphone: Option<String>,
    pub system_audio: Option<String>,
}

/// Immutable per-session recording configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingConfig {
    pub mode: CaptureMode,
    pub target: CaptureTarget,
    pub quality: QualityPreset,
    pub fps: u32,
    pub include_cursor: bool,
    pub show_mouse_clicks: bool,
    pub include_microphone: bool,
    pub include_system_audio: bool,
    pub excludes_current_process_audio: bool,
    pub export_quality: ExportQuality,
    pub audio_devices: AudioDevices,

    /// Display being captured
    pub display: DisplayInfo,
    /// Crop region within the display, `None` for the whole display
    pub region: Option<PixelRect>,
    /// Captured size in physical pixels
    pub source: Size,
    /// Encoded size after the quality ladder
    pub output: Size,
    /// Video bitrate in bits per second
    pub bitrate: u32,
}

impl RecordingConfig {
    /// Resolve the configuration for a session
    pub fn resolve(
        mode: CaptureMode,
        target: CaptureTarget,
        settings: &UserSettings,
        geometry: &SourceGeometry,
    ) -> Result<Self, ConfigError> {
        let display = &geometry.display;
        let display_px = display.pixel_size();

        let region = match &target {
            CaptureTarget::Fullscreen { .. } => None,
            CaptureTarget::Area { rect, .. } => {
                if rect.width <= 0.0 || rect.height <= 0.0 {
                    return Err(ConfigError::EmptyArea {
                        width: rect.width,
                        height: rect.height,
                    });
                }
                Some(clamp_to_display(*rect, display)?)
            }
            CaptureTarget::Window { .. } => {
                let window = geometry.window.as_ref().ok_or(ConfigError::GeometryMismatch)?;
                let rect = CaptureRect {
                    x: (window.x - display.x) as f64,
                    y: (window.y - display.y) as f64,
                    width: window.width as f64,
                    height: window.height as f64,
                };
                Some(clamp_to_display(rect, display)?)
            }
        };

        let source = region.map(|r| r.size()).unwrap_or(display_px);
        let fps = if ALLOWED_FPS.contains(&settings.fps) {
            settings.fps
        } else {
            DEFAULT_FPS
        };

        Ok(Self {
            mode,
            target,
            quality: settings.quality,
            fps,
            include_cursor: settings.include_cursor,
            show_mouse_clicks: settings.show_mouse_clicks,
            include_microphone: settings.include_microphone,
            include_system_audio: settings.include_system_audio,
            excludes_current_process_audio: settings.excludes_current_process_audio,
            export_quality: settings.export_quality,
            audio_devices: AudioDevices {
                microphone: settings.microphone_device.clone(),
                system_audio: settings.system_audio_device.clone(),
            },
            display: display.clone(),
            region,
            source,
            output: settings.quality.scale(source).even(),
            bitrate: settings.quality.bitrate(),
        })
    }

    /// Whether any audio channel was requested
    pub fn wants_audio(&self) -> bool {
        self.include_microphone || self.include_system_audio
    }
}

/// Convert a point rect to pixels and clamp it to the display
fn clamp_to_display(rect: CaptureRect, display: &DisplayInfo) -> Result<PixelRect, ConfigError> {
    let bounds = display.pixel_size();
    let scale = display.scale_factor;

    let left = (rect.x * scale).round().max(0.0);
    let top = (rect.y * scale).round().max(0.0);
    let right = ((rect.x + rect.width) * scale).round().min(bounds.width as f64);
    let bottom = ((rect.y + rect.height) * scale).round().min(bounds.height as f64);

    if right <= left || bottom <= top {
        return Err(ConfigError::AreaOutsideDisplay {
            display_id: display.id,
        });
    }

    let width = floor_even((right - left) as u32);
    let height = floor_even((bottom - top) as u32);
    if width == 0 || height == 0 {
        return Err(ConfigError::EmptyArea {
            width: rect.width,
            height: rect.height,
        });
    }

    Ok(PixelRect {
        x: left as u32,
        y: top as u32,
        width,
        height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::content::WindowInfo;

    fn display() -> DisplayInfo {
        DisplayInfo {
            id: 1,
            name: "Main".to_string(),
            width: 1920,
            height: 1080,
            scale_factor: 2.0,
            is_primary: true,
            x: 0,
            y: 0,
        }
    }

    fn geometry() -> SourceGeometry {
        SourceGeometry {
            display: display(),
            window: None,
        }
    }

    #[test]
    fn test_quality_ladder() {
        let native = Size {
            width: 3840,
            height: 2160,
        };
        assert_eq!(
            QualityPreset::Low.scale(native),
            Size {
                width: 1280,
                height: 720
            }
        );
        assert_eq!(
            QualityPreset::Medium.scale(native),
            Size {
                width: 1920,
                height: 1080
            }
        );
        assert_eq!(QualityPreset::High.scale(native), native);
    }

    #[test]
    fn test_low_quality_keeps_small_sources() {
        let small = Size {
            width: 800,
            height: 600,
        };
        assert_eq!(QualityPreset::Low.scale(small), small);
    }

    #[test]
    fn test_low_quality_rounds_width_to_even() {
        let odd = Size {
            width: 1001,
            height: 1000,
        };
        let scaled = QualityPreset::Low.scale(odd);
        assert_eq!(scaled.height, 720);
        assert_eq!(scaled.width % 2, 0);
    }

    #[test]
    fn test_fps_falls_back_to_default() {
        let settings = UserSettings {
            fps: 45,
            ..UserSettings::default()
        };
        let config = RecordingConfig::resolve(
            CaptureMode::Video,
            CaptureTarget::fullscreen(),
            &settings,
            &geometry(),
        )
        .unwrap();
        assert_eq!(config.fps, DEFAULT_FPS);

        let settings = UserSettings {
            fps: 30,
            ..UserSettings::default()
        };
        let config = RecordingConfig::resolve(
            CaptureMode::Video,
            CaptureTarget::fullscreen(),
            &settings,
            &geometry(),
        )
        .unwrap();
        assert_eq!(config.fps, 30);
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let settings = UserSettings::default();
        let target = CaptureTarget::Area {
            rect: CaptureRect {
                x: 10.0,
                y: 20.0,
                width: 640.0,
                height: 360.0,
            },
            display_id: 1,
        };
        let a = RecordingConfig::resolve(CaptureMode::DerivedImage, target.clone(), &settings, &geometry())
            .unwrap();
        let b = RecordingConfig::resolve(CaptureMode::DerivedImage, target, &settings, &geometry())
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_area_is_scaled_and_clamped() {
        let settings = UserSettings::default();
        let target = CaptureTarget::Area {
            rect: CaptureRect {
                x: 1800.0,
                y: 1000.0,
                width: 400.0,
                height: 400.0,
            },
            display_id: 1,
        };
        let config =
            RecordingConfig::resolve(CaptureMode::Video, target, &settings, &geometry()).unwrap();
        assert_eq!(
            config.region,
            Some(PixelRect {
                x: 3600,
                y: 2000,
                width: 240,
                height: 160
            })
        );
        assert_eq!(
            config.source,
            Size {
                width: 240,
                height: 160
            }
        );
    }

    #[test]
    fn test_odd_regions_encode_at_even_sizes() {
        let geometry = SourceGeometry {
            display: DisplayInfo {
                width: 1365,
                height: 767,
                scale_factor: 1.0,
                ..display()
            },
            window: None,
        };
        let area = CaptureTarget::Area {
            rect: CaptureRect {
                x: 3.0,
                y: 5.0,
                width: 641.0,
                height: 481.0,
            },
            display_id: 1,
        };

        for quality in [QualityPreset::Low, QualityPreset::Medium, QualityPreset::High] {
            let settings = UserSettings {
                quality,
                ..UserSettings::default()
            };
            let config =
                RecordingConfig::resolve(CaptureMode::Video, area.clone(), &settings, &geometry)
                    .unwrap();
            assert_eq!(
                config.source,
                Size {
                    width: 640,
                    height: 480
                }
            );
            assert_eq!(config.output, config.source);

            let config = RecordingConfig::resolve(
                CaptureMode::Video,
                CaptureTarget::fullscreen(),
                &settings,
                &geometry,
            )
            .unwrap();
            assert_eq!(config.output.width % 2, 0);
            assert_eq!(config.output.height % 2, 0);
        }
    }

    #[test]
    fn test_single_pixel_area_is_empty() {
        let area = CaptureTarget::Area {
            rect: CaptureRect {
                x: 0.0,
                y: 0.0,
                width: 0.5,
                height: 100.0,
            },
            display_id: 1,
        };
        assert!(matches!(
            RecordingConfig::resolve(CaptureMode::Video, area, &UserSettings::default(), &geometry()),
            Err(ConfigError::EmptyArea { .. })
        ));
    }

    #[test]
    fn test_invalid_areas_are_rejected() {
        let settings = UserSettings::default();
        let empty = CaptureTarget::Area {
            rect: CaptureRect {
                x: 0.0,
                y: 0.0,
                width: 0.0,
                height: 100.0,
            },
            display_id: 1,
        };
        assert!(matches!(
            RecordingConfig::resolve(CaptureMode::Video, empty, &settings, &geometry()),
            Err(ConfigError::EmptyArea { .. })
        ));

        let outside = CaptureTarget::Area {
            rect: CaptureRect {
                x: 5000.0,
                y: 0.0,
                width: 100.0,
                height: 100.0,
            },
            display_id: 1,
        };
        assert_eq!(
            RecordingConfig::resolve(CaptureMode::Video, outside, &settings, &geometry()),
            Err(ConfigError::AreaOutsideDisplay { display_id: 1 })
        );
    }

    #[test]
    fn test_window_region_is_display_relative() {
        let settings = UserSettings {
            quality: QualityPreset::Low,
            ..UserSettings::default()
        };
        let geometry = SourceGeometry {
            display: DisplayInfo {
                x: 1920,
                scale_factor: 1.0,
                ..display()
            },
            window: Some(WindowInfo {
                id: 5,
                title: "Editor".to_string(),
                app_name: "Editor".to_string(),
                display_id: 1,
                x: 2020,
                y: 50,
                width: 1000,
                height: 800,
            }),
        };
        let config = RecordingConfig::resolve(
            CaptureMode::Video,
            CaptureTarget::Window { window_id: 5 },
            &settings,
            &geometry,
        )
        .unwrap();
        assert_eq!(
            config.region,
            Some(PixelRect {
                x: 100,
                y: 50,
                width: 1000,
                height: 800
            })
        );
        assert_eq!(
            config.output,
            Size {
                width: 900,
                height: 720
            }
        );
        assert_eq!(config.bitrate, 5_000_000);
    }
}
