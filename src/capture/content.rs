//! Shareable content
//!
//! Displays and windows that can be captured. Enumeration belongs to the
//! platform/UI collaborator; the core only asks for geometry.

use crate::capture::config::{CaptureTarget, Size};
use serde::{Deserialize, Serialize};

/// Information about a display/screen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayInfo {
    /// Unique display ID
    pub id: u32,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Width in points
    pub width: u32,

    /// Height in points
    pub height: u32,

    /// Scale factor (e.g., 2.0 for Retina)
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,

    /// Whether this is the primary display
    #[serde(default)]
    pub is_primary: bool,

    /// X offset in the virtual desktop
    #[serde(default)]
    pub x: i32,

    /// Y offset in the virtual desktop
    #[serde(default)]
    pub y: i32,
}

fn default_scale_factor() -> f64 {
    1.0
}

impl DisplayInfo {
    /// Size in physical pixels
    pub fn pixel_size(&self) -> Size {
        Size {
            width: (self.width as f64 * self.scale_factor).round() as u32,
            height: (self.height as f64 * self.scale_factor).round() as u32,
        }
    }
}

/// Information about a capturable window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowInfo {
    pub id: u32,
    pub title: String,
    pub app_name: String,
    pub display_id: u32,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Geometry of a capture target, as needed to resolve a recording config
#[derive(Debug, Clone, PartialEq)]
pub struct SourceGeometry {
    /// Display the target lives on
    pub display: DisplayInfo,
    /// Window bounds (points), when the target is a window
    pub window: Option<WindowInfo>,
}

/// Errors from looking up capture targets
#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("Display not found: {0}")]
    DisplayNotFound(u32),

    #[error("Window not found: {0}")]
    WindowNotFound(u32),

    #[error("No displays available")]
    NoDisplays,
}

/// Source of display and window geometry
pub trait ContentProvider: Send + Sync {
    fn displays(&self) -> Vec<DisplayInfo>;

    fn windows(&self) -> Vec<WindowInfo>;

    /// Resolve a capture target to its geometry
    fn geometry(&self, target: &CaptureTarget) -> Result<SourceGeometry, ContentError> {
        let displays = self.displays();
        let find_display = |id: u32| {
            displays
                .iter()
                .find(|d| d.id == id)
                .cloned()
                .ok_or(ContentError::DisplayNotFound(id))
        };

        match target {
            CaptureTarget::Fullscreen { display_id: Some(id) } => Ok(SourceGeometry {
                display: find_display(*id)?,
                window: None,
            }),
            CaptureTarget::Fullscreen { display_id: None } => {
                let display = displays
                    .iter()
                    .find(|d| d.is_primary)
                    .or_else(|| displays.first())
                    .cloned()
                    .ok_or(ContentError::NoDisplays)?;
                Ok(SourceGeometry {
                    display,
                    window: None,
                })
            }
            CaptureTarget::Area { display_id, .. } => Ok(SourceGeometry {
                display: find_display(*display_id)?,
                window: None,
            }),
            CaptureTarget::Window { window_id } => {
                let window = self
                    .windows()
                    .into_iter()
                    .find(|w| w.id == *window_id)
                    .ok_or(ContentError::WindowNotFound(*window_id))?;
                Ok(SourceGeometry {
                    display: find_display(window.display_id)?,
                    window: Some(window),
                })
            }
        }
    }
}

/// Static catalog of displays/windows, typically built from settings
#[derive(Debug, Clone, Default)]
pub struct DisplayCatalog {
    displays: Vec<DisplayInfo>,
    windows: Vec<WindowInfo>,
}

impl DisplayCatalog {
    /// Catalog with the given displays; an empty list yields a default
    /// 1920x1080 primary display
    pub fn new(displays: Vec<DisplayInfo>) -> Self {
        let displays = if displays.is_empty() {
            vec![DisplayInfo {
                id: 0,
                name: "Primary Display".to_string(),
                width: 1920,
                height: 1080,
                scale_factor: 1.0,
                is_primary: true,
                x: 0,
                y: 0,
            }]
        } else {
            displays
        };

        Self {
            displays,
            windows: Vec::new(),
        }
    }

    pub fn with_windows(mut self, windows: Vec<WindowInfo>) -> Self {
        self.windows = windows;
        self
    }
}

impl ContentProvider for DisplayCatalog {
    fn displays(&self) -> Vec<DisplayInfo> {
        self.displays.clone()
    }

    fn windows(&self) -> Vec<WindowInfo> {
        self.windows.clone()
    }
}
