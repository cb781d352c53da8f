//! User settings
//!
//! Settings are owned by an external preferences collaborator; the core only
//! reads them. They are loaded from an optional TOML file and
//! `OPEN_SCREENCAP__*` environment overrides.

use crate::capture::config::{QualityPreset, DEFAULT_FPS};
use crate::capture::content::DisplayInfo;
use crate::export::ExportQuality;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which capture engine to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnginePreference {
    /// Probe the platform and prefer the primary engine
    Auto,
    Primary,
    Fallback,
}

impl Default for EnginePreference {
    fn default() -> Self {
        Self::Auto
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSettings {
    pub quality: QualityPreset,
    pub fps: u32,
    pub include_cursor: bool,
    pub show_mouse_clicks: bool,
    pub include_microphone: bool,
    pub include_system_audio: bool,
    pub excludes_current_process_audio: bool,
    pub export_quality: ExportQuality,

    /// Where finalized recordings land
    pub output_dir: PathBuf,
    /// Transcoder used by the engines and the GIF export
    pub ffmpeg_path: PathBuf,
    /// Probe tool used to read source metadata for exports
    pub ffprobe_path: PathBuf,
    pub engine: EnginePreference,
    /// Keep the intermediate MP4 after a successful GIF export
    pub keep_intermediate_video: bool,

    /// Platform-specific input device names (e.g. a PulseAudio source)
    pub microphone_device: Option<String>,
    pub system_audio_device: Option<String>,

    /// Known displays; an empty list means a single 1920x1080 primary display
    pub displays: Vec<DisplayInfo>,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            quality: QualityPreset::High,
            fps: DEFAULT_FPS,
            include_cursor: true,
            show_mouse_clicks: true,
            include_microphone: false,
            include_system_audio: true,
            excludes_current_process_audio: true,
            export_quality: ExportQuality::Medium,
            output_dir: default_output_dir(),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            engine: EnginePreference::Auto,
            keep_intermediate_video: false,
            microphone_device: None,
            system_audio_device: None,
            displays: Vec::new(),
        }
    }
}

impl UserSettings {
    /// Load settings from an optional file plus environment overrides
    ///
    /// A missing file is not an error; every field has a default.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("OPEN_SCREENCAP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: UserSettings = settings.try_deserialize()?;
        tracing::debug!("Loaded settings: {:?}", settings);
        Ok(settings)
    }
}

/// `~/Movies/Open ScreenCap` style default, falling back to the working dir
fn default_output_dir() -> PathBuf {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from);

    match home {
        Some(home) if cfg!(target_os = "macos") => home.join("Movies").join("Open ScreenCap"),
        Some(home) => home.join("Videos").join("Open ScreenCap"),
        None => PathBuf::from("recordings"),
    }
}
