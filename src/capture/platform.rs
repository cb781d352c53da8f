//! Platform capture backends
//!
//! Maps a `RecordingConfig` onto ffmpeg's screen-grab input devices and probes
//! which devices and encoders the installed ffmpeg provides.

use crate::capture::config::RecordingConfig;
use crate::capture::fallback::FallbackEngine;
use crate::capture::frames::{DeviceGrabber, EncoderSink};
use crate::capture::primary::PrimaryEngine;
use crate::capture::traits::{AudioFlags, CaptureEngine, EngineError, EngineFactory, EngineKind};
use crate::settings::EnginePreference;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio::sync::OnceCell;

/// Input queue depth for live devices, so slow muxing does not stall the grab
pub const THREAD_QUEUE_SIZE: u32 = 512;

/// The H.264 encoder the primary engine requires
pub const H264_ENCODER: &str = "libx264";

/// Encoder built into every ffmpeg, used by the fallback when libx264 is missing
pub const BUILTIN_ENCODER: &str = "mpeg4";

/// Screen-grab input device for the current platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureBackend {
    /// X11 display server, e.g. `:0.0`
    X11Grab { server: String },
    AvFoundation,
    GdiGrab,
}

impl CaptureBackend {
    /// Backend for the running platform, if it has one
    pub fn current() -> Option<Self> {
        #[cfg(target_os = "macos")]
        {
            Some(CaptureBackend::AvFoundation)
        }

        #[cfg(target_os = "windows")]
        {
            Some(CaptureBackend::GdiGrab)
        }

        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        {
            std::env::var("DISPLAY")
                .ok()
                .filter(|server| !server.is_empty())
                .map(|server| CaptureBackend::X11Grab { server })
        }
    }

    /// ffmpeg device name
    pub fn device_name(&self) -> &'static str {
        match self {
            CaptureBackend::X11Grab { .. } => "x11grab",
            CaptureBackend::AvFoundation => "avfoundation",
            CaptureBackend::GdiGrab => "gdigrab",
        }
    }

    /// Input options for the screen, in pixels
    pub fn video_input_args(&self, config: &RecordingConfig) -> Vec<String> {
        let fps = config.fps.to_string();
        let cursor = flag(config.include_cursor);
        let display = &config.display;
        let origin_x = (display.x as f64 * display.scale_factor).round() as i64;
        let origin_y = (display.y as f64 * display.scale_factor).round() as i64;
        let (offset_x, offset_y) = config
            .region
            .map(|r| (origin_x + r.x as i64, origin_y + r.y as i64))
            .unwrap_or((origin_x, origin_y));
        let video_size = format!("{}x{}", config.source.width, config.source.height);

        match self {
            CaptureBackend::X11Grab { server } => vec![
                "-f".into(),
                "x11grab".into(),
                "-draw_mouse".into(),
                cursor.into(),
                "-framerate".into(),
                fps,
                "-video_size".into(),
                video_size,
                "-i".into(),
                format!("{server}+{offset_x},{offset_y}"),
            ],
            CaptureBackend::AvFoundation => vec![
                "-f".into(),
                "avfoundation".into(),
                "-capture_cursor".into(),
                cursor.into(),
                "-capture_mouse_clicks".into(),
                flag(config.show_mouse_clicks).into(),
                "-framerate".into(),
                fps,
                "-i".into(),
                format!("Capture screen {}:none", display.id),
            ],
            CaptureBackend::GdiGrab => vec![
                "-f".into(),
                "gdigrab".into(),
                "-draw_mouse".into(),
                cursor.into(),
                "-framerate".into(),
                fps,
                "-offset_x".into(),
                offset_x.to_string(),
                "-offset_y".into(),
                offset_y.to_string(),
                "-video_size".into(),
                video_size,
                "-i".into(),
                "desktop".into(),
            ],
        }
    }

    /// Crop/scale chain applied to the grabbed video, if any
    pub fn video_filter(&self, config: &RecordingConfig) -> Option<String> {
        let mut chain = Vec::new();

        // avfoundation always grabs the whole screen
        if let (CaptureBackend::AvFoundation, Some(region)) = (self, config.region) {
            chain.push(format!(
                "crop={}:{}:{}:{}",
                region.width, region.height, region.x, region.y
            ));
        }

        if config.output != config.source {
            chain.push(format!(
                "scale={}:{}:flags=lanczos",
                config.output.width, config.output.height
            ));
        }

        if chain.is_empty() {
            None
        } else {
            Some(chain.join(","))
        }
    }

    /// Audio inputs for the requested channels
    ///
    /// Channels the platform cannot provide without an explicit device are
    /// skipped with a warning and left out of the returned flags.
    pub fn audio_inputs(&self, config: &RecordingConfig) -> AudioInputs {
        let mut inputs = AudioInputs::default();
        let devices = &config.audio_devices;

        if config.include_microphone {
            let input = match self {
                CaptureBackend::X11Grab { .. } => Some((
                    "pulse",
                    devices.microphone.clone().unwrap_or_else(|| "default".into()),
                )),
                CaptureBackend::AvFoundation => Some((
                    "avfoundation",
                    format!(":{}", devices.microphone.as_deref().unwrap_or("default")),
                )),
                CaptureBackend::GdiGrab => devices
                    .microphone
                    .as_ref()
                    .map(|name| ("dshow", format!("audio={name}"))),
            };
            match input {
                Some((format, device)) => {
                    inputs.push(format, device);
                    inputs.flags.microphone = true;
                }
                None => tracing::warn!("No microphone device configured, recording without it"),
            }
        }

        if config.include_system_audio {
            let input = match self {
                CaptureBackend::X11Grab { .. } => Some((
                    "pulse",
                    devices
                        .system_audio
                        .clone()
                        .unwrap_or_else(|| "@DEFAULT_MONITOR@".into()),
                )),
                CaptureBackend::AvFoundation => devices
                    .system_audio
                    .as_ref()
                    .map(|name| ("avfoundation", format!(":{name}"))),
                CaptureBackend::GdiGrab => devices
                    .system_audio
                    .as_ref()
                    .map(|name| ("dshow", format!("audio={name}"))),
            };
            match input {
                Some((format, device)) => {
                    inputs.push(format, device);
                    inputs.flags.system_audio = true;
                    // the recorder itself never plays audio
                    inputs.flags.excludes_current_process_audio =
                        config.excludes_current_process_audio;
                }
                None => tracing::warn!(
                    "No loopback device configured for system audio, recording without it"
                ),
            }
        }

        inputs
    }

    /// Full argument list for the primary engine's single process
    pub fn primary_args(&self, config: &RecordingConfig, output: &Path) -> PrimaryCommand {
        let mut args = base_args();
        args.extend(["-thread_queue_size".into(), THREAD_QUEUE_SIZE.to_string()]);
        args.extend(self.video_input_args(config));

        let audio = self.audio_inputs(config);
        args.extend(audio.args.iter().cloned());

        let mut graph = Vec::new();
        let video_map = match self.video_filter(config) {
            Some(filter) => {
                graph.push(format!("[0:v]{filter}[vout]"));
                "[vout]".to_string()
            }
            None => "0:v".to_string(),
        };
        let audio_map = match audio.count {
            0 => None,
            1 => Some("1:a".to_string()),
            n => {
                let labels: String = (1..=n).map(|i| format!("[{i}:a]")).collect();
                graph.push(format!("{labels}amix=inputs={n}:duration=longest[aout]"));
                Some("[aout]".to_string())
            }
        };

        if !graph.is_empty() {
            args.extend(["-filter_complex".into(), graph.join(";")]);
        }
        args.extend(["-map".into(), video_map]);
        if let Some(audio_map) = audio_map {
            args.extend(["-map".into(), audio_map]);
        }

        let bitrate = config.bitrate;
        args.extend([
            "-c:v".into(),
            H264_ENCODER.into(),
            "-preset".into(),
            "veryfast".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-b:v".into(),
            bitrate.to_string(),
            "-maxrate".into(),
            bitrate.to_string(),
            "-bufsize".into(),
            (bitrate * 2).to_string(),
            "-g".into(),
            (config.fps * 2).to_string(),
            "-r".into(),
            config.fps.to_string(),
        ]);
        if audio.count > 0 {
            args.extend(["-c:a".into(), "aac".into(), "-b:a".into(), "192k".into()]);
        }
        args.extend(fragmented_mp4_args());
        args.extend(["-progress".into(), "pipe:1".into()]);
        args.push(output.to_string_lossy().to_string());

        PrimaryCommand {
            args,
            audio: audio.flags,
        }
    }

    /// Arguments that grab raw BGRA frames to stdout
    pub fn grab_args(&self, config: &RecordingConfig) -> Vec<String> {
        let mut args = base_args();
        args.extend(self.video_input_args(config));
        if let Some(filter) = self.video_filter(config) {
            args.extend(["-vf".into(), filter]);
        }
        args.extend([
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "bgra".into(),
            "pipe:1".into(),
        ]);
        args
    }
}

/// Audio input arguments plus the channels they provide
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioInputs {
    pub args: Vec<String>,
    pub count: usize,
    pub flags: AudioFlags,
}

impl AudioInputs {
    fn push(&mut self, format: &str, device: String) {
        self.args.extend([
            "-thread_queue_size".into(),
            THREAD_QUEUE_SIZE.to_string(),
            "-f".into(),
            format.into(),
            "-i".into(),
            device,
        ]);
        self.count += 1;
    }
}

/// A prepared primary-engine invocation
#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryCommand {
    pub args: Vec<String>,
    pub audio: AudioFlags,
}

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

pub(crate) fn base_args() -> Vec<String> {
    ["-hide_banner", "-loglevel", "error", "-nostats", "-y"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Fragmented MP4 stays playable up to the last fragment if the process dies;
/// the format is explicit because `.partial` hides the extension
pub(crate) fn fragmented_mp4_args() -> Vec<String> {
    ["-movflags", "+frag_keyframe+empty_moov+default_base_moof", "-f", "mp4"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Map an early-exit stderr tail to an engine error
pub fn classify_failure(stderr: &str) -> EngineError {
    let lower = stderr.to_lowercase();
    let detail = stderr.trim().to_string();

    if lower.contains("permission denied")
        || lower.contains("not authorized")
        || lower.contains("not permitted")
    {
        EngineError::PermissionDenied(detail)
    } else if lower.contains("cannot open display")
        || lower.contains("can't open display")
        || lower.contains("no such device")
        || lower.contains("no such file or directory")
        || lower.contains("could not find")
        || lower.contains("input/output error")
    {
        EngineError::NoCaptureSource(detail)
    } else {
        EngineError::Process(detail)
    }
}

/// What the installed ffmpeg can do
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub tool_available: bool,
    pub devices: BTreeSet<String>,
    pub encoders: BTreeSet<String>,
}

impl Capabilities {
    /// Probe `ffmpeg -devices` and `ffmpeg -encoders`
    pub async fn probe(ffmpeg: &Path) -> Self {
        let devices = match Command::new(ffmpeg)
            .args(["-hide_banner", "-devices"])
            .output()
            .await
        {
            Ok(output) => Self::parse_devices(&String::from_utf8_lossy(&output.stdout)),
            Err(e) => {
                tracing::warn!("ffmpeg not available at {:?}: {}", ffmpeg, e);
                return Self::default();
            }
        };

        let encoders = match Command::new(ffmpeg)
            .args(["-hide_banner", "-encoders"])
            .output()
            .await
        {
            Ok(output) => Self::parse_encoders(&String::from_utf8_lossy(&output.stdout)),
            Err(_) => BTreeSet::new(),
        };

        tracing::debug!(
            "ffmpeg capabilities: {} devices, {} encoders",
            devices.len(),
            encoders.len()
        );

        Self {
            tool_available: true,
            devices,
            encoders,
        }
    }

    /// Demuxing devices from `-devices` output
    pub fn parse_devices(output: &str) -> BTreeSet<String> {
        parse_listing(output, |flags| flags.starts_with('D'))
    }

    /// Video encoders from `-encoders` output
    pub fn parse_encoders(output: &str) -> BTreeSet<String> {
        parse_listing(output, |flags| flags.starts_with('V'))
    }

    pub fn has_device(&self, name: &str) -> bool {
        self.devices.contains(name)
    }

    pub fn has_encoder(&self, name: &str) -> bool {
        self.encoders.contains(name)
    }

    /// Pick an engine for `backend`
    ///
    /// The primary engine needs the grab device plus libx264; the fallback
    /// only needs the device.
    pub fn select_engine(
        &self,
        backend: Option<&CaptureBackend>,
        preference: EnginePreference,
    ) -> Result<EngineKind, EngineError> {
        if !self.tool_available {
            return Err(EngineError::NoCaptureSource("ffmpeg is not installed".into()));
        }
        let backend = backend.ok_or_else(|| {
            EngineError::NoCaptureSource("no screen capture backend for this platform".into())
        })?;
        if !self.has_device(backend.device_name()) {
            return Err(EngineError::NoCaptureSource(format!(
                "ffmpeg was built without the {} device",
                backend.device_name()
            )));
        }

        let has_h264 = self.has_encoder(H264_ENCODER);
        match preference {
            EnginePreference::Fallback => Ok(EngineKind::Fallback),
            EnginePreference::Primary if has_h264 => Ok(EngineKind::Primary),
            EnginePreference::Primary => Err(EngineError::NoCaptureSource(format!(
                "primary engine requires the {H264_ENCODER} encoder"
            ))),
            EnginePreference::Auto if has_h264 => Ok(EngineKind::Primary),
            EnginePreference::Auto => Ok(EngineKind::Fallback),
        }
    }
}

fn parse_listing(output: &str, keep: impl Fn(&str) -> bool) -> BTreeSet<String> {
    output
        .lines()
        .skip_while(|line| {
            let line = line.trim();
            line.is_empty() || !line.chars().all(|c| c == '-')
        })
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let flags = parts.next()?;
            let name = parts.next()?;
            keep(flags).then(|| name.to_string())
        })
        .collect()
}

/// Builds ffmpeg-backed engines, probing capabilities once
pub struct FfmpegEngineFactory {
    ffmpeg: PathBuf,
    preference: EnginePreference,
    backend: Option<CaptureBackend>,
    capabilities: OnceCell<Capabilities>,
}

impl FfmpegEngineFactory {
    pub fn new(ffmpeg: impl Into<PathBuf>, preference: EnginePreference) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            preference,
            backend: CaptureBackend::current(),
            capabilities: OnceCell::new(),
        }
    }

    pub fn backend(&self) -> Option<&CaptureBackend> {
        self.backend.as_ref()
    }

    pub async fn capabilities(&self) -> &Capabilities {
        self.capabilities
            .get_or_init(|| Capabilities::probe(&self.ffmpeg))
            .await
    }
}

#[async_trait]
impl EngineFactory for FfmpegEngineFactory {
    async fn create(&self, config: &RecordingConfig) -> Result<Box<dyn CaptureEngine>, EngineError> {
        let capabilities = self.capabilities().await;
        let kind = capabilities.select_engine(self.backend.as_ref(), self.preference)?;
        let backend = self
            .backend
            .clone()
            .ok_or_else(|| EngineError::NoCaptureSource("no screen capture backend".into()))?;

        tracing::info!(
            "Using {} engine ({}) for {} capture",
            kind,
            backend.device_name(),
            config.mode
        );

        let engine: Box<dyn CaptureEngine> = match kind {
            EngineKind::Primary => Box::new(PrimaryEngine::new(self.ffmpeg.clone(), backend)),
            EngineKind::Fallback => {
                let encoder = if capabilities.has_encoder(H264_ENCODER) {
                    H264_ENCODER
                } else {
                    BUILTIN_ENCODER
                };
                Box::new(FallbackEngine::new(
                    Box::new(DeviceGrabber::new(self.ffmpeg.clone(), backend)),
                    Box::new(EncoderSink::new(self.ffmpeg.clone(), encoder)),
                ))
            }
        };
        Ok(engine)
    }
}
