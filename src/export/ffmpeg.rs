//! FFmpeg invocations for the GIF export
//!
//! Two passes over the source: `palettegen` builds a 256-colour palette,
//! then `paletteuse` maps every frame onto it.

use crate::export::types::{ExportError, GifPreset, SourceInfo};
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Notify;

/// Cancels a running export
#[derive(Debug, Clone, Default)]
pub struct ExportCancel {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ExportCancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Why a single pass did not succeed
#[derive(Debug)]
pub enum PassError {
    Cancelled,
    Failed(String),
}

fn scale_chain(preset: GifPreset, width: u32) -> String {
    format!("fps={},scale={}:-1:flags=lanczos", preset.fps, width)
}

/// Filter for the palette pass
pub fn palette_filter(preset: GifPreset, width: u32) -> String {
    format!("{},palettegen=stats_mode=diff", scale_chain(preset, width))
}

/// Filter graph for the encode pass; input 1 is the palette
pub fn encode_filter(preset: GifPreset, width: u32) -> String {
    format!(
        "{}[x];[x][1:v]paletteuse=dither=bayer:bayer_scale=5:diff_mode=rectangle",
        scale_chain(preset, width)
    )
}

fn pass_prefix() -> Vec<String> {
    ["-hide_banner", "-loglevel", "error", "-nostats", "-y"]
        .into_iter()
        .map(String::from)
        .collect()
}

pub fn palette_args(input: &Path, palette: &Path, preset: GifPreset, width: u32) -> Vec<String> {
    let mut args = pass_prefix();
    args.extend([
        "-i".to_string(),
        input.to_string_lossy().to_string(),
        "-vf".to_string(),
        palette_filter(preset, width),
        "-frames:v".to_string(),
        "1".to_string(),
        "-update".to_string(),
        "1".to_string(),
        "-progress".to_string(),
        "pipe:1".to_string(),
        palette.to_string_lossy().to_string(),
    ]);
    args
}

/// The output carries a `.partial` suffix, so the muxer is named explicitly
pub fn encode_args(
    input: &Path,
    palette: &Path,
    output: &Path,
    preset: GifPreset,
    width: u32,
) -> Vec<String> {
    let mut args = pass_prefix();
    args.extend([
        "-i".to_string(),
        input.to_string_lossy().to_string(),
        "-i".to_string(),
        palette.to_string_lossy().to_string(),
        "-lavfi".to_string(),
        encode_filter(preset, width),
        "-loop".to_string(),
        "0".to_string(),
        "-f".to_string(),
        "gif".to_string(),
        "-progress".to_string(),
        "pipe:1".to_string(),
        output.to_string_lossy().to_string(),
    ]);
    args
}

/// Verify the transcoder can be executed
pub async fn check_tool(ffmpeg: &Path) -> Result<(), ExportError> {
    let output = Command::new(ffmpeg)
        .arg("-version")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| ExportError::ToolUnavailable(format!("{}: {}", ffmpeg.display(), e)))?;

    if !output.status.success() {
        return Err(ExportError::ToolUnavailable(format!(
            "{} -version exited with {}",
            ffmpeg.display(),
            output.status
        )));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Read source metadata; any failure leaves the fields unknown
pub async fn probe_source(ffprobe: &Path, input: &Path) -> SourceInfo {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,r_frame_rate:format=duration",
            "-of",
            "json",
        ])
        .arg(input)
        .stdin(Stdio::null())
        .output()
        .await;

    let output = match output {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            tracing::warn!(
                "ffprobe failed for {:?}: {}",
                input,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return SourceInfo::default();
        }
        Err(e) => {
            tracing::warn!("Failed to run ffprobe: {}", e);
            return SourceInfo::default();
        }
    };

    parse_probe(&String::from_utf8_lossy(&output.stdout))
}

pub fn parse_probe(json: &str) -> SourceInfo {
    let probe: ProbeOutput = match serde_json::from_str(json) {
        Ok(probe) => probe,
        Err(e) => {
            tracing::warn!("Unexpected ffprobe output: {}", e);
            return SourceInfo::default();
        }
    };

    let stream = probe.streams.into_iter().next();
    SourceInfo {
        width: stream.as_ref().and_then(|s| s.width),
        height: stream.as_ref().and_then(|s| s.height),
        fps: stream
            .as_ref()
            .and_then(|s| s.r_frame_rate.as_deref())
            .and_then(parse_frame_rate),
        duration: probe
            .format
            .and_then(|f| f.duration)
            .and_then(|d| d.parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d > 0.0)
            .map(Duration::from_secs_f64),
    }
}

/// Parse "30/1" or "30000/1001"
pub fn parse_frame_rate(value: &str) -> Option<f64> {
    let fps = match value.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => value.trim().parse().ok()?,
    };
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

/// Pass progress from one `-progress` line
fn progress_fraction(line: &str, duration: Option<Duration>) -> Option<f64> {
    if line.trim() == "progress=end" {
        return Some(1.0);
    }
    // ffmpeg reports both keys in microseconds
    let micros = line
        .strip_prefix("out_time_us=")
        .or_else(|| line.strip_prefix("out_time_ms="))?;
    let micros: f64 = micros.trim().parse().ok()?;
    let total = duration?.as_secs_f64();
    if total <= 0.0 {
        return None;
    }
    Some((micros / 1_000_000.0 / total).clamp(0.0, 1.0))
}

/// Run one ffmpeg pass, reporting its own 0.0..=1.0 progress
pub async fn run_pass<F>(
    ffmpeg: &Path,
    args: &[String],
    duration: Option<Duration>,
    cancel: &ExportCancel,
    mut on_progress: F,
) -> Result<(), PassError>
where
    F: FnMut(f64),
{
    if cancel.is_cancelled() {
        return Err(PassError::Cancelled);
    }

    tracing::debug!("Running {:?} {}", ffmpeg, args.join(" "));
    let mut child = Command::new(ffmpeg)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| PassError::Failed(format!("Failed to start ffmpeg: {}", e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| PassError::Failed("ffmpeg stdout unavailable".into()))?;
    let stderr = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut text = String::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_string(&mut text).await;
        }
        text
    });

    let mut lines = BufReader::new(stdout).lines();
    let mut last = 0.0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(PassError::Cancelled);
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(fraction) = progress_fraction(&line, duration) {
                        if fraction > last {
                            last = fraction;
                            on_progress(fraction);
                        }
                    }
                }
                _ => break,
            }
        }
    }

    enum Outcome {
        Exited(std::io::Result<std::process::ExitStatus>),
        Cancelled,
    }
    let outcome = tokio::select! {
        _ = cancel.cancelled() => Outcome::Cancelled,
        status = child.wait() => Outcome::Exited(status),
    };

    let status = match outcome {
        Outcome::Cancelled => {
            let _ = child.kill().await;
            return Err(PassError::Cancelled);
        }
        Outcome::Exited(status) => {
            status.map_err(|e| PassError::Failed(format!("Failed to wait for ffmpeg: {}", e)))?
        }
    };

    let stderr = stderr_task.await.unwrap_or_default();
    if !status.success() {
        return Err(PassError::Failed(format!(
            "ffmpeg exited with status {}: {}",
            status,
            stderr.trim()
        )));
    }
    Ok(())
}
