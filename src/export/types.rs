//! Export types and configuration
//!
//! GIF quality presets, source metadata, progress reporting and errors for
//! the derived-image export.

use crate::storage::FileError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Frame rate cap for `Original` exports
pub const ORIGINAL_MAX_FPS: u32 = 50;

/// Frame rate for `Original` exports when the source rate is unknown
pub const ORIGINAL_FALLBACK_FPS: u32 = 30;

/// Width cap for `Original` exports
pub const ORIGINAL_MAX_WIDTH: u32 = 1920;

/// Share of the overall progress taken by the palette pass
pub const PALETTE_PASS_SHARE: f64 = 0.3;

/// GIF export quality levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportQuality {
    /// 10 fps, 640 px wide
    Low,
    /// 15 fps, 960 px wide
    Medium,
    /// 20 fps, 1280 px wide
    High,
    /// Source fps (capped at 50) and width (capped at 1920)
    Original,
}

impl ExportQuality {
    /// Resolve the frame rate and width cap for a source
    pub fn preset(&self, source: &SourceInfo) -> GifPreset {
        match self {
            ExportQuality::Low => GifPreset {
                fps: 10,
                max_width: 640,
            },
            ExportQuality::Medium => GifPreset {
                fps: 15,
                max_width: 960,
            },
            ExportQuality::High => GifPreset {
                fps: 20,
                max_width: 1280,
            },
            ExportQuality::Original => GifPreset {
                fps: source
                    .fps
                    .map(|fps| fps.round() as u32)
                    .filter(|fps| *fps > 0)
                    .map(|fps| fps.min(ORIGINAL_MAX_FPS))
                    .unwrap_or(ORIGINAL_FALLBACK_FPS),
                max_width: ORIGINAL_MAX_WIDTH,
            },
        }
    }
}

/// Frame rate and width cap of a GIF export
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GifPreset {
    pub fps: u32,
    pub max_width: u32,
}

impl GifPreset {
    /// Output width; never wider than the source
    pub fn output_width(&self, source_width: Option<u32>) -> u32 {
        source_width
            .filter(|w| *w > 0)
            .map(|w| w.min(self.max_width))
            .unwrap_or(self.max_width)
    }
}

/// What is known about the export source; every field may be unknown
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceInfo {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub duration: Option<Duration>,
}

/// Export progress stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExportStage {
    /// Checking the tool and probing the source
    Preparing,
    /// First pass, building the palette
    GeneratingPalette,
    /// Second pass, writing frames
    Encoding,
    /// Promoting the output to its final name
    Finalizing,
    Complete,
}

/// Export progress information
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportProgress {
    /// Overall progress, 0.0 to 1.0
    pub fraction: f64,
    pub stage: ExportStage,
}

impl ExportProgress {
    pub fn preparing() -> Self {
        Self {
            fraction: 0.0,
            stage: ExportStage::Preparing,
        }
    }

    /// `pass` is the palette pass's own 0.0..=1.0 progress
    pub fn palette(pass: f64) -> Self {
        Self {
            fraction: pass.clamp(0.0, 1.0) * PALETTE_PASS_SHARE,
            stage: ExportStage::GeneratingPalette,
        }
    }

    /// `pass` is the encode pass's own 0.0..=1.0 progress
    pub fn encoding(pass: f64) -> Self {
        Self {
            fraction: PALETTE_PASS_SHARE + pass.clamp(0.0, 1.0) * (1.0 - PALETTE_PASS_SHARE),
            stage: ExportStage::Encoding,
        }
    }

    pub fn finalizing() -> Self {
        Self {
            fraction: 1.0,
            stage: ExportStage::Finalizing,
        }
    }

    pub fn complete() -> Self {
        Self {
            fraction: 1.0,
            stage: ExportStage::Complete,
        }
    }
}

/// Export errors
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Export tool unavailable: {0}")]
    ToolUnavailable(String),

    #[error("Palette generation failed: {0}")]
    PaletteGenerationFailed(String),

    #[error("Encoding failed: {0}")]
    EncodeFailed(String),

    #[error("Export cancelled")]
    Cancelled,

    #[error("Refusing to export an incomplete recording: {0}")]
    PartialSource(PathBuf),

    #[error("Failed to finalize export: {0}")]
    Finalize(#[from] FileError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
