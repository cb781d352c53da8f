//! GIF export pipeline
//!
//! Converts a finalized recording into an animated GIF next to it. The GIF
//! is written to `<stem>.gif.partial` and promoted the same way recordings
//! are, so a visible `.gif` is always complete.

use crate::export::ffmpeg::{
    check_tool, encode_args, palette_args, probe_source, run_pass, ExportCancel, PassError,
};
use crate::export::types::{ExportError, ExportProgress, ExportQuality, SourceInfo};
use crate::storage::manager::remove_quietly;
use crate::storage::{is_partial, partial_path_for, promote};
use std::path::{Path, PathBuf};

/// Runs GIF exports with one transcoder and one probe tool
pub struct ExportPipeline {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    cancel: ExportCancel,
}

impl ExportPipeline {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            cancel: ExportCancel::new(),
        }
    }

    /// Same tools with a cancel handle of its own
    pub fn fork(&self) -> Self {
        Self::new(self.ffmpeg.clone(), self.ffprobe.clone())
    }

    /// Handle that cancels this pipeline's export
    pub fn cancel_handle(&self) -> ExportCancel {
        self.cancel.clone()
    }

    /// Export `input` to `<stem>.gif`, probing the source first
    pub async fn export<F>(
        &self,
        input: &Path,
        quality: ExportQuality,
        progress: F,
    ) -> Result<PathBuf, ExportError>
    where
        F: FnMut(ExportProgress) + Send,
    {
        self.run(input, quality, None, progress).await
    }

    /// Export with already-known source metadata; the probe is skipped
    pub async fn export_with_source<F>(
        &self,
        input: &Path,
        quality: ExportQuality,
        source: SourceInfo,
        progress: F,
    ) -> Result<PathBuf, ExportError>
    where
        F: FnMut(ExportProgress) + Send,
    {
        self.run(input, quality, Some(source), progress).await
    }

    async fn run<F>(
        &self,
        input: &Path,
        quality: ExportQuality,
        source: Option<SourceInfo>,
        mut progress: F,
    ) -> Result<PathBuf, ExportError>
    where
        F: FnMut(ExportProgress) + Send,
    {
        if is_partial(input) {
            return Err(ExportError::PartialSource(input.to_path_buf()));
        }

        progress(ExportProgress::preparing());
        check_tool(&self.ffmpeg).await?;

        let source = match source {
            Some(source) => source,
            None => probe_source(&self.ffprobe, input).await,
        };
        let preset = quality.preset(&source);
        let width = preset.output_width(source.width);

        let output = input.with_extension("gif");
        let partial = partial_path_for(&output);
        let dir = input
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        // removed when dropped, whichever way the export ends
        let palette = tempfile::Builder::new()
            .prefix(".palette-")
            .suffix(".png")
            .tempfile_in(dir)?;

        tracing::info!(
            "Exporting {:?} to GIF: {}fps, {}px wide ({:?})",
            input,
            preset.fps,
            width,
            quality
        );

        progress(ExportProgress::palette(0.0));
        run_pass(
            &self.ffmpeg,
            &palette_args(input, palette.path(), preset, width),
            source.duration,
            &self.cancel,
            |fraction| progress(ExportProgress::palette(fraction)),
        )
        .await
        .map_err(|e| match e {
            PassError::Cancelled => ExportError::Cancelled,
            PassError::Failed(message) => ExportError::PaletteGenerationFailed(message),
        })?;
        if std::fs::metadata(palette.path())?.len() == 0 {
            return Err(ExportError::PaletteGenerationFailed(
                "palette pass produced an empty palette".into(),
            ));
        }
        progress(ExportProgress::palette(1.0));

        let encoded = run_pass(
            &self.ffmpeg,
            &encode_args(input, palette.path(), &partial, preset, width),
            source.duration,
            &self.cancel,
            |fraction| progress(ExportProgress::encoding(fraction)),
        )
        .await;
        if let Err(e) = encoded {
            remove_quietly(&partial);
            return Err(match e {
                PassError::Cancelled => ExportError::Cancelled,
                PassError::Failed(message) => ExportError::EncodeFailed(message),
            });
        }
        let written = std::fs::metadata(&partial).map(|m| m.len()).unwrap_or(0);
        if written == 0 {
            remove_quietly(&partial);
            return Err(ExportError::EncodeFailed(
                "encode pass produced no output".into(),
            ));
        }

        progress(ExportProgress::finalizing());
        if let Err(e) = promote(&partial, &output) {
            remove_quietly(&partial);
            return Err(e.into());
        }

        progress(ExportProgress::complete());
        tracing::info!("GIF export complete: {:?}", output);
        Ok(output)
    }
}
