//! Derived-image export
//!
//! Two-pass palette GIF conversion of finalized recordings.

pub mod ffmpeg;
pub mod pipeline;
pub mod types;

pub use ffmpeg::ExportCancel;
pub use pipeline::ExportPipeline;
pub use types::{ExportError, ExportProgress, ExportQuality, ExportStage, GifPreset, SourceInfo};
