//! Screen capture
//!
//! Recording configuration, capture targets and the two ffmpeg-backed
//! engines that write a session to its partial file.

pub mod config;
pub mod content;
pub mod fallback;
pub mod frames;
pub mod platform;
pub mod primary;
pub mod traits;

pub use config::{
    CaptureRect, CaptureTarget, ConfigError, QualityPreset, RecordingConfig, Size, ALLOWED_FPS,
    DEFAULT_FPS,
};
pub use content::{ContentProvider, DisplayCatalog, DisplayInfo, SourceGeometry, WindowInfo};
pub use fallback::{FallbackEngine, FRAME_QUEUE_CAPACITY};
pub use platform::{Capabilities, CaptureBackend, FfmpegEngineFactory};
pub use primary::PrimaryEngine;
pub use traits::{
    AudioFlags, CaptureEngine, EngineError, EngineEvent, EngineFactory, EngineKind,
    FinalizedHandle,
};
