//! Open ScreenCap - screen recording sessions with atomic output.
//!
//! The library drives one recording session at a time: it resolves what to
//! capture, runs an ffmpeg-backed capture engine, promotes the output to its
//! final name only once it is complete, and optionally derives an animated
//! GIF from the finished video.

pub mod capture;
pub mod export;
pub mod recorder;
pub mod settings;
pub mod storage;
pub mod utils;

pub use capture::{CaptureTarget, RecordingConfig};
pub use export::{ExportPipeline, ExportQuality};
pub use recorder::{CaptureMode, LifecycleEvent, SessionCoordinator, SessionState};
pub use settings::UserSettings;
pub use utils::error::{SessionError, SessionResult};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber
///
/// `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "open_screencap=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
