//! Capture engine trait definitions
//!
//! Platform-agnostic contract shared by the primary and fallback engines.

use crate::capture::config::RecordingConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// Capacity of an engine's event channel
pub const ENGINE_EVENT_CAPACITY: usize = 64;

/// Errors that can occur in a capture engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("No capture source available: {0}")]
    NoCaptureSource(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not recording")]
    NotRecording,

    #[error("Already recording")]
    AlreadyRecording,

    #[error("Capture process failed: {0}")]
    Process(String),

    #[error("Failed to write output: {0}")]
    WriteFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which engine implementation produced a recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Single transcoder process muxing video and audio
    Primary,
    /// Frame pipeline, video only
    Fallback,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Primary => "primary",
            EngineKind::Fallback => "fallback",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audio channels present in a recording
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFlags {
    pub microphone: bool,
    pub system_audio: bool,
    pub excludes_current_process_audio: bool,
}

/// Asynchronous notifications from a running engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Started,
    /// A frame was dropped under back-pressure; carries the running total
    SampleDropped { total: u64 },
    Stopped,
    /// The engine failed on its own, outside of stop/cancel
    Errored(String),
}

/// Result of a clean stop
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedHandle {
    /// The partial file the engine wrote
    pub path: PathBuf,
    pub engine: EngineKind,
    pub duration: Duration,
    pub dropped_frames: u64,
    pub audio: AudioFlags,
}

/// A capture engine writes one recording to a partial file
///
/// `stop` is idempotent and returns the same handle on every call. `cancel`
/// is idempotent; after a cancel, `stop` fails with `NotRecording`.
#[async_trait]
pub trait CaptureEngine: Send {
    fn kind(&self) -> EngineKind;

    /// Begin writing to `output`
    async fn start(&mut self, config: &RecordingConfig, output: &Path) -> Result<(), EngineError>;

    /// Flush and close the output
    async fn stop(&mut self) -> Result<FinalizedHandle, EngineError>;

    /// Abort without finalizing
    async fn cancel(&mut self);

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;

    /// Frames dropped so far
    fn dropped_frames(&self) -> u64;
}

/// Builds the engine for a session
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(&self, config: &RecordingConfig) -> Result<Box<dyn CaptureEngine>, EngineError>;
}
