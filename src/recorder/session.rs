//! Recording sessions

use crate::capture::{CaptureEngine, EngineKind, RecordingConfig};
use crate::recorder::state::{CaptureMode, SessionState};
use crate::storage::TempPath;
use crate::utils::error::FailureReason;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Returned by a successful `start`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHandle {
    pub session_id: Uuid,
    pub mode: CaptureMode,
    /// Where the engine is writing
    pub partial_path: PathBuf,
    pub engine: EngineKind,
}

/// Point-in-time view of the coordinator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: Option<Uuid>,
    pub state: SessionState,
    pub elapsed_ms: u64,
    pub dropped_frames: u64,
    /// Overall export progress while exporting
    pub export_progress: Option<f64>,
    /// Reason of the most recent failure, kept after returning to idle
    pub last_failure: Option<FailureReason>,
}

/// The active session, owned by the coordinator
pub(crate) struct Session {
    pub id: Uuid,
    pub mode: CaptureMode,
    pub config: RecordingConfig,
    pub temp: TempPath,
    pub engine: Box<dyn CaptureEngine>,
    pub created_at: DateTime<Utc>,
    /// Watches engine events while recording
    pub monitor: Option<JoinHandle<()>>,
}

impl Session {
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            session_id: self.id,
            mode: self.mode,
            partial_path: self.temp.partial.clone(),
            engine: self.engine.kind(),
        }
    }

    pub fn stop_monitor(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}
