//! Recording metadata sidecar

use crate::capture::{AudioFlags, EngineKind, FinalizedHandle, RecordingConfig};
use crate::recorder::state::CaptureMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Written as `<recording>.json` next to every finalized file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingMetadata {
    pub session_id: Uuid,
    pub mode: CaptureMode,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub duration_seconds: f64,
    pub dropped_frame_estimate: u64,
    pub audio_flags: AudioFlags,
    /// Engine that produced the footage
    pub encode_path: EngineKind,
    /// Promoted from a session that failed mid-recording
    pub salvaged: bool,
    pub created_at: DateTime<Utc>,
}

impl RecordingMetadata {
    pub fn new(
        session_id: Uuid,
        config: &RecordingConfig,
        handle: &FinalizedHandle,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            mode: config.mode,
            fps: config.fps,
            width: config.output.width,
            height: config.output.height,
            duration_seconds: handle.duration.as_secs_f64(),
            dropped_frame_estimate: handle.dropped_frames,
            audio_flags: handle.audio,
            encode_path: handle.engine,
            salvaged: false,
            created_at,
        }
    }

    pub fn salvaged(mut self) -> Self {
        self.salvaged = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sidecar_field_names() {
        let metadata = RecordingMetadata {
            session_id: Uuid::nil(),
            mode: CaptureMode::Video,
            fps: 60,
            width: 1920,
            height: 1080,
            duration_seconds: 2.5,
            dropped_frame_estimate: 4,
            audio_flags: AudioFlags {
                microphone: true,
                system_audio: false,
                excludes_current_process_audio: false,
            },
            encode_path: EngineKind::Fallback,
            salvaged: true,
            created_at: Utc::now(),
        };

        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json["mode"], "video");
        assert_eq!(json["droppedFrameEstimate"], 4);
        assert_eq!(json["audioFlags"]["microphone"], true);
        assert_eq!(json["encodePath"], "fallback");
        assert_eq!(json["salvaged"], true);
        assert!(json.get("createdAt").is_some());
    }
}
