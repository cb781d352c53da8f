//! Lifecycle events broadcast to front-ends

use crate::recorder::state::SessionState;
use crate::storage::RecordingMetadata;
use crate::utils::error::FailureReason;
use serde::Serialize;
use std::path::PathBuf;
use uuid::Uuid;

/// Capacity of the lifecycle event channel
pub const LIFECYCLE_EVENT_CAPACITY: usize = 100;

/// Events emitted by the session coordinator
///
/// For one session they arrive as `Started`, `Stopped`, optionally
/// `Exporting`, then exactly one of `Completed`, `Failed` or `Cancelled`.
/// `StateChanged` accompanies every transition.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum LifecycleEvent {
    StateChanged {
        state: SessionState,
    },
    Started {
        session_id: Uuid,
    },
    /// Elapsed recording time, about once per second
    Duration {
        session_id: Uuid,
        elapsed_ms: u64,
    },
    Stopped {
        session_id: Uuid,
    },
    Exporting {
        session_id: Uuid,
    },
    ExportProgress {
        session_id: Uuid,
        fraction: f64,
    },
    Completed {
        session_id: Uuid,
        output: PathBuf,
        metadata: RecordingMetadata,
    },
    Failed {
        session_id: Uuid,
        reason: FailureReason,
    },
    Cancelled {
        session_id: Uuid,
    },
}

impl LifecycleEvent {
    /// Event name used on front-end channels
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::StateChanged { .. } => "recording:state-changed",
            LifecycleEvent::Started { .. } => "recording:started",
            LifecycleEvent::Duration { .. } => "recording:duration",
            LifecycleEvent::Stopped { .. } => "recording:stopped",
            LifecycleEvent::Exporting { .. } => "recording:exporting",
            LifecycleEvent::ExportProgress { .. } => "recording:export-progress",
            LifecycleEvent::Completed { .. } => "recording:completed",
            LifecycleEvent::Failed { .. } => "recording:failed",
            LifecycleEvent::Cancelled { .. } => "recording:cancelled",
        }
    }

    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            LifecycleEvent::StateChanged { .. } => None,
            LifecycleEvent::Started { session_id }
            | LifecycleEvent::Duration { session_id, .. }
            | LifecycleEvent::Stopped { session_id }
            | LifecycleEvent::Exporting { session_id }
            | LifecycleEvent::ExportProgress { session_id, .. }
            | LifecycleEvent::Completed { session_id, .. }
            | LifecycleEvent::Failed { session_id, .. }
            | LifecycleEvent::Cancelled { session_id } => Some(*session_id),
        }
    }

    /// Whether this event ends its session
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleEvent::Completed { .. }
                | LifecycleEvent::Failed { .. }
                | LifecycleEvent::Cancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::state::CaptureMode;

    #[test]
    fn test_wire_format() {
        let id = Uuid::new_v4();
        let json = serde_json::to_value(LifecycleEvent::ExportProgress {
            session_id: id,
            fraction: 0.5,
        })
        .unwrap();
        assert_eq!(json["type"], "exportProgress");
        assert_eq!(json["sessionId"], id.to_string());
        assert_eq!(json["fraction"], 0.5);

        let json = serde_json::to_value(LifecycleEvent::StateChanged {
            state: SessionState::Recording {
                mode: CaptureMode::DerivedImage,
            },
        })
        .unwrap();
        assert_eq!(json["state"]["state"], "recording");
        assert_eq!(json["state"]["mode"], "derivedImage");
    }

    #[test]
    fn test_names() {
        let id = Uuid::new_v4();
        assert_eq!(
            LifecycleEvent::Cancelled { session_id: id }.name(),
            "recording:cancelled"
        );
        assert_eq!(
            LifecycleEvent::StateChanged {
                state: SessionState::Idle
            }
            .name(),
            "recording:state-changed"
        );
        assert!(LifecycleEvent::Cancelled { session_id: id }.is_terminal());
        assert!(!LifecycleEvent::Stopped { session_id: id }.is_terminal());
    }
}
