//! Recording state management
//!
//! Defines the session state machine and the elapsed-time clock.
//!
//! The machine is a pure model: it validates transitions against a fixed
//! adjacency table and never touches engines, files or the export pipeline.

use crate::utils::error::FailureReason;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

/// What a session produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CaptureMode {
    /// A finalized MP4 video
    Video,
    /// An animated GIF derived from a finalized video
    DerivedImage,
}

impl CaptureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureMode::Video => "video",
            CaptureMode::DerivedImage => "derivedImage",
        }
    }
}

impl fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state of a recording session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SessionState {
    /// No session in progress
    Idle,
    /// The user is choosing what to capture
    Selecting { mode: CaptureMode },
    /// The capture engine is being brought up
    Starting { mode: CaptureMode },
    /// Frames are being captured
    Recording { mode: CaptureMode },
    /// The engine is flushing and the output is being finalized
    Stopping { mode: CaptureMode },
    /// The finalized video is being transcoded to a GIF
    #[serde(rename = "exportingExport")]
    Exporting,
    /// Output delivered
    Completed,
    /// The session ended with an error
    Failed { reason: FailureReason },
    /// The session was cancelled and its partial output discarded
    Cancelled,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::Idle
    }
}

impl SessionState {
    /// Mode of the session, if the state carries one
    pub fn mode(&self) -> Option<CaptureMode> {
        match self {
            SessionState::Selecting { mode }
            | SessionState::Starting { mode }
            | SessionState::Recording { mode }
            | SessionState::Stopping { mode } => Some(*mode),
            SessionState::Exporting => Some(CaptureMode::DerivedImage),
            _ => None,
        }
    }

    /// Terminal states only lead back to idle
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed { .. } | SessionState::Cancelled
        )
    }

    fn is_in_flight(&self) -> bool {
        matches!(
            self,
            SessionState::Selecting { .. }
                | SessionState::Starting { .. }
                | SessionState::Recording { .. }
                | SessionState::Stopping { .. }
                | SessionState::Exporting
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Selecting { mode } => write!(f, "selecting({mode})"),
            SessionState::Starting { mode } => write!(f, "starting({mode})"),
            SessionState::Recording { mode } => write!(f, "recording({mode})"),
            SessionState::Stopping { mode } => write!(f, "stopping({mode})"),
            SessionState::Exporting => write!(f, "exportingExport"),
            SessionState::Completed => write!(f, "completed"),
            SessionState::Failed { reason } => write!(f, "failed({})", reason.code),
            SessionState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Inputs accepted by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    BeginSelection(CaptureMode),
    BeginStarting(CaptureMode),
    BeginRecording(CaptureMode),
    BeginStopping(CaptureMode),
    BeginExport,
    MarkCompleted,
    MarkFailed(FailureReason),
    MarkCancelled,
    MarkIdle,
}

impl SessionEvent {
    /// The state this event leads to when the edge exists
    fn target(&self) -> SessionState {
        match self {
            SessionEvent::BeginSelection(mode) => SessionState::Selecting { mode: *mode },
            SessionEvent::BeginStarting(mode) => SessionState::Starting { mode: *mode },
            SessionEvent::BeginRecording(mode) => SessionState::Recording { mode: *mode },
            SessionEvent::BeginStopping(mode) => SessionState::Stopping { mode: *mode },
            SessionEvent::BeginExport => SessionState::Exporting,
            SessionEvent::MarkCompleted => SessionState::Completed,
            SessionEvent::MarkFailed(reason) => SessionState::Failed {
                reason: reason.clone(),
            },
            SessionEvent::MarkCancelled => SessionState::Cancelled,
            SessionEvent::MarkIdle => SessionState::Idle,
        }
    }
}

/// Rejected edge in the adjacency table
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition from {from} to {to}")]
pub struct IllegalTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// Whether `event` is an edge out of `from`
fn is_legal(from: &SessionState, event: &SessionEvent) -> bool {
    use SessionEvent as E;
    use SessionState as S;

    match (from, event) {
        (S::Idle, E::BeginSelection(_)) => true,
        (S::Selecting { mode }, E::BeginStarting(next)) => mode == next,
        (S::Starting { mode }, E::BeginRecording(next)) => mode == next,
        (S::Recording { mode }, E::BeginStopping(next)) => mode == next,
        (S::Stopping { mode: CaptureMode::DerivedImage }, E::BeginExport) => true,
        (S::Stopping { mode: CaptureMode::Video }, E::MarkCompleted) => true,
        (S::Exporting, E::MarkCompleted) => true,
        (state, E::MarkFailed(_)) | (state, E::MarkCancelled) => state.is_in_flight(),
        (state, E::MarkIdle) => state.is_terminal(),
        _ => false,
    }
}

/// Session state machine with a monotonic elapsed-time clock
#[derive(Debug, Default)]
pub struct SessionStateMachine {
    state: SessionState,
    recording_started: Option<Instant>,
    frozen_elapsed: Option<Duration>,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == SessionState::Idle
    }

    /// Whether a session is between selection and its terminal state
    pub fn is_active(&self) -> bool {
        self.state.is_in_flight()
    }

    pub fn mode(&self) -> Option<CaptureMode> {
        self.state.mode()
    }

    /// Apply an event, returning the new state
    ///
    /// On an illegal edge the state is left unchanged and the error names
    /// both ends of the rejected edge.
    pub fn transition(&mut self, event: SessionEvent) -> Result<SessionState, IllegalTransition> {
        let to = event.target();
        if !is_legal(&self.state, &event) {
            return Err(IllegalTransition {
                from: self.state.clone(),
                to,
            });
        }

        match &event {
            SessionEvent::BeginRecording(_) => {
                self.recording_started = Some(Instant::now());
                self.frozen_elapsed = None;
            }
            SessionEvent::BeginStopping(_)
            | SessionEvent::MarkFailed(_)
            | SessionEvent::MarkCancelled => {
                if self.frozen_elapsed.is_none() {
                    self.frozen_elapsed = self.recording_started.map(|t| t.elapsed());
                }
            }
            SessionEvent::MarkIdle => {
                self.recording_started = None;
                self.frozen_elapsed = None;
            }
            _ => {}
        }

        tracing::debug!("Session state: {} -> {}", self.state, to);
        self.state = to.clone();
        Ok(to)
    }

    /// Time spent recording in the current session
    ///
    /// Zero until recording begins, live while recording, frozen once the
    /// session starts stopping, zero again after returning to idle.
    pub fn elapsed(&self) -> Duration {
        if let Some(frozen) = self.frozen_elapsed {
            return frozen;
        }
        self.recording_started
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO)
    }
}
