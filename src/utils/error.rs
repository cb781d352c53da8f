//! Error types and handling
//!
//! Session-level error taxonomy plus the structured failure reasons carried
//! by the `failed` state and lifecycle events.

use crate::capture::EngineError;
use crate::export::ExportError;
use crate::recorder::state::IllegalTransition;
use crate::storage::FileError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors returned by the public session API
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("File error: {0}")]
    Io(#[from] FileError),

    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    #[error("No active recording session")]
    NoActiveSession,
}

impl SessionError {
    /// Structured failure code for this error
    pub fn failure_code(&self) -> FailureCode {
        match self {
            SessionError::IllegalTransition(_) | SessionError::NoActiveSession => {
                FailureCode::ConfigurationError
            }
            SessionError::Configuration(_) => FailureCode::ConfigurationError,
            SessionError::PermissionDenied(_) => FailureCode::PermissionDenied,
            SessionError::Engine(EngineError::PermissionDenied(_)) => FailureCode::PermissionDenied,
            SessionError::Engine(_) => FailureCode::EngineError,
            SessionError::Io(_) => FailureCode::IoError,
            SessionError::Export(e) => FailureCode::from_export(e),
        }
    }

    /// Failure reason suitable for the `failed` state
    pub fn to_failure(&self) -> FailureReason {
        FailureReason::new(self.failure_code(), self.to_string())
    }
}

/// Reason codes callers branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    ConfigurationError,
    PermissionDenied,
    EngineError,
    IoError,
    ExportToolUnavailable,
    ExportPaletteFailed,
    ExportEncodeFailed,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::ConfigurationError => "CONFIGURATION_ERROR",
            FailureCode::PermissionDenied => "PERMISSION_DENIED",
            FailureCode::EngineError => "ENGINE_ERROR",
            FailureCode::IoError => "IO_ERROR",
            FailureCode::ExportToolUnavailable => "EXPORT_TOOL_UNAVAILABLE",
            FailureCode::ExportPaletteFailed => "EXPORT_PALETTE_FAILED",
            FailureCode::ExportEncodeFailed => "EXPORT_ENCODE_FAILED",
        }
    }

    fn from_export(error: &ExportError) -> Self {
        match error {
            ExportError::ToolUnavailable(_) => FailureCode::ExportToolUnavailable,
            ExportError::PaletteGenerationFailed(_) => FailureCode::ExportPaletteFailed,
            ExportError::Io(_) | ExportError::Finalize(_) => FailureCode::IoError,
            _ => FailureCode::ExportEncodeFailed,
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReason {
    pub code: FailureCode,
    /// Human-readable explanation
    pub message: String,
    /// Short reference that also appears in the logs
    pub diagnostic_id: String,
    /// Footage promoted from a partial file before failing, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salvaged_path: Option<std::path::PathBuf>,
}

impl FailureReason {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        let mut diagnostic_id = uuid::Uuid::new_v4().simple().to_string();
        diagnostic_id.truncate(8);
        Self {
            code,
            message: message.into(),
            diagnostic_id,
            salvaged_path: None,
        }
    }
}

/// Error response for front-ends
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<SessionError> for ErrorResponse {
    fn from(error: SessionError) -> Self {
        let code = match &error {
            SessionError::IllegalTransition(_) => "ILLEGAL_TRANSITION",
            SessionError::NoActiveSession => "NO_ACTIVE_SESSION",
            other => other.failure_code().as_str(),
        };

        ErrorResponse {
            code: code.to_string(),
            message: error.to_string(),
        }
    }
}

impl From<&FailureReason> for ErrorResponse {
    fn from(reason: &FailureReason) -> Self {
        ErrorResponse {
            code: reason.code.as_str().to_string(),
            message: format!("{} (ref {})", reason.message, reason.diagnostic_id),
        }
    }
}

/// Result type alias using SessionError
pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_permission_maps_to_permission_code() {
        let error = SessionError::Engine(EngineError::PermissionDenied("screen".into()));
        assert_eq!(error.failure_code(), FailureCode::PermissionDenied);
    }

    #[test]
    fn test_export_errors_are_classified() {
        let tool = SessionError::Export(ExportError::ToolUnavailable("ffmpeg".into()));
        assert_eq!(tool.failure_code(), FailureCode::ExportToolUnavailable);

        let palette = SessionError::Export(ExportError::PaletteGenerationFailed("x".into()));
        assert_eq!(palette.failure_code(), FailureCode::ExportPaletteFailed);

        let encode = SessionError::Export(ExportError::EncodeFailed("x".into()));
        assert_eq!(encode.failure_code(), FailureCode::ExportEncodeFailed);
    }

    #[test]
    fn test_failure_reason_has_short_reference() {
        let reason = FailureReason::new(FailureCode::IoError, "rename failed");
        assert_eq!(reason.diagnostic_id.len(), 8);

        let response = ErrorResponse::from(&reason);
        assert_eq!(response.code, "IO_ERROR");
        assert!(response.message.contains(&reason.diagnostic_id));
    }

    #[test]
    fn test_failure_code_wire_format() {
        let json = serde_json::to_string(&FailureCode::ExportPaletteFailed).unwrap();
        assert_eq!(json, "\"EXPORT_PALETTE_FAILED\"");
    }
}
