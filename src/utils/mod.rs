//! Shared utilities

pub mod error;

pub use error::{ErrorResponse, FailureCode, FailureReason, SessionError, SessionResult};
