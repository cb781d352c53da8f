//! Session output files
//!
//! Partial-file allocation, atomic promotion and metadata sidecars.

pub mod manager;
pub mod metadata;

pub use manager::{
    is_partial, partial_path_for, promote, sidecar_path, FileError, SessionFileManager, TempPath,
    PARTIAL_SUFFIX,
};
pub use metadata::RecordingMetadata;
