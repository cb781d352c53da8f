//! Session file manager
//!
//! Engines only ever write `<name>.partial`. A recording becomes visible
//! under its final name through a single same-directory rename, so a file
//! with a final name is always complete.

use crate::storage::metadata::RecordingMetadata;
use chrono::{DateTime, Local};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Suffix of files still being written
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Prefix of generated recording names
pub const FILENAME_PREFIX: &str = "Recording";

/// File-related errors
#[derive(Error, Debug)]
pub enum FileError {
    #[error("Partial file is missing: {0}")]
    MissingPartial(PathBuf),

    #[error("Recording is empty: {0}")]
    EmptyOutput(PathBuf),

    #[error("Destination already exists: {0}")]
    FinalExists(PathBuf),

    #[error("Failed to rename {from:?} to {to:?}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A session's in-progress path and the name it will be promoted to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempPath {
    pub session_id: Uuid,
    pub partial: PathBuf,
    pub final_path: PathBuf,
}

/// Allocates, promotes and discards session output files
#[derive(Debug, Clone)]
pub struct SessionFileManager {
    output_dir: PathBuf,
}

impl SessionFileManager {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Reserve the partial MP4 for a new session
    pub fn begin_session(&self, session_id: Uuid) -> Result<TempPath, FileError> {
        self.allocate(session_id, "mp4", Local::now())
    }

    /// Allocate a partial path for a new session
    ///
    /// Names look like `Recording 2024-03-01 at 14.05.09 (1a2b3c4d).mp4`; the
    /// short session id keeps names unique within the same second.
    pub fn allocate(
        &self,
        session_id: Uuid,
        extension: &str,
        created_at: DateTime<Local>,
    ) -> Result<TempPath, FileError> {
        fs::create_dir_all(&self.output_dir)?;

        let mut short_id = session_id.simple().to_string();
        short_id.truncate(8);
        let name = format!(
            "{} {} ({}).{}",
            FILENAME_PREFIX,
            created_at.format("%Y-%m-%d at %H.%M.%S"),
            short_id,
            extension
        );

        let final_path = self.output_dir.join(name);
        let temp = TempPath {
            session_id,
            partial: partial_path_for(&final_path),
            final_path,
        };
        tracing::debug!("Allocated {:?} for session {}", temp.partial, session_id);
        Ok(temp)
    }

    /// Promote the partial file to its final name
    pub fn finalize(&self, temp: &TempPath) -> Result<PathBuf, FileError> {
        promote(&temp.partial, &temp.final_path)
    }

    /// Remove the partial file; never fails
    pub fn discard(&self, temp: &TempPath) {
        remove_quietly(&temp.partial);
    }

    /// Write the JSON sidecar next to a finalized recording
    pub fn write_metadata_sidecar(
        &self,
        final_path: &Path,
        metadata: &RecordingMetadata,
    ) -> Result<PathBuf, FileError> {
        let path = sidecar_path(final_path);
        let dir = path.parent().unwrap_or(&self.output_dir);

        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(serde_json::to_string_pretty(metadata)?.as_bytes())?;
        file.persist(&path).map_err(|e| FileError::Io(e.error))?;

        tracing::debug!("Wrote metadata {:?}", path);
        Ok(path)
    }

    /// Read a sidecar back
    pub fn read_metadata(&self, final_path: &Path) -> Result<RecordingMetadata, FileError> {
        let content = fs::read_to_string(sidecar_path(final_path))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Remove a finalized recording and its sidecar
    pub fn remove_recording(&self, final_path: &Path) {
        remove_quietly(final_path);
        remove_quietly(&sidecar_path(final_path));
    }

    /// Partial files left behind by a previous process
    pub fn find_orphaned_partials(&self) -> Result<Vec<PathBuf>, FileError> {
        let entries = match fs::read_dir(&self.output_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut orphans = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && is_partial(&path) {
                orphans.push(path);
            }
        }
        orphans.sort();
        Ok(orphans)
    }
}

/// `<final>.partial`
pub fn partial_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// `<final>.json`
pub fn sidecar_path(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_owned();
    name.push(".json");
    PathBuf::from(name)
}

pub fn is_partial(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.ends_with(PARTIAL_SUFFIX))
        .unwrap_or(false)
}

/// Atomically rename a complete partial file to its final name
///
/// The partial must exist, be non-empty and readable, and the final name must
/// be free. On any failure the partial is left untouched.
pub fn promote(partial: &Path, final_path: &Path) -> Result<PathBuf, FileError> {
    let metadata = fs::metadata(partial).map_err(|e| match e.kind() {
        ErrorKind::NotFound => FileError::MissingPartial(partial.to_path_buf()),
        _ => FileError::Io(e),
    })?;

    if metadata.len() == 0 {
        return Err(FileError::EmptyOutput(partial.to_path_buf()));
    }
    fs::File::open(partial)?;

    if final_path.exists() {
        return Err(FileError::FinalExists(final_path.to_path_buf()));
    }

    fs::rename(partial, final_path).map_err(|source| FileError::Rename {
        from: partial.to_path_buf(),
        to: final_path.to_path_buf(),
        source,
    })?;

    tracing::info!("Finalized {:?}", final_path);
    Ok(final_path.to_path_buf())
}

pub(crate) fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!("Removed {:?}", path),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove {:?}: {}", path, e),
    }
}
