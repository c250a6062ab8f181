use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JournalEvent {
    RunStarted,
    TrialSucceeded,
    TrialFailed,
    RunExhausted,
    NoCandidates,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JournalRecord {
    pub timestamp_unix_ms: u128,
    pub run: u64,
    pub event: JournalEvent,
    pub candidate: Option<String>,
    pub elapsed_ms: Option<u64>,
    pub error: Option<String>,
}

impl JournalRecord {
    #[must_use]
    pub fn now(run: u64, event: JournalEvent) -> Self {
        Self {
            timestamp_unix_ms: unix_timestamp_millis(),
            run,
            event,
            candidate: None,
            elapsed_ms: None,
            error: None,
        }
    }

    #[must_use]
    pub fn with_candidate(mut self, candidate: impl Into<String>) -> Self {
        self.candidate = Some(candidate.into());
        self
    }

    #[must_use]
    pub fn with_elapsed_ms(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = Some(elapsed_ms);
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[must_use]
pub fn unix_timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("invalid journal path `{0}`")]
    InvalidPath(PathBuf),
    #[error("failed to create journal directory at {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize journal record: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to append journal record at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct FileResolutionJournal {
    path: PathBuf,
}

impl FileResolutionJournal {
    #[must_use]
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &JournalRecord) -> Result<(), JournalError> {
        let parent_dir = self
            .path
            .parent()
            .ok_or_else(|| JournalError::InvalidPath(self.path.clone()))?;
        fs::create_dir_all(parent_dir).map_err(|source| JournalError::CreateDir {
            path: parent_dir.to_path_buf(),
            source,
        })?;

        let rendered =
            serde_json::to_string(record).map_err(|source| JournalError::Serialize { source })?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| JournalError::Write {
                path: self.path.clone(),
                source,
            })?;
        writeln!(file, "{rendered}").map_err(|source| JournalError::Write {
            path: self.path.clone(),
            source,
        })
    }
}
