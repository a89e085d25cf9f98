//! Append-only JSONL audit log.
//!
//! One record per line, never mutated in place, so counters and violation
//! rates are always reconstructable from the log alone. A failed append is
//! retried once before the error is surfaced to the caller.

use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Errors from audit log operations.
#[derive(Debug, Error)]
pub enum AuditLogError {
    #[error("audit log io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit log serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a JSON line. Retries once on an IO failure.
    pub fn append<T: Serialize>(&self, record: &T) -> Result<(), AuditLogError> {
        let line = serde_json::to_string(record)?;
        match self.write_line(&line) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    "AuditLog: write to {} failed ({}), retrying once",
                    self.path.display(),
                    e
                );
                self.write_line(&line).map_err(AuditLogError::Io)
            }
        }
    }

    fn write_line(&self, line: &str) -> Result<(), std::io::Error> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)
    }

    /// Number of records currently in the log. Zero for a missing file.
    pub fn len(&self) -> Result<usize, AuditLogError> {
        if !self.path.exists() {
            return Ok(0);
        }
        let contents = fs::read_to_string(&self.path)?;
        Ok(contents.lines().filter(|l| !l.trim().is_empty()).count())
    }

    pub fn is_empty(&self) -> Result<bool, AuditLogError> {
        Ok(self.len()? == 0)
    }
}
