//! Error taxonomy for a backup run.
//!
//! The main protocol is fail-fast: every variant except [`BackupError::Cleanup`]
//! aborts the run. Cleanup failures are only logged.

use std::fmt;
use std::io;

/// A single host that failed a dispatched command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFailure {
    pub content_id: i32,
    pub hostname: String,
    /// Host-specific message built by the caller of the dispatch.
    pub message: String,
    /// Trimmed stderr of the failed command (may be empty).
    pub stderr: String,
}

impl fmt::Display for HostFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = if self.content_id < 0 {
            "coordinator"
        } else {
            "segment"
        };
        write!(
            f,
            "{role} {} on host {}: {}",
            self.content_id, self.hostname, self.message
        )?;
        if !self.stderr.is_empty() {
            write!(f, " ({})", self.stderr)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum BackupError {
    /// A catalog query failed.
    MetadataFetch(String),
    /// A cycle not closed by a partition-child-of edge.
    DependencyCycle { objects: Vec<String> },
    /// One or more hosts failed a dispatched command.
    ClusterCommand {
        description: String,
        failures: Vec<HostFailure>,
    },
    /// A relation lock could not be acquired; the session has been torn down.
    LockAcquisition { relation: String, message: String },
    /// The SQL session failed outside of locking.
    Session(String),
    /// A cleanup step failed. Never escalates the run's outcome.
    Cleanup(String),
    /// Invalid configuration or input files.
    Config(String),
    /// The run was stopped by an interrupt before it finished.
    Interrupted,
    Io(io::Error),
}

impl BackupError {
    /// Content ids of every failing host, for cluster command errors.
    pub fn failed_content_ids(&self) -> Vec<i32> {
        match self {
            BackupError::ClusterCommand { failures, .. } => {
                failures.iter().map(|f| f.content_id).collect()
            }
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for BackupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupError::MetadataFetch(message) => {
                write!(f, "failed to fetch catalog metadata: {message}")
            }
            BackupError::DependencyCycle { objects } => write!(
                f,
                "dependency cycle detected between objects: {}",
                objects.join(", ")
            ),
            BackupError::ClusterCommand {
                description,
                failures,
            } => {
                write!(
                    f,
                    "{description}: {} host(s) failed",
                    failures.len()
                )?;
                for failure in failures {
                    write!(f, "\n  {failure}")?;
                }
                Ok(())
            }
            BackupError::LockAcquisition { relation, message } => {
                write!(f, "unable to lock relation {relation}: {message}")
            }
            BackupError::Session(message) => write!(f, "catalog session error: {message}"),
            BackupError::Cleanup(message) => write!(f, "cleanup failed: {message}"),
            BackupError::Config(message) => write!(f, "invalid configuration: {message}"),
            BackupError::Interrupted => write!(f, "backup interrupted"),
            BackupError::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for BackupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BackupError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for BackupError {
    fn from(err: io::Error) -> Self {
        BackupError::Io(err)
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
