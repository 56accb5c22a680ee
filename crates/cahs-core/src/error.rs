//! Error types for the analysis core
//!
//! Errors are grouped by the stage that raised them:
//! - Upload (decode / format / structure)
//! - Precondition (session, inputs, concurrency, access)
//! - Execution (engine spawn / exit / timeout / cancellation)
//! - Result (artifact discovery and delivery)
//!
//! None of them abort the orchestrator; each is reported to the caller.

use crate::types::{Action, ArtifactKind, RunId};
use cahs_intake::{FileKind, IntakeError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Main core error type
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Upload rejected by intake
    #[error(transparent)]
    Intake(#[from] IntakeError),

    /// Session id was never issued, was torn down, or is not owned by the caller
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// Inputs required by the engine profile are absent
    #[error("missing input: {}", format_kinds(.missing))]
    MissingInput { missing: Vec<FileKind> },

    /// Another run is active for the session
    #[error("run {active} already in progress for this session")]
    RunInProgress { active: RunId },

    /// Run id is not known
    #[error("unknown run: {0}")]
    UnknownRun(RunId),

    /// Engine profile is not configured
    #[error("unknown engine profile: '{0}'")]
    UnknownProfile(String),

    /// Capability check refused the action
    #[error("not authorized to {action}")]
    Unauthorized { action: Action },

    /// Engine run finished without success
    #[error("engine run failed: {reason}")]
    EngineFailed {
        reason: String,
        /// Captured stderr, verbatim
        stderr: String,
    },

    /// Engine succeeded but produced no artifact of the expected kind
    #[error("no {kind} artifact found in workspace")]
    ArtifactNotFound { kind: ArtifactKind },

    /// Located artifact could not be opened (e.g. removed by cleanup)
    #[error("artifact unreadable at {path}: {source}")]
    ArtifactUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Illegal session status transition
    #[error("illegal session transition: {0}")]
    InvalidTransition(String),

    /// Configuration is invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// Workspace storage failure
    #[error("storage error: {0}")]
    Storage(String),
}

impl CoreError {
    /// Create storage error
    #[inline]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create storage error for an I/O failure on `path`
    #[inline]
    pub fn io(path: impl AsRef<std::path::Path>, source: &std::io::Error) -> Self {
        Self::Storage(format!("{}: {source}", path.as_ref().display()))
    }

    /// Stage that raised the error
    #[must_use]
    pub fn stage(&self) -> Stage {
        match self {
            Self::Intake(_) => Stage::Upload,
            Self::UnknownSession(_)
            | Self::MissingInput { .. }
            | Self::RunInProgress { .. }
            | Self::UnknownRun(_)
            | Self::UnknownProfile(_)
            | Self::Unauthorized { .. }
            | Self::InvalidTransition(_)
            | Self::Config(_) => Stage::Precondition,
            Self::EngineFailed { .. } => Stage::Execution,
            Self::ArtifactNotFound { .. } | Self::ArtifactUnreadable { .. } => Stage::Result,
            Self::Storage(_) => Stage::Storage,
        }
    }

    /// Check if the caller may simply try again
    ///
    /// Nothing is retried inside the core; this only classifies.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ArtifactUnreadable { .. } | Self::RunInProgress { .. }
        )
    }

    /// Status string reported to the caller
    #[must_use]
    pub fn status_string(&self) -> String {
        match self {
            Self::EngineFailed { reason, stderr } if !stderr.is_empty() => {
                format!("failed at {} stage: {reason}\n{stderr}", self.stage())
            }
            other => format!("failed at {} stage: {other}", other.stage()),
        }
    }
}

/// Stage of the upload / execute / retrieve flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Decoding and validating uploads
    Upload,
    /// Checks before an operation runs
    Precondition,
    /// Engine process
    Execution,
    /// Artifact discovery and delivery
    Result,
    /// Workspace storage
    Storage,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Upload => "upload",
            Self::Precondition => "precondition",
            Self::Execution => "execution",
            Self::Result => "result",
            Self::Storage => "storage",
        };
        f.write_str(name)
    }
}

fn format_kinds(kinds: &[FileKind]) -> String {
    kinds
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_input_lists_kinds() {
        let err = CoreError::MissingInput {
            missing: vec![FileKind::Reference, FileKind::Alignment],
        };
        assert_eq!(err.to_string(), "missing input: reference, alignment");
        assert_eq!(err.stage(), Stage::Precondition);
    }

    #[test]
    fn intake_errors_are_upload_stage() {
        let err = CoreError::from(IntakeError::EmptyFile {
            filename: "reads.fastq".into(),
        });
        assert_eq!(err.stage(), Stage::Upload);
        assert_eq!(
            err.status_string(),
            "failed at upload stage: no sequence records found in 'reads.fastq'"
        );
    }

    #[test]
    fn unreadable_artifact_is_retryable() {
        let err = CoreError::ArtifactUnreadable {
            path: PathBuf::from("/tmp/x.vcf"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(err.is_retryable());
        assert_eq!(err.stage(), Stage::Result);
        assert!(!CoreError::ArtifactNotFound { kind: ArtifactKind::Archive }.is_retryable());
    }

    #[test]
    fn engine_failure_status_includes_stderr() {
        let err = CoreError::EngineFailed {
            reason: "exit code 1".into(),
            stderr: "boom".into(),
        };
        assert_eq!(err.status_string(), "failed at execution stage: exit code 1\nboom");
    }
}
