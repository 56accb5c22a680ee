//! Core types for the analysis core
//!
//! Defines the records the orchestrator hands back to callers:
//! - Session and run identifiers
//! - Session / run status enums
//! - Uploaded file, pipeline run and result artifact records

use crate::error::{CoreError, Stage};
use cahs_intake::FileKind;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::TryRngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use ulid::Ulid;

/// Bytes of entropy in a session identifier
const SESSION_ID_BYTES: usize = 32;

/// Opaque session identifier
///
/// 256 bits from the operating system CSPRNG, lowercase hex encoded.
/// The hex alphabet is what makes the identifier safe to use as a
/// directory name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh identifier
    ///
    /// # Errors
    /// `Storage` if the OS random source is unavailable.
    pub fn generate() -> Result<Self, CoreError> {
        let mut bytes = [0u8; SESSION_ID_BYTES];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| CoreError::storage(format!("os random source unavailable: {e}")))?;
        Ok(Self(hex::encode(bytes)))
    }

    /// Hex representation
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for SessionId {
    type Err = CoreError;

    /// Accepts exactly the lowercase hex form produced by [`SessionId::generate`];
    /// anything else is reported as an unknown session.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let well_formed = s.len() == SESSION_ID_BYTES * 2
            && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if well_formed {
            Ok(Self(s.to_string()))
        } else {
            Err(CoreError::UnknownSession(s.to_string()))
        }
    }
}

impl TryFrom<String> for SessionId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique run identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId(pub Ulid);

impl RunId {
    /// Generate new run ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Workspace allocated, nothing uploaded
    Created,
    /// Some inputs present, no profile satisfied yet
    AwaitingInputs,
    /// Inputs satisfy at least one engine profile
    Ready,
    /// Engine run in progress
    Running,
    /// Last run produced an artifact
    Completed,
    /// Last run failed or produced nothing
    Failed,
}

/// Pipeline run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Submitted, engine not yet spawned
    Pending,
    /// Engine process alive
    Running,
    /// Engine exited with status zero
    Succeeded,
    /// Engine failed, was cancelled or timed out
    Failed,
}

impl RunStatus {
    /// Run has finished (successfully or not)
    #[inline]
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Why a run failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum FailureReason {
    /// Engine exited with a non-zero code (or was killed by a signal)
    NonZeroExit,
    /// Caller requested cancellation
    Cancelled,
    /// Run exceeded the configured time bound
    TimedOut,
    /// Engine process could not be started
    SpawnFailed { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonZeroExit => f.write_str("engine exited with failure"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::TimedOut => f.write_str("timed out"),
            Self::SpawnFailed { message } => write!(f, "engine could not be started: {message}"),
        }
    }
}

/// Kind of artifact an engine profile produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Variant-call file
    VariantCalls,
    /// Archive bundle
    Archive,
    /// Rendered image
    Image,
}

impl ArtifactKind {
    /// All artifact kinds
    pub const ALL: [ArtifactKind; 3] = [Self::VariantCalls, Self::Archive, Self::Image];

    /// File name suffixes identifying this kind (lowercase)
    #[inline]
    #[must_use]
    pub fn suffixes(self) -> &'static [&'static str] {
        match self {
            Self::VariantCalls => &[".vcf", ".vcf.gz"],
            Self::Archive => &[".zip", ".tar.gz"],
            Self::Image => &[".png", ".svg", ".pdf"],
        }
    }

    /// Whether `file_name` carries one of this kind's suffixes
    #[must_use]
    pub fn matches(self, file_name: &str) -> bool {
        let lower = file_name.to_ascii_lowercase();
        self.suffixes()
            .iter()
            .any(|suffix| lower.len() > suffix.len() && lower.ends_with(suffix))
    }

    /// Content type hint for a file of this kind
    #[must_use]
    pub fn content_type(self, file_name: &str) -> &'static str {
        let lower = file_name.to_ascii_lowercase();
        match self {
            _ if lower.ends_with(".gz") => "application/gzip",
            Self::VariantCalls => "text/x-vcf",
            Self::Archive => "application/zip",
            Self::Image if lower.ends_with(".svg") => "image/svg+xml",
            Self::Image if lower.ends_with(".pdf") => "application/pdf",
            Self::Image => "image/png",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::VariantCalls => "variant_calls",
            Self::Archive => "archive",
            Self::Image => "image",
        };
        f.write_str(name)
    }
}

/// A validated file stored in a session workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    /// Owning session
    pub session_id: SessionId,
    /// Client-supplied name
    pub original_name: String,
    /// Location inside the workspace
    pub stored_path: PathBuf,
    /// Logical kind
    pub kind: FileKind,
    /// Stored (decompressed) size in bytes
    pub byte_size: u64,
    /// Record count for FASTA / FASTQ inputs
    pub record_count: Option<usize>,
    /// Passed intake validation
    pub validated: bool,
    /// When the file was stored
    pub stored_at: DateTime<Utc>,
}

/// An artifact discovered after a successful run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultArtifact {
    /// Owning session
    pub session_id: SessionId,
    /// Location inside the workspace
    pub path: PathBuf,
    /// Artifact kind
    pub kind: ArtifactKind,
    /// When the locator found it
    pub discovered_at: DateTime<Utc>,
}

impl ResultArtifact {
    /// File name component, used as the download hint
    #[must_use]
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Final outcome of one analysis cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum TerminalStatus {
    /// Artifact located and ready to serve
    Completed { artifact: ResultArtifact },
    /// Some stage failed
    Failed {
        stage: Stage,
        reason: String,
        /// Captured engine stderr, verbatim, for execution failures
        stderr: Option<String>,
    },
}

impl TerminalStatus {
    /// Whether the cycle produced an artifact
    #[inline]
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed { artifact } => {
                write!(f, "completed: {} artifact '{}'", artifact.kind, artifact.file_name())
            }
            Self::Failed { stage, reason, stderr } => {
                write!(f, "failed at {stage} stage: {reason}")?;
                if let Some(stderr) = stderr.as_deref().filter(|s| !s.is_empty()) {
                    write!(f, "\n{stderr}")?;
                }
                Ok(())
            }
        }
    }
}

/// One invocation of the external engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Run identifier
    pub id: RunId,
    /// Owning session
    pub session_id: SessionId,
    /// Engine profile name
    pub profile: String,
    /// Engine program
    pub program: String,
    /// Resolved argument list
    pub args: Vec<String>,
    /// Current status
    pub status: RunStatus,
    /// Failure reason when `status == Failed`
    pub failure: Option<FailureReason>,
    /// Process exit code (absent when killed by a signal or never spawned)
    pub exit_code: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Submission time
    pub submitted_at: DateTime<Utc>,
    /// Process start time
    pub started_at: Option<DateTime<Utc>>,
    /// Process end time
    pub finished_at: Option<DateTime<Utc>>,
    /// Outcome of the whole cycle, set once the run and artifact lookup end
    pub terminal: Option<TerminalStatus>,
}

impl PipelineRun {
    /// Create a pending run record
    #[must_use]
    pub fn pending(
        id: RunId,
        session_id: SessionId,
        profile: &str,
        program: &str,
        args: Vec<String>,
    ) -> Self {
        Self {
            id,
            session_id,
            profile: profile.to_string(),
            program: program.to_string(),
            args,
            status: RunStatus::Pending,
            failure: None,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            terminal: None,
        }
    }

    /// Wall-clock duration of the engine process, if it ran
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Session identifier
    pub id: SessionId,
    /// Workspace directory
    pub workspace: PathBuf,
    /// Lifecycle status
    pub status: SessionStatus,
    /// Stored inputs by kind
    pub uploads: BTreeMap<FileKind, UploadedFile>,
    /// Run currently in progress
    pub active_run: Option<RunId>,
    /// Most recent run
    pub last_run: Option<RunId>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Identity of an already-authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal(pub String);

impl Principal {
    /// Create principal from an identity string
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Operations gated by the capability check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Allocate a session
    CreateSession,
    /// Upload an input file
    Upload,
    /// Start an engine run
    Run,
    /// Cancel a run
    Cancel,
    /// Read status or download an artifact
    Read,
    /// Release a session
    Teardown,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreateSession => "create_session",
            Self::Upload => "upload",
            Self::Run => "run",
            Self::Cancel => "cancel",
            Self::Read => "read",
            Self::Teardown => "teardown",
        };
        f.write_str(name)
    }
}
