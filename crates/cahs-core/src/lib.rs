//! CAHS Core - session-scoped analysis orchestration
//!
//! Accepts genomic uploads into isolated per-session workspaces, runs an
//! external analysis engine over them, and hands back the artifact it
//! produced:
//! - Session arena with one exclusive workspace per session
//! - Engine runs as supervised child process groups on tokio tasks
//! - Deterministic artifact discovery by suffix
//! - Byte-exact artifact delivery
//!
//! # Example
//!
//! ```rust,no_run
//! use cahs_core::prelude::*;
//! use cahs_intake::encode_payload;
//!
//! # async fn example() -> Result<(), CoreError> {
//! let config = OrchestratorConfig::load("cahs.toml")?;
//! let orchestrator = Orchestrator::new(config)?;
//! let me = Principal::new("analyst");
//!
//! let session = orchestrator.create_session(&me).await?;
//! let reads = encode_payload("", b"@r1\nACGT\n+\nIIII\n");
//! orchestrator.ingest(&me, &session, "sample.fastq", &reads).await?;
//!
//! let run = orchestrator.run(&me, &session, "bacteria").await?;
//! if let Some(TerminalStatus::Completed { artifact }) = &run.terminal {
//!     let bytes = orchestrator.serve(&me, artifact).await?.into_bytes().await?;
//!     println!("{} bytes", bytes.len());
//! }
//! orchestrator.teardown(&me, &session).await?;
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod locator;
pub mod orchestrator;
pub mod profile;
pub mod session;
pub mod state;
pub mod types;

pub use auth::{ActionAllowList, AllowAll, CapabilityCheck};
pub use config::OrchestratorConfig;
pub use dispatch::{Delivery, DownloadDispatcher};
pub use error::{CoreError, Stage};
pub use executor::{ExecutionOutcome, Invocation, PipelineExecutor, Termination};
pub use locator::ResultLocator;
pub use orchestrator::Orchestrator;
pub use profile::{EngineProfile, Placeholder};
pub use session::{DetachedSession, SessionManager};
pub use types::{
    Action, ArtifactKind, FailureReason, PipelineRun, Principal, ResultArtifact, RunId, RunStatus,
    SessionId, SessionSnapshot, SessionStatus, TerminalStatus, UploadedFile,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving the orchestrator
    pub use crate::{
        ArtifactKind, CoreError, EngineProfile, Orchestrator, OrchestratorConfig, PipelineRun,
        Principal, RunId, SessionId, TerminalStatus,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
