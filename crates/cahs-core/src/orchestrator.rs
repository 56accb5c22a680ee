//! Orchestrator
//!
//! Ties the stages together behind one session-scoped API:
//!
//! ```text
//! create_session → ingest* → submit_run → (poll | wait) → locate → serve → teardown
//! ```
//!
//! Every operation takes the caller's [`Principal`]. The capability check
//! runs first, then session ownership; sessions owned by someone else look
//! exactly like sessions that do not exist.
//!
//! Runs execute on their own tokio task. `submit_run` returns as soon as the
//! engine is scheduled; the task records the exit, locates the artifact on
//! success and releases the session for the next cycle.

use crate::auth::{AllowAll, CapabilityCheck};
use crate::config::OrchestratorConfig;
use crate::dispatch::{Delivery, DownloadDispatcher};
use crate::error::{CoreError, Stage};
use crate::executor::{Invocation, PipelineExecutor};
use crate::locator::ResultLocator;
use crate::session::{DetachedSession, SessionManager};
use crate::types::{
    Action, ArtifactKind, PipelineRun, Principal, ResultArtifact, RunId, RunStatus, SessionId,
    SessionSnapshot, TerminalStatus, UploadedFile,
};
use cahs_intake::{FileKind, Validator};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::path::{Component, Path};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// How long teardown waits for a cancelled run to wind down
const TEARDOWN_GRACE: Duration = Duration::from_secs(10);

/// Shared record of one submitted run
#[derive(Debug)]
struct RunSlot {
    owner: Principal,
    session_id: SessionId,
    run: RwLock<PipelineRun>,
    cancel: watch::Sender<bool>,
    done: watch::Sender<bool>,
}

impl RunSlot {
    async fn finished(&self) {
        let mut done = self.done.subscribe();
        // the sender lives in `self`, so the channel cannot close here
        let _ = done.wait_for(|finished| *finished).await;
    }
}

/// Everything the run task needs, detached from the orchestrator borrow
struct RunContext {
    slot: Arc<RunSlot>,
    sessions: Arc<SessionManager>,
    executor: PipelineExecutor,
    locator: ResultLocator,
    invocation: Invocation,
    expects: ArtifactKind,
}

/// Session-scoped upload, execute and retrieve core
pub struct Orchestrator {
    config: OrchestratorConfig,
    sessions: Arc<SessionManager>,
    validator: Validator,
    executor: PipelineExecutor,
    locator: ResultLocator,
    dispatcher: DownloadDispatcher,
    runs: DashMap<RunId, Arc<RunSlot>>,
    access: Arc<dyn CapabilityCheck>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("workspace_root", &self.sessions.root())
            .field("sessions", &self.sessions.len())
            .field("runs", &self.runs.len())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Create orchestrator from validated configuration
    ///
    /// # Errors
    /// `Config` if the configuration is invalid, `Storage` if the workspace
    /// root cannot be resolved.
    pub fn new(config: OrchestratorConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let sessions = Arc::new(SessionManager::new(&config.workspace_root)?);
        Ok(Self {
            validator: Validator::new(config.intake),
            locator: ResultLocator::new(config.output_subdir.clone()),
            executor: PipelineExecutor::new(),
            dispatcher: DownloadDispatcher::new(),
            runs: DashMap::new(),
            access: Arc::new(AllowAll),
            sessions,
            config,
        })
    }

    /// With capability checker
    #[must_use]
    pub fn with_access(mut self, access: Arc<dyn CapabilityCheck>) -> Self {
        self.access = access;
        self
    }

    /// Active configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Session manager
    #[inline]
    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    fn authorize(&self, principal: &Principal, action: Action) -> Result<(), CoreError> {
        if self.access.permits(principal, action) {
            Ok(())
        } else {
            tracing::warn!(principal = %principal, %action, "action refused");
            Err(CoreError::Unauthorized { action })
        }
    }

    fn slot(&self, principal: &Principal, run_id: RunId) -> Result<Arc<RunSlot>, CoreError> {
        self.runs
            .get(&run_id)
            .map(|slot| Arc::clone(slot.value()))
            .filter(|slot| &slot.owner == principal)
            .ok_or(CoreError::UnknownRun(run_id))
    }

    /// Allocate a session with an empty workspace
    ///
    /// # Errors
    /// `Unauthorized`, or `Storage` if the workspace cannot be created.
    pub async fn create_session(&self, principal: &Principal) -> Result<SessionId, CoreError> {
        self.authorize(principal, Action::CreateSession)?;
        self.sessions.create_session(principal).await
    }

    /// Workspace directory of a session
    ///
    /// # Errors
    /// `Unauthorized` or `UnknownSession`.
    pub fn get_workspace(
        &self,
        principal: &Principal,
        session_id: &SessionId,
    ) -> Result<std::path::PathBuf, CoreError> {
        self.authorize(principal, Action::Read)?;
        self.sessions.get_workspace(session_id, principal)
    }

    /// Point-in-time view of a session
    ///
    /// # Errors
    /// `Unauthorized` or `UnknownSession`.
    pub async fn snapshot(
        &self,
        principal: &Principal,
        session_id: &SessionId,
    ) -> Result<SessionSnapshot, CoreError> {
        self.authorize(principal, Action::Read)?;
        self.sessions.snapshot(session_id, principal).await
    }

    /// Validate an encoded upload and store it in the session workspace
    ///
    /// # Errors
    /// - `Unauthorized` or `UnknownSession`
    /// - any intake error (`DecodeError`, `UnsupportedFormat`, `EmptyFile`,
    ///   `ParseError`, `TooLarge`); nothing is written in that case
    /// - `RunInProgress` while the engine is using the inputs
    /// - `Storage` if the file cannot be written
    pub async fn ingest(
        &self,
        principal: &Principal,
        session_id: &SessionId,
        filename: &str,
        encoded: &str,
    ) -> Result<UploadedFile, CoreError> {
        self.authorize(principal, Action::Upload)?;
        // fail fast on foreign or stale sessions before decoding anything
        self.sessions.get_workspace(session_id, principal)?;

        let upload = self.validator.validate(filename, encoded).map_err(|e| {
            tracing::info!(session = %session_id, file = filename, error = %e, "upload rejected");
            CoreError::from(e)
        })?;

        let profiles = &self.config.profiles;
        let is_ready = |kinds: &[FileKind]| {
            profiles
                .values()
                .any(|profile| profile.required_inputs().iter().all(|k| kinds.contains(k)))
        };
        self.sessions
            .store_upload(session_id, principal, upload, &is_ready)
            .await
    }

    /// Start an engine run in the background
    ///
    /// Returns once the run is scheduled. Nothing is spawned when the
    /// session lacks an input the profile needs.
    ///
    /// # Errors
    /// - `Unauthorized`, `UnknownSession` or `UnknownProfile`
    /// - `RunInProgress` if the session already has an active run
    /// - `MissingInput` listing every absent input kind
    /// - `Storage` if the output directory cannot be prepared
    pub async fn submit_run(
        &self,
        principal: &Principal,
        session_id: &SessionId,
        profile_name: &str,
    ) -> Result<RunId, CoreError> {
        self.authorize(principal, Action::Run)?;
        let profile = self
            .config
            .profiles
            .get(profile_name)
            .ok_or_else(|| CoreError::UnknownProfile(profile_name.to_string()))?;

        let run_id = RunId::new();
        let workspace = self
            .sessions
            .begin_run(session_id, principal, run_id, &profile.required_inputs())
            .await?;

        let prepared = self.prepare(&workspace, profile_name).await;
        let args = match prepared {
            Ok(args) => args,
            Err(e) => {
                self.sessions.finish_run(session_id, run_id, false).await;
                return Err(e);
            }
        };

        let run = PipelineRun::pending(
            run_id,
            session_id.clone(),
            profile_name,
            &profile.program,
            args.clone(),
        );
        let (cancel, _) = watch::channel(false);
        let (done, _) = watch::channel(false);
        let slot = Arc::new(RunSlot {
            owner: principal.clone(),
            session_id: session_id.clone(),
            run: RwLock::new(run),
            cancel,
            done,
        });
        self.runs.insert(run_id, Arc::clone(&slot));

        let context = RunContext {
            slot,
            sessions: Arc::clone(&self.sessions),
            executor: self.executor.clone(),
            locator: self.locator.clone(),
            invocation: Invocation {
                program: profile.program.clone(),
                args,
                workspace,
                timeout: self.config.run_timeout(),
            },
            expects: profile.expects,
        };
        let span = tracing::info_span!("run", run = %run_id, session = %session_id, profile = profile_name);
        tokio::spawn(drive_run(context).instrument(span));

        tracing::info!(run = %run_id, session = %session_id, profile = profile_name, "run submitted");
        Ok(run_id)
    }

    async fn prepare(&self, workspace: &Path, profile_name: &str) -> Result<Vec<String>, CoreError> {
        let profile = self
            .config
            .profiles
            .get(profile_name)
            .ok_or_else(|| CoreError::UnknownProfile(profile_name.to_string()))?;
        self.locator.clear_previous(workspace).await?;
        profile.resolve(workspace, &self.locator.output_dir(workspace))
    }

    /// Current record of a run
    ///
    /// # Errors
    /// `Unauthorized`, or `UnknownRun` if the run is unknown or not owned.
    pub fn run_status(&self, principal: &Principal, run_id: RunId) -> Result<PipelineRun, CoreError> {
        self.authorize(principal, Action::Read)?;
        Ok(self.slot(principal, run_id)?.run.read().clone())
    }

    /// Wait until a run and its artifact lookup have finished
    ///
    /// # Errors
    /// `Unauthorized` or `UnknownRun`.
    pub async fn wait_for_run(
        &self,
        principal: &Principal,
        run_id: RunId,
    ) -> Result<PipelineRun, CoreError> {
        self.authorize(principal, Action::Read)?;
        let slot = self.slot(principal, run_id)?;
        slot.finished().await;
        let run = slot.run.read().clone();
        Ok(run)
    }

    /// Submit a run and wait for its terminal status
    ///
    /// # Errors
    /// Same as [`Orchestrator::submit_run`]. Engine failures are not errors;
    /// they are reported in the returned run's terminal status.
    pub async fn run(
        &self,
        principal: &Principal,
        session_id: &SessionId,
        profile_name: &str,
    ) -> Result<PipelineRun, CoreError> {
        let run_id = self.submit_run(principal, session_id, profile_name).await?;
        self.wait_for_run(principal, run_id).await
    }

    /// Request cancellation of a run
    ///
    /// Kills the engine's process group. Cancelling a finished run is a no-op.
    ///
    /// # Errors
    /// `Unauthorized` or `UnknownRun`.
    pub fn cancel_run(&self, principal: &Principal, run_id: RunId) -> Result<(), CoreError> {
        self.authorize(principal, Action::Cancel)?;
        let slot = self.slot(principal, run_id)?;
        slot.cancel.send_replace(true);
        tracing::info!(run = %run_id, "cancellation requested");
        Ok(())
    }

    /// Find the artifact of `kind` in a session workspace
    ///
    /// # Errors
    /// `Unauthorized`, `UnknownSession` or `ArtifactNotFound`.
    pub async fn locate(
        &self,
        principal: &Principal,
        session_id: &SessionId,
        kind: ArtifactKind,
    ) -> Result<ResultArtifact, CoreError> {
        self.authorize(principal, Action::Read)?;
        let workspace = self.sessions.get_workspace(session_id, principal)?;
        self.locator.locate(session_id, &workspace, kind).await
    }

    /// Open a located artifact for delivery
    ///
    /// The artifact must lie inside the workspace of a session the
    /// principal owns.
    ///
    /// # Errors
    /// `Unauthorized`, `UnknownSession` or `ArtifactUnreadable`.
    pub async fn serve(
        &self,
        principal: &Principal,
        artifact: &ResultArtifact,
    ) -> Result<Delivery, CoreError> {
        self.authorize(principal, Action::Read)?;
        let workspace = self.sessions.get_workspace(&artifact.session_id, principal)?;
        confine(&workspace, artifact).await?;
        self.dispatcher.serve(artifact).await
    }

    /// Open the artifact of a completed run for delivery
    ///
    /// # Errors
    /// - `Unauthorized` or `UnknownRun`
    /// - `EngineFailed` with the engine's stderr if the engine run failed
    /// - `ArtifactNotFound` if the run has not completed with an artifact
    /// - `ArtifactUnreadable` if the file has gone since it was located
    pub async fn download(&self, principal: &Principal, run_id: RunId) -> Result<Delivery, CoreError> {
        self.authorize(principal, Action::Read)?;
        let slot = self.slot(principal, run_id)?;
        let (terminal, expects) = {
            let run = slot.run.read();
            let expects = self
                .config
                .profiles
                .get(&run.profile)
                .map_or(ArtifactKind::VariantCalls, |p| p.expects);
            (run.terminal.clone(), expects)
        };
        match terminal {
            Some(TerminalStatus::Completed { artifact }) => self.serve(principal, &artifact).await,
            Some(TerminalStatus::Failed {
                stage: Stage::Execution,
                reason,
                stderr,
            }) => Err(CoreError::EngineFailed {
                reason,
                stderr: stderr.unwrap_or_default(),
            }),
            _ => Err(CoreError::ArtifactNotFound { kind: expects }),
        }
    }

    /// Tear down a session: cancel its run, release its workspace
    ///
    /// Idempotent; unknown sessions are a no-op.
    ///
    /// # Errors
    /// `Unauthorized`, or `Storage` if the workspace cannot be removed.
    pub async fn teardown(&self, principal: &Principal, session_id: &SessionId) -> Result<(), CoreError> {
        self.authorize(principal, Action::Teardown)?;
        match self.sessions.detach(session_id, principal) {
            Some(detached) => self.release(detached).await,
            None => Ok(()),
        }
    }

    async fn release(&self, detached: DetachedSession) -> Result<(), CoreError> {
        if let Some(run_id) = detached.active_run().await {
            let slot = self.runs.get(&run_id).map(|s| Arc::clone(s.value()));
            if let Some(slot) = slot {
                slot.cancel.send_replace(true);
                if tokio::time::timeout(TEARDOWN_GRACE, slot.finished()).await.is_err() {
                    tracing::warn!(run = %run_id, "run still winding down at teardown");
                }
            }
        }
        let id = detached.id().clone();
        self.runs.retain(|_, slot| slot.session_id != id);
        self.sessions.release_workspace(detached).await
    }

    /// Tear down every session idle for longer than the configured TTL
    ///
    /// Sessions with an active run are kept. Returns the evicted ids.
    pub async fn evict_idle(&self) -> Vec<SessionId> {
        let ttl = self.config.session_ttl();
        let mut evicted = Vec::new();
        for id in self.sessions.idle_sessions(ttl).await {
            // releasing earlier sessions can take a while; the owner may be back
            let Some(detached) = self.sessions.detach_idle(&id, ttl) else {
                continue;
            };
            match self.release(detached).await {
                Ok(()) => evicted.push(id),
                Err(e) => tracing::warn!(session = %id, error = %e, "eviction failed"),
            }
        }
        if !evicted.is_empty() {
            tracing::info!(count = evicted.len(), "evicted idle sessions");
        }
        evicted
    }

    /// Run [`Orchestrator::evict_idle`] periodically
    ///
    /// The sweeper stops on its own once the orchestrator is dropped.
    #[must_use]
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(orchestrator) = weak.upgrade() else {
                    break;
                };
                orchestrator.evict_idle().await;
            }
        })
    }
}

/// Refuse artifact paths that leave `workspace`
///
/// The path must name something below the workspace using plain components
/// only, and must still resolve inside it once symlinks are followed.
async fn confine(workspace: &Path, artifact: &ResultArtifact) -> Result<(), CoreError> {
    let outside = || CoreError::UnknownSession(artifact.session_id.to_string());
    let relative = artifact.path.strip_prefix(workspace).map_err(|_| outside())?;
    let mut components = relative.components().peekable();
    if components.peek().is_none() || !components.all(|c| matches!(c, Component::Normal(_))) {
        return Err(outside());
    }

    let unreadable = |source| CoreError::ArtifactUnreadable {
        path: artifact.path.clone(),
        source,
    };
    let resolved_workspace = tokio::fs::canonicalize(workspace).await.map_err(unreadable)?;
    let resolved = tokio::fs::canonicalize(&artifact.path).await.map_err(unreadable)?;
    if resolved.starts_with(&resolved_workspace) {
        Ok(())
    } else {
        tracing::warn!(
            session = %artifact.session_id,
            path = %artifact.path.display(),
            "artifact resolves outside its workspace"
        );
        Err(outside())
    }
}

/// Body of the per-run task
async fn drive_run(context: RunContext) {
    let RunContext {
        slot,
        sessions,
        executor,
        locator,
        invocation,
        expects,
    } = context;
    let run_id = slot.run.read().id;

    {
        let mut run = slot.run.write();
        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
    }

    let outcome = executor.execute(&invocation, slot.cancel.subscribe()).await;

    let terminal = if outcome.succeeded() {
        match locator.locate(&slot.session_id, &invocation.workspace, expects).await {
            Ok(artifact) => TerminalStatus::Completed { artifact },
            Err(e) => TerminalStatus::Failed {
                stage: e.stage(),
                reason: e.to_string(),
                stderr: None,
            },
        }
    } else {
        TerminalStatus::Failed {
            stage: Stage::Execution,
            reason: outcome.describe(),
            stderr: Some(outcome.stderr.clone()),
        }
    };
    let completed = terminal.is_completed();

    {
        let mut run = slot.run.write();
        run.status = if outcome.succeeded() {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };
        run.failure = outcome.failure();
        run.exit_code = outcome.exit_code;
        run.started_at = Some(outcome.started_at);
        run.finished_at = Some(outcome.finished_at);
        run.stdout = outcome.stdout;
        run.stderr = outcome.stderr;
        tracing::info!(
            status = ?run.status,
            exit_code = ?run.exit_code,
            duration_ms = run.duration().map(|d| d.num_milliseconds()),
            terminal = %terminal,
            "run finished"
        );
        run.terminal = Some(terminal);
    }

    sessions.finish_run(&slot.session_id, run_id, completed).await;
    slot.done.send_replace(true);
}
