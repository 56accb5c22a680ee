//! Session manager
//!
//! Owns the arena of live sessions. Each session gets one workspace
//! directory, `<root>/<session-id>`, created empty and used by nobody else.
//! Per-session state sits behind an async mutex so the run-in-progress check
//! and its update happen under one lock acquisition.

use crate::error::CoreError;
use crate::state::validate_transition;
use crate::types::{Principal, RunId, SessionId, SessionSnapshot, SessionStatus, UploadedFile};
use cahs_intake::{FileKind, ValidatedUpload};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Mutable part of a session
#[derive(Debug)]
struct SessionState {
    status: SessionStatus,
    uploads: BTreeMap<FileKind, UploadedFile>,
    active_run: Option<RunId>,
    last_run: Option<RunId>,
}

impl SessionState {
    fn transition(&mut self, to: SessionStatus) -> Result<(), CoreError> {
        validate_transition(self.status, to)?;
        self.status = to;
        Ok(())
    }
}

/// One live session
#[derive(Debug)]
pub(crate) struct SessionEntry {
    id: SessionId,
    owner: Principal,
    workspace: PathBuf,
    created_at: DateTime<Utc>,
    last_active: parking_lot::Mutex<Instant>,
    state: Mutex<SessionState>,
}

impl SessionEntry {
    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    /// Run currently in progress, if any
    pub(crate) async fn active_run(&self) -> Option<RunId> {
        self.state.lock().await.active_run
    }

    fn is_idle(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(*self.last_active.lock()) >= ttl
            && self.state.try_lock().is_ok_and(|state| state.active_run.is_none())
    }
}

/// A session removed from the arena whose workspace still exists
#[derive(Debug)]
pub struct DetachedSession {
    entry: Arc<SessionEntry>,
}

impl DetachedSession {
    /// Session identifier
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.entry.id
    }

    /// Workspace directory
    #[must_use]
    pub fn workspace(&self) -> &Path {
        &self.entry.workspace
    }

    /// Run that was in progress when the session was detached
    pub async fn active_run(&self) -> Option<RunId> {
        self.entry.active_run().await
    }
}

/// Session arena
#[derive(Debug)]
pub struct SessionManager {
    root: PathBuf,
    sessions: DashMap<SessionId, Arc<SessionEntry>>,
}

impl SessionManager {
    /// Create manager rooted at `root`
    ///
    /// A relative root is resolved against the current directory so engine
    /// processes, which run inside the workspace, see absolute paths.
    ///
    /// # Errors
    /// `Storage` if the current directory cannot be determined.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let root = root.into();
        let root = if root.is_absolute() {
            root
        } else {
            std::env::current_dir()
                .map_err(|e| CoreError::io(&root, &e))?
                .join(root)
        };
        Ok(Self {
            root,
            sessions: DashMap::new(),
        })
    }

    /// Workspace root
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of live sessions
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Allocate a session and its empty workspace
    ///
    /// # Errors
    /// `Storage` if the random source fails or the directory cannot be created.
    pub async fn create_session(&self, owner: &Principal) -> Result<SessionId, CoreError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| CoreError::io(&self.root, &e))?;

        let id = SessionId::generate()?;
        let workspace = self.root.join(id.as_str());
        // create_dir (not create_dir_all) fails if the directory already exists
        tokio::fs::create_dir(&workspace)
            .await
            .map_err(|e| CoreError::io(&workspace, &e))?;

        let entry = Arc::new(SessionEntry {
            id: id.clone(),
            owner: owner.clone(),
            workspace,
            created_at: Utc::now(),
            last_active: parking_lot::Mutex::new(Instant::now()),
            state: Mutex::new(SessionState {
                status: SessionStatus::Created,
                uploads: BTreeMap::new(),
                active_run: None,
                last_run: None,
            }),
        });
        self.sessions.insert(id.clone(), entry);

        tracing::info!(session = %id, owner = %owner, "session created");
        Ok(id)
    }

    /// Look up a session owned by `principal`
    ///
    /// Sessions owned by someone else are reported as unknown.
    pub(crate) fn entry(
        &self,
        id: &SessionId,
        principal: &Principal,
    ) -> Result<Arc<SessionEntry>, CoreError> {
        let entry = self
            .sessions
            .get(id)
            .map(|e| Arc::clone(e.value()))
            .filter(|e| &e.owner == principal)
            .ok_or_else(|| CoreError::UnknownSession(id.to_string()))?;
        entry.touch();
        Ok(entry)
    }

    /// Workspace directory of a session
    ///
    /// # Errors
    /// `UnknownSession` if the id is not live or not owned by `principal`.
    pub fn get_workspace(&self, id: &SessionId, principal: &Principal) -> Result<PathBuf, CoreError> {
        Ok(self.entry(id, principal)?.workspace.clone())
    }

    /// Point-in-time view of a session
    ///
    /// # Errors
    /// `UnknownSession` if the id is not live or not owned by `principal`.
    pub async fn snapshot(
        &self,
        id: &SessionId,
        principal: &Principal,
    ) -> Result<SessionSnapshot, CoreError> {
        let entry = self.entry(id, principal)?;
        let state = entry.state.lock().await;
        Ok(SessionSnapshot {
            id: entry.id.clone(),
            workspace: entry.workspace.clone(),
            status: state.status,
            uploads: state.uploads.clone(),
            active_run: state.active_run,
            last_run: state.last_run,
            created_at: entry.created_at,
        })
    }

    /// Store a validated upload under its kind's fixed name
    ///
    /// Replaces any earlier upload of the same kind. `is_ready` decides,
    /// from the stored kinds, whether the session becomes `Ready`.
    ///
    /// # Errors
    /// - `UnknownSession` if the session is not live or not owned
    /// - `RunInProgress` while the engine is using the inputs
    /// - `Storage` if the file cannot be written
    pub async fn store_upload(
        &self,
        id: &SessionId,
        principal: &Principal,
        upload: ValidatedUpload,
        is_ready: &(dyn Fn(&[FileKind]) -> bool + Send + Sync),
    ) -> Result<UploadedFile, CoreError> {
        let entry = self.entry(id, principal)?;
        let mut state = entry.state.lock().await;
        if let Some(active) = state.active_run {
            return Err(CoreError::RunInProgress { active });
        }

        let stored_path = entry.workspace.join(upload.kind.stored_name());
        let partial = entry
            .workspace
            .join(format!(".{}.partial", upload.kind.stored_name()));

        tokio::fs::write(&partial, &upload.bytes)
            .await
            .map_err(|e| CoreError::io(&partial, &e))?;
        tokio::fs::rename(&partial, &stored_path)
            .await
            .map_err(|e| CoreError::io(&stored_path, &e))?;

        let file = UploadedFile {
            session_id: entry.id.clone(),
            original_name: upload.original_name,
            stored_path,
            kind: upload.kind,
            byte_size: upload.bytes.len() as u64,
            record_count: upload.record_count,
            validated: true,
            stored_at: Utc::now(),
        };
        let replaced = state.uploads.insert(file.kind, file.clone()).is_some();

        let kinds: Vec<FileKind> = state.uploads.keys().copied().collect();
        let next = if is_ready(&kinds) {
            SessionStatus::Ready
        } else {
            SessionStatus::AwaitingInputs
        };
        state.transition(next)?;

        tracing::info!(
            session = %entry.id,
            kind = %file.kind,
            bytes = file.byte_size,
            records = ?file.record_count,
            replaced,
            status = ?state.status,
            "upload stored"
        );
        Ok(file)
    }

    /// Claim the session for a run
    ///
    /// Checks and sets the run-in-progress marker under one lock, so two
    /// concurrent callers cannot both succeed. Required inputs are checked
    /// before the marker is set.
    ///
    /// # Errors
    /// - `UnknownSession` if the session is not live or not owned
    /// - `RunInProgress` if another run holds the session
    /// - `MissingInput` if any of `required` has not been uploaded
    pub async fn begin_run(
        &self,
        id: &SessionId,
        principal: &Principal,
        run_id: RunId,
        required: &[FileKind],
    ) -> Result<PathBuf, CoreError> {
        let entry = self.entry(id, principal)?;
        let mut state = entry.state.lock().await;

        if let Some(active) = state.active_run {
            return Err(CoreError::RunInProgress { active });
        }

        let missing: Vec<FileKind> = required
            .iter()
            .copied()
            .filter(|kind| !state.uploads.contains_key(kind))
            .collect();
        if !missing.is_empty() {
            return Err(CoreError::MissingInput { missing });
        }

        if matches!(state.status, SessionStatus::Created | SessionStatus::AwaitingInputs) {
            // inputs for this profile are present even if no upload made it Ready
            state.transition(SessionStatus::Ready)?;
        }
        state.transition(SessionStatus::Running)?;
        state.active_run = Some(run_id);
        state.last_run = Some(run_id);
        Ok(entry.workspace.clone())
    }

    /// Release the run marker and record the cycle outcome
    ///
    /// A session torn down while the run was active is ignored.
    pub async fn finish_run(&self, id: &SessionId, run_id: RunId, completed: bool) {
        let Some(entry) = self.sessions.get(id).map(|e| Arc::clone(e.value())) else {
            return;
        };
        let mut state = entry.state.lock().await;
        if state.active_run != Some(run_id) {
            return;
        }
        state.active_run = None;
        let to = if completed {
            SessionStatus::Completed
        } else {
            SessionStatus::Failed
        };
        if let Err(e) = state.transition(to) {
            tracing::warn!(session = %id, error = %e, "unexpected status at run completion");
            state.status = to;
        }
        entry.touch();
    }

    /// Remove a session owned by `principal` from the arena
    ///
    /// The workspace stays on disk until [`SessionManager::release_workspace`].
    /// Unknown or foreign sessions yield `None`.
    #[must_use]
    pub fn detach(&self, id: &SessionId, principal: &Principal) -> Option<DetachedSession> {
        self.sessions
            .remove_if(id, |_, entry| &entry.owner == principal)
            .map(|(_, entry)| DetachedSession { entry })
    }

    /// Remove a session regardless of owner if it is still idle (eviction)
    ///
    /// Idleness is re-checked under the arena lock: a session touched or
    /// handed a run since it was listed stays. A session whose state is
    /// locked right now counts as busy.
    #[must_use]
    pub(crate) fn detach_idle(&self, id: &SessionId, ttl: Duration) -> Option<DetachedSession> {
        let now = Instant::now();
        self.sessions
            .remove_if(id, |_, entry| entry.is_idle(now, ttl))
            .map(|(_, entry)| DetachedSession { entry })
    }

    /// Delete a detached session's workspace and everything in it
    ///
    /// # Errors
    /// `Storage` if the directory exists but cannot be removed.
    pub async fn release_workspace(&self, session: DetachedSession) -> Result<(), CoreError> {
        let workspace = session.workspace();
        match tokio::fs::remove_dir_all(workspace).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CoreError::io(workspace, &e)),
        }
        tracing::info!(session = %session.id(), "session torn down");
        Ok(())
    }

    /// Tear down a session and its workspace
    ///
    /// Idempotent: unknown or already removed sessions are a no-op.
    ///
    /// # Errors
    /// `Storage` if the workspace cannot be removed.
    pub async fn teardown(&self, id: &SessionId, principal: &Principal) -> Result<(), CoreError> {
        match self.detach(id, principal) {
            Some(session) => self.release_workspace(session).await,
            None => Ok(()),
        }
    }

    /// Sessions idle for at least `ttl` with no active run
    pub async fn idle_sessions(&self, ttl: Duration) -> Vec<SessionId> {
        let now = Instant::now();
        let candidates: Vec<Arc<SessionEntry>> = self
            .sessions
            .iter()
            .filter(|e| now.saturating_duration_since(*e.last_active.lock()) >= ttl)
            .map(|e| Arc::clone(e.value()))
            .collect();

        let mut idle = Vec::with_capacity(candidates.len());
        for entry in candidates {
            if entry.active_run().await.is_none() {
                idle.push(entry.id.clone());
            }
        }
        idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cahs_intake::Compression;

    fn upload(kind: FileKind, bytes: &[u8]) -> ValidatedUpload {
        ValidatedUpload {
            original_name: format!("input.{}", kind.extensions()[0]),
            kind,
            compression: Compression::None,
            mime_type: String::new(),
            bytes: bytes.to_vec(),
            record_count: None,
        }
    }

    fn never_ready(_: &[FileKind]) -> bool {
        false
    }

    fn needs_reads(kinds: &[FileKind]) -> bool {
        kinds.contains(&FileKind::ReadSet)
    }

    #[tokio::test]
    async fn workspaces_are_distinct_and_empty() {
        let root = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(root.path()).unwrap();
        let alice = Principal::new("alice");

        let a = manager.create_session(&alice).await.unwrap();
        let b = manager.create_session(&alice).await.unwrap();
        let wa = manager.get_workspace(&a, &alice).unwrap();
        let wb = manager.get_workspace(&b, &alice).unwrap();

        assert_ne!(wa, wb);
        assert_eq!(wa, root.path().join(a.as_str()));
        assert_eq!(std::fs::read_dir(&wa).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn foreign_sessions_are_unknown() {
        let root = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(root.path()).unwrap();
        let id = manager.create_session(&Principal::new("alice")).await.unwrap();

        let err = manager.get_workspace(&id, &Principal::new("mallory")).unwrap_err();
        assert!(matches!(err, CoreError::UnknownSession(_)));

        // a foreign teardown is a silent no-op
        manager.teardown(&id, &Principal::new("mallory")).await.unwrap();
        assert!(manager.get_workspace(&id, &Principal::new("alice")).is_ok());
    }

    #[tokio::test]
    async fn upload_overwrites_same_kind() {
        let root = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(root.path()).unwrap();
        let p = Principal::new("p");
        let id = manager.create_session(&p).await.unwrap();

        manager
            .store_upload(&id, &p, upload(FileKind::ReadSet, b"first"), &never_ready)
            .await
            .unwrap();
        let second = manager
            .store_upload(&id, &p, upload(FileKind::ReadSet, b"second"), &never_ready)
            .await
            .unwrap();

        let ws = manager.get_workspace(&id, &p).unwrap();
        assert_eq!(std::fs::read(&second.stored_path).unwrap(), b"second");
        // only the stored file remains, no partial leftovers
        assert_eq!(std::fs::read_dir(&ws).unwrap().count(), 1);

        let snap = manager.snapshot(&id, &p).await.unwrap();
        assert_eq!(snap.uploads.len(), 1);
        assert_eq!(snap.status, SessionStatus::AwaitingInputs);
    }

    #[tokio::test]
    async fn readiness_follows_predicate() {
        let root = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(root.path()).unwrap();
        let p = Principal::new("p");
        let id = manager.create_session(&p).await.unwrap();

        manager
            .store_upload(&id, &p, upload(FileKind::ReadSet, b"@r\nA\n+\nI\n"), &needs_reads)
            .await
            .unwrap();
        assert_eq!(manager.snapshot(&id, &p).await.unwrap().status, SessionStatus::Ready);
    }

    #[tokio::test]
    async fn begin_run_is_check_and_set() {
        let root = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(root.path()).unwrap();
        let p = Principal::new("p");
        let id = manager.create_session(&p).await.unwrap();
        manager
            .store_upload(&id, &p, upload(FileKind::ReadSet, b"x"), &needs_reads)
            .await
            .unwrap();

        let first = RunId::new();
        manager.begin_run(&id, &p, first, &[FileKind::ReadSet]).await.unwrap();
        let err = manager
            .begin_run(&id, &p, RunId::new(), &[FileKind::ReadSet])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::RunInProgress { active } if active == first));

        // uploads are refused while the engine holds the inputs
        let err = manager
            .store_upload(&id, &p, upload(FileKind::ReadSet, b"y"), &needs_reads)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::RunInProgress { .. }));

        manager.finish_run(&id, first, true).await;
        let snap = manager.snapshot(&id, &p).await.unwrap();
        assert_eq!(snap.status, SessionStatus::Completed);
        assert_eq!(snap.active_run, None);
        manager.begin_run(&id, &p, RunId::new(), &[FileKind::ReadSet]).await.unwrap();
    }

    #[tokio::test]
    async fn begin_run_reports_missing_inputs() {
        let root = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(root.path()).unwrap();
        let p = Principal::new("p");
        let id = manager.create_session(&p).await.unwrap();
        manager
            .store_upload(&id, &p, upload(FileKind::ReadSet, b"x"), &never_ready)
            .await
            .unwrap();

        let err = manager
            .begin_run(&id, &p, RunId::new(), &[FileKind::Reference, FileKind::Alignment])
            .await
            .unwrap_err();
        match err {
            CoreError::MissingInput { missing } => {
                assert_eq!(missing, vec![FileKind::Reference, FileKind::Alignment]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(manager.snapshot(&id, &p).await.unwrap().active_run, None);
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(root.path()).unwrap();
        let p = Principal::new("p");
        let id = manager.create_session(&p).await.unwrap();
        let ws = manager.get_workspace(&id, &p).unwrap();

        manager.teardown(&id, &p).await.unwrap();
        manager.teardown(&id, &p).await.unwrap();

        assert!(!ws.exists());
        assert!(matches!(
            manager.get_workspace(&id, &p),
            Err(CoreError::UnknownSession(_))
        ));
        assert!(manager.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_respect_ttl_and_active_runs() {
        let root = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(root.path()).unwrap();
        let p = Principal::new("p");
        let idle = manager.create_session(&p).await.unwrap();
        let busy = manager.create_session(&p).await.unwrap();
        manager
            .store_upload(&busy, &p, upload(FileKind::ReadSet, b"x"), &needs_reads)
            .await
            .unwrap();
        manager.begin_run(&busy, &p, RunId::new(), &[]).await.unwrap();

        assert!(manager.idle_sessions(Duration::from_secs(60)).await.is_empty());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(manager.idle_sessions(Duration::from_secs(60)).await, vec![idle]);
    }

    #[tokio::test(start_paused = true)]
    async fn detach_idle_rechecks_after_listing() {
        let root = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(root.path()).unwrap();
        let p = Principal::new("p");
        let ttl = Duration::from_secs(60);
        let started = manager.create_session(&p).await.unwrap();
        let touched = manager.create_session(&p).await.unwrap();
        let untouched = manager.create_session(&p).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        let listed = manager.idle_sessions(ttl).await;
        assert_eq!(listed.len(), 3);

        // activity between listing and eviction
        manager.begin_run(&started, &p, RunId::new(), &[]).await.unwrap();
        manager.get_workspace(&touched, &p).unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(manager.detach_idle(&started, ttl).is_none());
        assert!(manager.detach_idle(&touched, Duration::from_secs(120)).is_none());
        let evicted = manager.detach_idle(&untouched, ttl).unwrap();
        assert_eq!(evicted.id(), &untouched);

        assert!(manager.get_workspace(&started, &p).is_ok());
        assert!(manager.get_workspace(&touched, &p).is_ok());
        assert_eq!(manager.len(), 2);
    }
}
