//! Result locator
//!
//! Finds the artifact an engine left in a session workspace. Engines name
//! their outputs freely, so lookup is by suffix:
//!
//! 1. regular files directly in the workspace
//! 2. if none match, regular files in the output subdirectory
//!
//! Within one directory the lexicographically smallest name wins, so the
//! same workspace always yields the same artifact. Hidden files, partial
//! writes and symlinks are never candidates.

use crate::error::CoreError;
use crate::types::{ArtifactKind, ResultArtifact, SessionId};
use cahs_intake::FileKind;
use chrono::Utc;
use std::path::{Path, PathBuf};

/// Locates result artifacts inside a workspace
#[derive(Debug, Clone)]
pub struct ResultLocator {
    output_subdir: String,
}

impl ResultLocator {
    /// Create locator that also searches `output_subdir`
    #[must_use]
    pub fn new(output_subdir: impl Into<String>) -> Self {
        Self {
            output_subdir: output_subdir.into(),
        }
    }

    /// Engine output directory for a workspace
    #[must_use]
    pub fn output_dir(&self, workspace: &Path) -> PathBuf {
        workspace.join(&self.output_subdir)
    }

    /// Find the artifact of `kind` in `workspace`
    ///
    /// # Errors
    /// - `ArtifactNotFound` if no candidate matches
    /// - `Storage` if the workspace cannot be listed
    pub async fn locate(
        &self,
        session_id: &SessionId,
        workspace: &Path,
        kind: ArtifactKind,
    ) -> Result<ResultArtifact, CoreError> {
        for dir in [workspace.to_path_buf(), self.output_dir(workspace)] {
            let mut names = candidates(&dir).await?;
            names.retain(|name| kind.matches(name));
            names.sort_unstable();

            if let Some(first) = names.into_iter().next() {
                let path = dir.join(first);
                tracing::debug!(session = %session_id, path = %path.display(), %kind, "artifact located");
                return Ok(ResultArtifact {
                    session_id: session_id.clone(),
                    path,
                    kind,
                    discovered_at: Utc::now(),
                });
            }
        }
        Err(CoreError::ArtifactNotFound { kind })
    }

    /// Remove artifacts left by an earlier run and recreate an empty output directory
    ///
    /// Stored inputs are never touched: their fixed names carry no artifact suffix.
    ///
    /// # Errors
    /// `Storage` if a file or the output directory cannot be removed or created.
    pub async fn clear_previous(&self, workspace: &Path) -> Result<(), CoreError> {
        let output_dir = self.output_dir(workspace);
        match tokio::fs::remove_dir_all(&output_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CoreError::io(&output_dir, &e)),
        }

        let inputs: Vec<&str> = FileKind::ALL.iter().map(|k| k.stored_name()).collect();
        for name in candidates(workspace).await? {
            let stale = !inputs.contains(&name.as_str())
                && ArtifactKind::ALL.iter().any(|kind| kind.matches(&name));
            if stale {
                let path = workspace.join(&name);
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|e| CoreError::io(&path, &e))?;
            }
        }

        tokio::fs::create_dir(&output_dir)
            .await
            .map_err(|e| CoreError::io(&output_dir, &e))
    }
}

/// Names of visible regular files directly in `dir`
///
/// A missing directory has no candidates.
async fn candidates(dir: &Path) -> Result<Vec<String>, CoreError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CoreError::io(dir, &e)),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| CoreError::io(dir, &e))? {
        // file_type does not follow symlinks
        let is_file = entry.file_type().await.is_ok_and(|t| t.is_file());
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if is_file && !name.starts_with('.') && !name.ends_with(".partial") {
            names.push(name);
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn session() -> SessionId {
        SessionId::generate().unwrap()
    }

    #[tokio::test]
    async fn lexicographic_tie_break_is_stable() {
        let ws = tempfile::tempdir().unwrap();
        fs::write(ws.path().join("b.vcf"), "b").unwrap();
        fs::write(ws.path().join("a.vcf"), "a").unwrap();
        let locator = ResultLocator::new("results");
        let id = session();

        for _ in 0..3 {
            let found = locator
                .locate(&id, ws.path(), ArtifactKind::VariantCalls)
                .await
                .unwrap();
            assert_eq!(found.file_name(), "a.vcf");
        }
    }

    #[tokio::test]
    async fn top_level_wins_over_output_dir() {
        let ws = tempfile::tempdir().unwrap();
        fs::create_dir(ws.path().join("results")).unwrap();
        fs::write(ws.path().join("results/a.zip"), "x").unwrap();
        fs::write(ws.path().join("z.zip"), "x").unwrap();

        let found = ResultLocator::new("results")
            .locate(&session(), ws.path(), ArtifactKind::Archive)
            .await
            .unwrap();
        assert_eq!(found.path, ws.path().join("z.zip"));
    }

    #[tokio::test]
    async fn falls_back_to_output_dir() {
        let ws = tempfile::tempdir().unwrap();
        fs::create_dir(ws.path().join("results")).unwrap();
        fs::write(ws.path().join("results/plot.png"), "x").unwrap();

        let found = ResultLocator::new("results")
            .locate(&session(), ws.path(), ArtifactKind::Image)
            .await
            .unwrap();
        assert_eq!(found.path, ws.path().join("results/plot.png"));
        assert_eq!(found.kind, ArtifactKind::Image);
    }

    #[tokio::test]
    async fn ignores_hidden_partial_and_other_kinds() {
        let ws = tempfile::tempdir().unwrap();
        fs::write(ws.path().join(".hidden.vcf"), "x").unwrap();
        fs::write(ws.path().join("calls.vcf.partial"), "x").unwrap();
        fs::write(ws.path().join("report.pdf"), "x").unwrap();
        fs::create_dir(ws.path().join("dir.vcf")).unwrap();

        let err = ResultLocator::new("results")
            .locate(&session(), ws.path(), ArtifactKind::VariantCalls)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ArtifactNotFound { kind: ArtifactKind::VariantCalls }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn skips_symlinks() {
        let ws = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret.vcf"), "x").unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret.vcf"), ws.path().join("a.vcf"))
            .unwrap();

        let result = ResultLocator::new("results")
            .locate(&session(), ws.path(), ArtifactKind::VariantCalls)
            .await;
        assert!(matches!(result, Err(CoreError::ArtifactNotFound { .. })));
    }

    #[tokio::test]
    async fn clear_previous_keeps_inputs() {
        let ws = tempfile::tempdir().unwrap();
        fs::write(ws.path().join("reads.fastq"), "@r\nA\n+\nI\n").unwrap();
        fs::write(ws.path().join("old.vcf"), "x").unwrap();
        fs::create_dir(ws.path().join("results")).unwrap();
        fs::write(ws.path().join("results/old.zip"), "x").unwrap();

        let locator = ResultLocator::new("results");
        locator.clear_previous(ws.path()).await.unwrap();

        assert!(ws.path().join("reads.fastq").exists());
        assert!(!ws.path().join("old.vcf").exists());
        assert!(ws.path().join("results").is_dir());
        assert_eq!(fs::read_dir(ws.path().join("results")).unwrap().count(), 0);
    }
}
