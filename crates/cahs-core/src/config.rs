//! Orchestrator configuration
//!
//! Loaded from TOML; every field has a default so a file only needs the
//! engine profiles it wants.

use crate::error::CoreError;
use crate::profile::EngineProfile;
use cahs_intake::IntakeLimits;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Directory under which per-session workspaces are created
    pub workspace_root: PathBuf,
    /// Upper bound on one engine run in seconds (0 disables)
    pub run_timeout_secs: u64,
    /// Idle time after which a session is evicted, in seconds
    pub session_ttl_secs: u64,
    /// Interval of the background eviction sweep, in seconds
    pub sweep_interval_secs: u64,
    /// Workspace subdirectory passed to engines as `{outdir}`
    pub output_subdir: String,
    /// Upload size limits
    pub intake: IntakeLimits,
    /// Engine profiles by name
    pub profiles: BTreeMap<String, EngineProfile>,
}

impl OrchestratorConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate TOML text
    ///
    /// # Errors
    /// `Config` on syntax errors or invalid values.
    pub fn from_toml_str(text: &str) -> Result<Self, CoreError> {
        let config: Self =
            toml::from_str(text).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    ///
    /// # Errors
    /// `Config` if the file cannot be read or is invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Check invariants not expressible in the type
    ///
    /// # Errors
    /// `Config` describing the first problem found.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut components = Path::new(&self.output_subdir).components();
        let single_normal = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !single_normal {
            return Err(CoreError::Config(format!(
                "output_subdir must be a single directory name, got '{}'",
                self.output_subdir
            )));
        }
        if self.sweep_interval_secs == 0 {
            return Err(CoreError::Config("sweep_interval_secs must be positive".into()));
        }
        for (name, profile) in &self.profiles {
            profile.validate(name)?;
        }
        Ok(())
    }

    /// With workspace root
    #[inline]
    #[must_use]
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    /// With run timeout (zero disables)
    #[inline]
    #[must_use]
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout_secs = timeout.as_secs();
        self
    }

    /// With session idle TTL
    #[inline]
    #[must_use]
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl_secs = ttl.as_secs();
        self
    }

    /// With intake limits
    #[inline]
    #[must_use]
    pub fn with_intake_limits(mut self, limits: IntakeLimits) -> Self {
        self.intake = limits;
        self
    }

    /// With an engine profile
    #[inline]
    #[must_use]
    pub fn with_profile(mut self, name: impl Into<String>, profile: EngineProfile) -> Self {
        self.profiles.insert(name.into(), profile);
        self
    }

    /// Run timeout, if enabled
    #[inline]
    #[must_use]
    pub fn run_timeout(&self) -> Option<Duration> {
        (self.run_timeout_secs > 0).then(|| Duration::from_secs(self.run_timeout_secs))
    }

    /// Session idle TTL
    #[inline]
    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Eviction sweep interval
    #[inline]
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("cahs-workspaces"),
            run_timeout_secs: 3600,
            session_ttl_secs: 3600,
            sweep_interval_secs: 60,
            output_subdir: "results".to_string(),
            intake: IntakeLimits::default(),
            profiles: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ArtifactKind;

    #[test]
    fn parses_profiles_and_defaults() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            workspace_root = "/srv/cahs"
            run_timeout_secs = 120

            [intake]
            max_payload_bytes = 1024

            [profiles.bacteria]
            program = "nextflow"
            args = ["run", "/opt/bacteria.nf", "--reads", "{reads}", "--outdir", "{outdir}"]
            expects = "archive"
            "#,
        )
        .unwrap();

        assert_eq!(config.workspace_root, PathBuf::from("/srv/cahs"));
        assert_eq!(config.run_timeout(), Some(Duration::from_secs(120)));
        assert_eq!(config.session_ttl_secs, 3600);
        assert_eq!(config.output_subdir, "results");
        assert_eq!(config.intake.max_payload_bytes, 1024);
        assert_eq!(
            config.intake.max_decompressed_bytes,
            IntakeLimits::default().max_decompressed_bytes
        );
        assert_eq!(config.profiles["bacteria"].expects, ArtifactKind::Archive);
    }

    #[test]
    fn zero_timeout_disables() {
        let config = OrchestratorConfig::new().with_run_timeout(Duration::ZERO);
        assert_eq!(config.run_timeout(), None);
    }

    #[test]
    fn rejects_unknown_artifact_kind() {
        let err = OrchestratorConfig::from_toml_str(
            r#"
            [profiles.x]
            program = "engine"
            expects = "spreadsheet"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[test]
    fn rejects_nested_output_subdir() {
        for bad in ["../out", "a/b", "", "/abs"] {
            let config = OrchestratorConfig {
                output_subdir: bad.to_string(),
                ..OrchestratorConfig::default()
            };
            assert!(config.validate().is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn rejects_bad_placeholder_in_profile() {
        let err = OrchestratorConfig::from_toml_str(
            r#"
            [profiles.x]
            program = "engine"
            args = ["{etc}"]
            expects = "image"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown placeholder"));
    }
}
