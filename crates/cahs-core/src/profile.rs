//! Engine profiles
//!
//! A profile is a named engine command taken from configuration:
//!
//! ```toml
//! [profiles.snp]
//! program = "nextflow"
//! args = ["run", "/opt/pipelines/snp.nf", "--fna", "{reference}",
//!         "--bam", "{alignment}", "--outdir", "{outdir}"]
//! expects = "variant_calls"
//! ```
//!
//! Literal arguments are trusted configuration. Placeholders resolve only to
//! paths inside the session workspace:
//! - `{reference}`, `{alignment}`, `{reads}`: stored input files
//! - `{outdir}`: the engine output directory
//! - `{workspace}`: the workspace itself
//!
//! The inputs a profile requires are exactly the input placeholders it uses.

use crate::error::CoreError;
use crate::types::ArtifactKind;
use cahs_intake::FileKind;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configured engine command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineProfile {
    /// Engine binary name or path
    pub program: String,
    /// Argument template
    #[serde(default)]
    pub args: Vec<String>,
    /// Artifact kind the engine produces
    pub expects: ArtifactKind,
}

/// Slot in an argument template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    /// Stored input of the given kind
    Input(FileKind),
    /// Engine output directory
    OutDir,
    /// Workspace root
    Workspace,
}

impl Placeholder {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "outdir" => Some(Self::OutDir),
            "workspace" => Some(Self::Workspace),
            other => other.parse::<FileKind>().ok().map(Self::Input),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Slot(Placeholder),
}

/// Split one template argument into literal text and placeholders
fn segments(arg: &str) -> Result<Vec<Segment<'_>>, String> {
    let mut out = Vec::new();
    let mut rest = arg;

    while let Some(open) = rest.find('{') {
        if open > 0 {
            out.push(Segment::Literal(&rest[..open]));
        }
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| format!("unterminated placeholder in '{arg}'"))?;
        let name = &after[..close];
        let slot = Placeholder::parse(name)
            .ok_or_else(|| format!("unknown placeholder '{{{name}}}' in '{arg}'"))?;
        out.push(Segment::Slot(slot));
        rest = &after[close + 1..];
    }
    if !rest.is_empty() {
        out.push(Segment::Literal(rest));
    }
    Ok(out)
}

impl EngineProfile {
    /// Create profile
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>, expects: ArtifactKind) -> Self {
        Self {
            program: program.into(),
            args,
            expects,
        }
    }

    /// Check the profile is usable
    ///
    /// # Errors
    /// `Config` if the program is empty or a placeholder is malformed.
    pub fn validate(&self, name: &str) -> Result<(), CoreError> {
        if self.program.trim().is_empty() {
            return Err(CoreError::Config(format!("profile '{name}' has an empty program")));
        }
        for arg in &self.args {
            segments(arg).map_err(|e| CoreError::Config(format!("profile '{name}': {e}")))?;
        }
        Ok(())
    }

    /// Input kinds referenced by the template, in table order
    #[must_use]
    pub fn required_inputs(&self) -> Vec<FileKind> {
        let mut kinds: Vec<FileKind> = self
            .args
            .iter()
            .filter_map(|arg| segments(arg).ok())
            .flatten()
            .filter_map(|seg| match seg {
                Segment::Slot(Placeholder::Input(kind)) => Some(kind),
                _ => None,
            })
            .collect();
        kinds.sort_unstable();
        kinds.dedup();
        kinds
    }

    /// Resolve the template against a workspace
    ///
    /// # Errors
    /// `Config` for malformed templates, `Storage` if a workspace path is not
    /// valid UTF-8.
    pub fn resolve(&self, workspace: &Path, output_dir: &Path) -> Result<Vec<String>, CoreError> {
        let path_str = |path: &Path| -> Result<String, CoreError> {
            path.to_str()
                .map(str::to_string)
                .ok_or_else(|| CoreError::storage(format!("{} is not valid UTF-8", path.display())))
        };

        self.args
            .iter()
            .map(|arg| {
                let mut resolved = String::new();
                for seg in segments(arg).map_err(CoreError::Config)? {
                    match seg {
                        Segment::Literal(text) => resolved.push_str(text),
                        Segment::Slot(Placeholder::Input(kind)) => {
                            resolved.push_str(&path_str(&workspace.join(kind.stored_name()))?);
                        }
                        Segment::Slot(Placeholder::OutDir) => resolved.push_str(&path_str(output_dir)?),
                        Segment::Slot(Placeholder::Workspace) => resolved.push_str(&path_str(workspace)?),
                    }
                }
                Ok(resolved)
            })
            .collect()
    }
}
