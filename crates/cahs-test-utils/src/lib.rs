//! Testing utilities for CAHS workspace
//!
//! Shared fixtures: sequence files, encoded payloads, shell-based fake
//! engines and a throwaway orchestrator rooted in a temp directory.

#![allow(missing_docs)]

use cahs_core::{ArtifactKind, EngineProfile, Orchestrator, OrchestratorConfig, Principal, SessionId};
use cahs_intake::{encode_payload, FileKind};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// FASTQ text with `records` four-line records
pub fn fastq(records: usize) -> String {
    (0..records)
        .map(|i| format!("@read{i}\nACGTACGT\n+\nIIIIIIII\n"))
        .collect()
}

/// FASTA text with `records` records, sequences wrapped over two lines
pub fn fasta(records: usize) -> String {
    (0..records)
        .map(|i| format!(">contig{i} test sequence\nACGTNNACGT\nTTGCA\n"))
        .collect()
}

/// Minimal BAM-looking binary blob
pub fn bam() -> Vec<u8> {
    let mut bytes = b"BAM\x01".to_vec();
    bytes.extend_from_slice(&[0u8, 1, 2, 3, 255, 254]);
    bytes
}

/// Gzip-compress `bytes`
pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

/// Encode `bytes` in the upload transport form
pub fn encoded(bytes: &[u8]) -> String {
    encode_payload("application/octet-stream", bytes)
}

/// Fake engine running `script` under `sh -c`
///
/// Each of `inputs` is passed as a positional argument (`$1`, `$2`, ...)
/// resolved to its stored path; the output directory is always the last
/// argument.
pub fn sh_profile(script: &str, inputs: &[FileKind], expects: ArtifactKind) -> EngineProfile {
    let mut args = vec!["-c".to_string(), script.to_string(), "engine".to_string()];
    args.extend(inputs.iter().map(|kind| format!("{{{}}}", kind.as_str())));
    args.push("{outdir}".to_string());
    EngineProfile::new("sh", args, expects)
}

/// Orchestrator over a private temp directory
pub struct TestBed {
    root: TempDir,
    pub orchestrator: Orchestrator,
    pub principal: Principal,
}

impl TestBed {
    /// Build with the given profiles and default settings
    pub fn new(profiles: impl IntoIterator<Item = (&'static str, EngineProfile)>) -> Self {
        Self::with_config(profiles, |config| config)
    }

    /// Build with the given profiles and a config tweak
    pub fn with_config(
        profiles: impl IntoIterator<Item = (&'static str, EngineProfile)>,
        tweak: impl FnOnce(OrchestratorConfig) -> OrchestratorConfig,
    ) -> Self {
        let root = tempfile::tempdir().unwrap();
        let mut config = OrchestratorConfig::new()
            .with_workspace_root(root.path())
            .with_run_timeout(Duration::from_secs(30));
        for (name, profile) in profiles {
            config = config.with_profile(name, profile);
        }
        let orchestrator = Orchestrator::new(tweak(config)).unwrap();
        Self {
            root,
            orchestrator,
            principal: Principal::new("tester"),
        }
    }

    /// Workspace root
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Create a session owned by the test principal
    pub async fn session(&self) -> SessionId {
        self.orchestrator.create_session(&self.principal).await.unwrap()
    }

    /// Workspace of a session owned by the test principal
    pub fn workspace(&self, session: &SessionId) -> PathBuf {
        self.orchestrator
            .get_workspace(&self.principal, session)
            .unwrap()
    }

    /// Upload raw bytes under `filename`
    pub async fn upload(&self, session: &SessionId, filename: &str, bytes: &[u8]) {
        self.orchestrator
            .ingest(&self.principal, session, filename, &encoded(bytes))
            .await
            .unwrap();
    }

    /// Upload a reference, an alignment and a read set
    pub async fn upload_all(&self, session: &SessionId) {
        self.upload(session, "ref.fna", fasta(2).as_bytes()).await;
        self.upload(session, "sample.bam", &bam()).await;
        self.upload(session, "sample.fastq", fastq(3).as_bytes()).await;
    }
}
