//! Download dispatcher
//!
//! Turns a located artifact into a byte stream plus the metadata a
//! transport needs (file name, content type, length). The bytes are served
//! exactly as the engine wrote them.

use crate::error::CoreError;
use crate::types::ResultArtifact;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// An artifact opened for delivery
#[derive(Debug)]
pub struct Delivery {
    /// Download file name hint
    pub filename: String,
    /// Content type hint
    pub content_type: &'static str,
    /// Size in bytes at open time
    pub content_length: u64,
    /// Open file handle
    pub reader: File,
}

impl Delivery {
    /// Read the whole artifact into memory
    ///
    /// # Errors
    /// `Storage` if reading fails part way.
    pub async fn into_bytes(mut self) -> Result<Vec<u8>, CoreError> {
        let mut bytes = Vec::with_capacity(usize::try_from(self.content_length).unwrap_or(0));
        self.reader
            .read_to_end(&mut bytes)
            .await
            .map_err(|e| CoreError::io(&self.filename, &e))?;
        Ok(bytes)
    }

    /// Read the whole artifact and its SHA-256 digest (lowercase hex)
    ///
    /// # Errors
    /// `Storage` if reading fails part way.
    pub async fn into_bytes_with_digest(self) -> Result<(Vec<u8>, String), CoreError> {
        let bytes = self.into_bytes().await?;
        let digest = hex::encode(Sha256::digest(&bytes));
        Ok((bytes, digest))
    }
}

/// Serves located artifacts
#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadDispatcher;

impl DownloadDispatcher {
    /// Create dispatcher
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Open `artifact` for delivery
    ///
    /// # Errors
    /// `ArtifactUnreadable` if the file vanished or cannot be opened since
    /// it was located. The caller may locate again and retry.
    pub async fn serve(&self, artifact: &ResultArtifact) -> Result<Delivery, CoreError> {
        let unreadable = |source| CoreError::ArtifactUnreadable {
            path: artifact.path.clone(),
            source,
        };

        let reader = File::open(&artifact.path).await.map_err(unreadable)?;
        let metadata = reader.metadata().await.map_err(unreadable)?;
        if !metadata.is_file() {
            return Err(unreadable(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "not a regular file",
            )));
        }

        let filename = artifact.file_name();
        let content_type = artifact.kind.content_type(&filename);
        tracing::debug!(
            session = %artifact.session_id,
            file = %filename,
            bytes = metadata.len(),
            "serving artifact"
        );
        Ok(Delivery {
            filename,
            content_type,
            content_length: metadata.len(),
            reader,
        })
    }
}
