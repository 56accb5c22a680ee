//! Error types for upload intake
//!
//! Every variant is recoverable: the caller reports it back to the
//! client and the session stays usable.

/// Errors raised while decoding, classifying or validating an upload
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    /// Transport encoding or compression stream is malformed
    #[error("decode error: {0}")]
    Decode(String),

    /// Filename does not map to a recognized input kind
    #[error("unsupported format: '{filename}'")]
    UnsupportedFormat { filename: String },

    /// Record-structured file contained no records
    #[error("no sequence records found in '{filename}'")]
    EmptyFile { filename: String },

    /// Record structure is malformed
    #[error("parse error in '{filename}' at record {record}: {message}")]
    Parse {
        filename: String,
        /// 1-based index of the offending record
        record: usize,
        message: String,
    },

    /// Payload exceeds the configured size limit
    #[error("payload too large: more than {limit} bytes")]
    TooLarge { limit: u64 },
}

impl IntakeError {
    /// Create decode error
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    /// Create parse error for the 1-based `record`
    pub fn parse(filename: impl Into<String>, record: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            filename: filename.into(),
            record,
            message: message.into(),
        }
    }

    /// Short machine-readable code, stable across releases
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Decode(_) => "DecodeError",
            Self::UnsupportedFormat { .. } => "UnsupportedFormat",
            Self::EmptyFile { .. } => "EmptyFile",
            Self::Parse { .. } => "ParseError",
            Self::TooLarge { .. } => "TooLarge",
        }
    }
}
