//! Upload validation pipeline
//!
//! classify filename → decode transport → decompress → validate records.
//! The filename is classified before the body is decoded so unsupported
//! uploads are rejected without touching the payload.

use crate::error::IntakeError;
use crate::kind::{classify, Compression, FileKind};
use crate::payload::{decode_payload, gunzip};
use crate::records::parser_for;
use serde::{Deserialize, Serialize};

/// Size limits applied during intake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeLimits {
    /// Maximum decoded payload size in bytes
    pub max_payload_bytes: u64,
    /// Maximum size after decompression in bytes
    pub max_decompressed_bytes: u64,
}

impl Default for IntakeLimits {
    fn default() -> Self {
        Self {
            max_payload_bytes: 512 * 1024 * 1024,
            max_decompressed_bytes: 2 * 1024 * 1024 * 1024,
        }
    }
}

/// An upload that passed every intake check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedUpload {
    /// Client-supplied filename
    pub original_name: String,
    /// Logical kind
    pub kind: FileKind,
    /// Compression the client applied
    pub compression: Compression,
    /// Declared MIME type
    pub mime_type: String,
    /// Final (decompressed) bytes to store
    pub bytes: Vec<u8>,
    /// Record count for record-structured kinds
    pub record_count: Option<usize>,
}

/// Upload validator
#[derive(Debug, Clone, Default)]
pub struct Validator {
    limits: IntakeLimits,
}

impl Validator {
    /// Create validator with limits
    #[inline]
    #[must_use]
    pub fn new(limits: IntakeLimits) -> Self {
        Self { limits }
    }

    /// Configured limits
    #[inline]
    #[must_use]
    pub fn limits(&self) -> IntakeLimits {
        self.limits
    }

    /// Validate an encoded upload
    ///
    /// # Errors
    /// `UnsupportedFormat`, `Decode`, `TooLarge`, `EmptyFile` or `Parse`
    /// depending on which stage rejects the input.
    pub fn validate(&self, filename: &str, encoded: &str) -> Result<ValidatedUpload, IntakeError> {
        let classification = classify(filename)?;
        let decoded = decode_payload(encoded, self.limits.max_payload_bytes)?;

        let bytes = match classification.compression {
            Compression::None => decoded.bytes,
            Compression::Gzip => gunzip(&decoded.bytes, self.limits.max_decompressed_bytes)?,
        };

        let record_count = self.check_structure(filename, classification.kind, &bytes)?;

        tracing::debug!(
            filename,
            kind = %classification.kind,
            bytes = bytes.len(),
            records = ?record_count,
            "upload validated"
        );

        Ok(ValidatedUpload {
            original_name: filename.to_string(),
            kind: classification.kind,
            compression: classification.compression,
            mime_type: decoded.mime_type,
            bytes,
            record_count,
        })
    }

    /// Validate structure and return the record count, if the kind has records
    fn check_structure(
        &self,
        filename: &str,
        kind: FileKind,
        bytes: &[u8],
    ) -> Result<Option<usize>, IntakeError> {
        let empty = || IntakeError::EmptyFile {
            filename: filename.to_string(),
        };

        let Some(format) = kind.record_format() else {
            // Binary kinds: only emptiness is checked
            return if bytes.is_empty() { Err(empty()) } else { Ok(None) };
        };

        let records = parser_for(format).parse(filename, bytes)?;
        if records.is_empty() {
            return Err(empty());
        }
        Ok(Some(records.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::encode_payload;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), flate2::Compression::fast());
        enc.write_all(bytes).unwrap();
        enc.finish().unwrap()
    }

    const READS: &[u8] = b"@r1\nACGT\n+\nIIII\n@r2\nACGT\n+\nIIII\n@r3\nACGT\n+\nIIII\n";

    #[test]
    fn gzipped_fastq_is_decompressed_and_counted() {
        let encoded = encode_payload("application/gzip", &gzip(READS));
        let upload = Validator::default().validate("sample.fastq.gz", &encoded).unwrap();

        assert_eq!(upload.kind, FileKind::ReadSet);
        assert_eq!(upload.compression, Compression::Gzip);
        assert_eq!(upload.record_count, Some(3));
        assert_eq!(upload.bytes, READS);
    }

    #[test]
    fn zero_record_fastq_is_empty_file() {
        let encoded = encode_payload("", b"\n");
        let err = Validator::default().validate("reads.fastq", &encoded).unwrap_err();
        assert!(matches!(err, IntakeError::EmptyFile { .. }));
    }

    #[test]
    fn unsupported_name_rejected_before_decoding() {
        // body is not valid base64, but classification fails first
        let err = Validator::default()
            .validate("table.csv", "data:;base64,%%%")
            .unwrap_err();
        assert!(matches!(err, IntakeError::UnsupportedFormat { .. }));
    }

    #[test]
    fn bam_is_accepted_without_record_parsing() {
        let encoded = encode_payload("application/octet-stream", b"BAM\x01\x00\x00");
        let upload = Validator::default().validate("sample.bam", &encoded).unwrap();
        assert_eq!(upload.kind, FileKind::Alignment);
        assert_eq!(upload.record_count, None);
    }

    #[test]
    fn empty_bam_is_rejected() {
        let encoded = encode_payload("", b"");
        assert!(matches!(
            Validator::default().validate("sample.bam", &encoded),
            Err(IntakeError::EmptyFile { .. })
        ));
    }

    #[test]
    fn non_utf8_fasta_is_parse_error() {
        let encoded = encode_payload("", b">a\nAC\n\xff\xfe\n");
        let err = Validator::default().validate("ref.fa", &encoded).unwrap_err();
        assert!(matches!(err, IntakeError::Parse { record: 1, .. }));
    }

    #[test]
    fn decompression_limit_applies() {
        let limits = IntakeLimits {
            max_payload_bytes: 1 << 20,
            max_decompressed_bytes: 8,
        };
        let encoded = encode_payload("", &gzip(READS));
        assert!(matches!(
            Validator::new(limits).validate("sample.fq.gz", &encoded),
            Err(IntakeError::TooLarge { limit: 8 })
        ));
    }
}
