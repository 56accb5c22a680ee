//! Extension-to-kind table
//!
//! Maps an uploaded filename onto one of the three logical input kinds.
//! A trailing `.gz` is stripped first and recorded as [`Compression::Gzip`];
//! the remaining extension decides the kind. Matching is case-insensitive.

use crate::error::IntakeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Logical kind of an uploaded input file
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    /// Reference genome (FASTA)
    Reference,
    /// Aligned reads (BAM)
    Alignment,
    /// Raw reads (FASTQ)
    #[serde(rename = "reads")]
    ReadSet,
}

impl FileKind {
    /// All kinds in table order
    pub const ALL: [FileKind; 3] = [FileKind::Reference, FileKind::Alignment, FileKind::ReadSet];

    /// Fixed name the file is stored under inside a workspace
    #[inline]
    #[must_use]
    pub fn stored_name(self) -> &'static str {
        match self {
            FileKind::Reference => "reference.fasta",
            FileKind::Alignment => "alignment.bam",
            FileKind::ReadSet => "reads.fastq",
        }
    }

    /// Raw extensions accepted for this kind (lowercase, without dot)
    #[inline]
    #[must_use]
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            FileKind::Reference => &["fasta", "fa", "fna", "fas"],
            FileKind::Alignment => &["bam"],
            FileKind::ReadSet => &["fastq", "fq"],
        }
    }

    /// Record format requiring structural validation, if any
    #[inline]
    #[must_use]
    pub fn record_format(self) -> Option<RecordFormat> {
        match self {
            FileKind::Reference => Some(RecordFormat::Fasta),
            FileKind::Alignment => None,
            FileKind::ReadSet => Some(RecordFormat::Fastq),
        }
    }

    /// Configuration name used in engine argument placeholders
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::Reference => "reference",
            FileKind::Alignment => "alignment",
            FileKind::ReadSet => "reads",
        }
    }

    /// Look up the kind owning a raw extension
    #[must_use]
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.extensions().contains(&ext.as_str()))
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileKind {
    type Err = IntakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| IntakeError::UnsupportedFormat {
                filename: s.to_string(),
            })
    }
}

/// Structured text formats validated record by record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordFormat {
    /// `>`-headed sequence records
    Fasta,
    /// Four-part `@` / sequence / `+` / quality records
    Fastq,
}

/// Compression wrapper detected from the filename
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Compression {
    /// Stored as-is
    #[default]
    None,
    /// gzip stream (`.gz`)
    Gzip,
}

/// Result of classifying a filename
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// Logical kind
    pub kind: FileKind,
    /// Compression wrapper to undo before validation
    pub compression: Compression,
}

/// Classify a filename by its extension chain
///
/// # Errors
/// `UnsupportedFormat` when the (inner) extension is not in the table.
pub fn classify(filename: &str) -> Result<Classification, IntakeError> {
    let unsupported = || IntakeError::UnsupportedFormat {
        filename: filename.to_string(),
    };

    // Only the final path component is meaningful
    let name = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename);

    let (stem, compression) = match split_extension(name) {
        Some((stem, ext)) if ext.eq_ignore_ascii_case("gz") => (stem, Compression::Gzip),
        Some(_) => (name, Compression::None),
        None => return Err(unsupported()),
    };

    let (_, ext) = split_extension(stem).ok_or_else(unsupported)?;
    let kind = FileKind::from_extension(ext).ok_or_else(unsupported)?;

    Ok(Classification { kind, compression })
}

/// Split `name` at its last dot, rejecting empty stems and extensions
fn split_extension(name: &str) -> Option<(&str, &str)> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some((stem, ext))
}
