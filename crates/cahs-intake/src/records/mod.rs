//! Sequence record parsers
//!
//! Structural validation for the text-based input kinds:
//! - FASTA (reference sequences)
//! - FASTQ (sequencing reads)
//!
//! Records are read with the `bio` readers; parsers only check structure
//! and never interpret the biology.

use crate::error::IntakeError;
use crate::kind::RecordFormat;

mod fasta;
mod fastq;

pub use fasta::FastaParser;
pub use fastq::FastqParser;

/// Summary of one parsed record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRecord {
    /// Identifier (first whitespace-delimited token of the header)
    pub id: String,
    /// Number of residues
    pub length: usize,
}

/// Parser trait for record-structured text
pub trait RecordParser: Send + Sync {
    /// Format handled by this parser
    fn format(&self) -> RecordFormat;

    /// Parse `bytes` into record summaries
    ///
    /// `filename` is only used for error reporting.
    ///
    /// # Errors
    /// `Parse` when the structure is malformed or the text is not UTF-8.
    fn parse(&self, filename: &str, bytes: &[u8]) -> Result<Vec<SequenceRecord>, IntakeError>;
}

/// Parser registered for `format`
#[must_use]
pub fn parser_for(format: RecordFormat) -> &'static dyn RecordParser {
    match format {
        RecordFormat::Fasta => &FastaParser,
        RecordFormat::Fastq => &FastqParser,
    }
}

/// `bytes` without surrounding blank lines
///
/// The readers expect a header on the very first line.
fn trim_blank(bytes: &[u8]) -> &[u8] {
    let Some(start) = bytes.iter().position(|b| !b.is_ascii_whitespace()) else {
        return &[];
    };
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(bytes.len(), |i| i + 1);
    &bytes[start..end]
}

/// First byte of `seq` outside `allowed`, as a printable char
fn first_invalid(seq: &[u8], allowed: impl Fn(u8) -> bool) -> Option<char> {
    seq.iter().copied().find(|b| !allowed(*b)).map(char::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_matches_format() {
        assert_eq!(parser_for(RecordFormat::Fasta).format(), RecordFormat::Fasta);
        assert_eq!(parser_for(RecordFormat::Fastq).format(), RecordFormat::Fastq);
    }

    #[test]
    fn trim_blank_drops_surrounding_whitespace() {
        assert_eq!(trim_blank(b"\n\r\n>a\nAC\n\n"), b">a\nAC");
        assert!(trim_blank(b" \n\t\n").is_empty());
        assert!(trim_blank(b"").is_empty());
    }
}
