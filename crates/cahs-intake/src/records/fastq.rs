//! FASTQ parser

use super::{first_invalid, trim_blank, RecordParser, SequenceRecord};
use crate::error::IntakeError;
use crate::kind::RecordFormat;
use bio::io::fastq;

/// FASTQ record parser
///
/// Records are the four-line form. Sequence and quality must have equal
/// length, bases are letters or `.`, and qualities are printable
/// Phred+33 characters.
#[derive(Debug, Clone, Copy, Default)]
pub struct FastqParser;

impl RecordParser for FastqParser {
    fn format(&self) -> RecordFormat {
        RecordFormat::Fastq
    }

    fn parse(&self, filename: &str, bytes: &[u8]) -> Result<Vec<SequenceRecord>, IntakeError> {
        let mut records = Vec::new();

        for (idx, result) in fastq::Reader::new(trim_blank(bytes)).records().enumerate() {
            let index = idx + 1;
            let record = result.map_err(|e| IntakeError::parse(filename, index, e.to_string()))?;
            record
                .check()
                .map_err(|msg| IntakeError::parse(filename, index, msg))?;

            if let Some(bad) = first_invalid(record.seq(), |b| b.is_ascii_alphabetic() || b == b'.') {
                return Err(IntakeError::parse(filename, index, format!("invalid base {bad:?}")));
            }
            if let Some(bad) = first_invalid(record.qual(), |b| (b'!'..=b'~').contains(&b)) {
                return Err(IntakeError::parse(
                    filename,
                    index,
                    format!("invalid quality character {bad:?}"),
                ));
            }

            records.push(SequenceRecord {
                id: record.id().to_string(),
                length: record.seq().len(),
            });
        }

        Ok(records)
    }
}
