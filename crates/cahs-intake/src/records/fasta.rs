//! FASTA parser

use super::{first_invalid, trim_blank, RecordParser, SequenceRecord};
use crate::error::IntakeError;
use crate::kind::RecordFormat;
use bio::io::fasta;

/// FASTA record parser
///
/// Every record needs a non-empty id. Residues may be letters plus the
/// gap/stop symbols `-`, `.` and `*`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FastaParser;

impl RecordParser for FastaParser {
    fn format(&self) -> RecordFormat {
        RecordFormat::Fasta
    }

    fn parse(&self, filename: &str, bytes: &[u8]) -> Result<Vec<SequenceRecord>, IntakeError> {
        let mut records = Vec::new();

        for (idx, result) in fasta::Reader::new(trim_blank(bytes)).records().enumerate() {
            let index = idx + 1;
            let record = result.map_err(|e| IntakeError::parse(filename, index, e.to_string()))?;
            record
                .check()
                .map_err(|msg| IntakeError::parse(filename, index, msg))?;

            if let Some(bad) = first_invalid(record.seq(), |b| {
                b.is_ascii_alphabetic() || matches!(b, b'-' | b'.' | b'*')
            }) {
                return Err(IntakeError::parse(
                    filename,
                    index,
                    format!("invalid residue {bad:?}"),
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

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_multi_line_records() {
        let text = b">chr1 first\nACGT\nAC\n>chr2\nNNNN\n";
        let records = FastaParser.parse("ref.fa", text).unwrap();
        assert_eq!(
            records,
            vec![
                SequenceRecord { id: "chr1".into(), length: 6 },
                SequenceRecord { id: "chr2".into(), length: 4 },
            ]
        );
    }

    #[test]
    fn empty_input_has_no_records() {
        assert!(FastaParser.parse("ref.fa", b"").unwrap().is_empty());
        assert!(FastaParser.parse("ref.fa", b"\n\n").unwrap().is_empty());
    }

    #[test]
    fn leading_blank_lines_are_tolerated() {
        let records = FastaParser.parse("ref.fa", b"\n\n>a\nAC\r\n").unwrap();
        assert_eq!(records, vec![SequenceRecord { id: "a".into(), length: 2 }]);
    }

    #[test]
    fn rejects_data_before_header() {
        let err = FastaParser.parse("ref.fa", b"ACGT\n>a\nAC\n").unwrap_err();
        assert!(matches!(err, IntakeError::Parse { record: 1, .. }));
    }

    #[test]
    fn rejects_invalid_residue_in_later_record() {
        let err = FastaParser.parse("ref.fa", b">a\nACGT\n>b\nAC1T\n").unwrap_err();
        assert!(matches!(err, IntakeError::Parse { record: 2, .. }));
    }

    #[test]
    fn rejects_missing_id() {
        let err = FastaParser.parse("ref.fa", b">\nACGT\n").unwrap_err();
        assert!(matches!(err, IntakeError::Parse { record: 1, .. }));
    }

    #[test]
    fn header_only_record_is_kept() {
        let records = FastaParser.parse("ref.fa", b">empty\n").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].length, 0);
    }
}
