//! CAHS Intake - upload decoding and validation
//!
//! Turns an encoded client upload into bytes that are safe to stage in a
//! session workspace:
//! - Decodes the `data:<mime>;base64,` transport form
//! - Classifies the filename into Reference / Alignment / ReadSet
//! - Decompresses `.gz` uploads within a size bound
//! - Validates FASTA / FASTQ record structure
//!
//! # Example
//!
//! ```rust
//! use cahs_intake::{encode_payload, FileKind, Validator};
//!
//! let encoded = encode_payload("text/plain", b"@r1\nACGT\n+\nIIII\n");
//! let upload = Validator::default().validate("sample.fastq", &encoded).unwrap();
//! assert_eq!(upload.kind, FileKind::ReadSet);
//! assert_eq!(upload.record_count, Some(1));
//! ```

#![warn(unreachable_pub)]

pub mod error;
pub mod kind;
pub mod payload;
pub mod records;
pub mod validator;

pub use error::IntakeError;
pub use kind::{classify, Classification, Compression, FileKind, RecordFormat};
pub use payload::{decode_payload, encode_payload, gunzip, DecodedPayload};
pub use records::{parser_for, FastaParser, FastqParser, RecordParser, SequenceRecord};
pub use validator::{IntakeLimits, ValidatedUpload, Validator};
