//! Upload transport decoding
//!
//! Uploads arrive as a single text string of the form
//! `data:<mime>;base64,<body>`. The mime part may be empty (browsers send
//! `data:;base64,` for unknown types). Decompression of `.gz` uploads is
//! bounded so a small payload cannot expand without limit.

use crate::error::IntakeError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::MultiGzDecoder;
use std::io::Read;

const SCHEME: &str = "data:";
const BASE64_TAG: &str = ";base64";

/// Decoded upload payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPayload {
    /// MIME type declared by the client (may be empty)
    pub mime_type: String,
    /// Raw decoded bytes
    pub bytes: Vec<u8>,
}

/// Decode a `data:` transport string
///
/// # Errors
/// - `Decode` if the delimiter, scheme or base64 tag is missing, or the body
///   is not valid base64
/// - `TooLarge` if the decoded body would exceed `max_bytes`
pub fn decode_payload(encoded: &str, max_bytes: u64) -> Result<DecodedPayload, IntakeError> {
    let (header, body) = encoded
        .split_once(',')
        .ok_or_else(|| IntakeError::decode("missing ',' delimiter between header and body"))?;

    let header = header
        .strip_prefix(SCHEME)
        .ok_or_else(|| IntakeError::decode("header does not start with 'data:'"))?;
    let mime_type = header
        .strip_suffix(BASE64_TAG)
        .ok_or_else(|| IntakeError::decode("header is missing the ';base64' tag"))?;

    let body = body.trim();
    // base64 expands 3 bytes into 4 characters
    let estimated = (body.len() as u64 / 4) * 3;
    if estimated > max_bytes {
        return Err(IntakeError::TooLarge { limit: max_bytes });
    }

    let bytes = STANDARD
        .decode(body)
        .map_err(|e| IntakeError::decode(format!("invalid base64 body: {e}")))?;

    Ok(DecodedPayload {
        mime_type: mime_type.to_string(),
        bytes,
    })
}

/// Encode bytes into the transport form accepted by [`decode_payload`]
#[must_use]
pub fn encode_payload(mime_type: &str, bytes: &[u8]) -> String {
    format!("{SCHEME}{mime_type}{BASE64_TAG},{}", STANDARD.encode(bytes))
}

/// Gunzip `bytes`, refusing output larger than `max_bytes`
///
/// Concatenated gzip members (as written by `bgzip` and parallel
/// compressors) are decoded as one stream.
///
/// # Errors
/// - `Decode` if the stream is not valid gzip
/// - `TooLarge` if the decompressed size exceeds `max_bytes`
pub fn gunzip(bytes: &[u8], max_bytes: u64) -> Result<Vec<u8>, IntakeError> {
    let mut out = Vec::with_capacity(bytes.len().saturating_mul(4));
    let read = MultiGzDecoder::new(bytes)
        .take(max_bytes.saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| IntakeError::decode(format!("invalid gzip stream: {e}")))?;

    if read as u64 > max_bytes {
        return Err(IntakeError::TooLarge { limit: max_bytes });
    }
    Ok(out)
}
