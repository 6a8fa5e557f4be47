//! Value codec for cache entries.
//!
//! A stable, self-describing format: a one-byte version tag followed by
//! the JSON encoding of the OCR result. The tag lets a future version
//! change the payload encoding (e.g. to a binary format) without having
//! to guess at what existing rows contain.

use serde_json::Value;
use thiserror::Error;

const VERSION_JSON: u8 = 1;

/// Encode a value for storage in the `val` blob column.
pub fn encode(value: &Value) -> Result<Vec<u8>, CodecError> {
    let mut out = vec![VERSION_JSON];
    serde_json::to_writer(&mut out, value)?;
    Ok(out)
}

/// Decode a value previously produced by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<Value, CodecError> {
    match bytes.split_first() {
        Some((&VERSION_JSON, rest)) => Ok(serde_json::from_slice(rest)?),
        Some((&other, _)) => Err(CodecError::UnknownVersion(other)),
        None => Err(CodecError::Empty),
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("empty cache value")]
    Empty,
    #[error("unknown cache value codec version {0}")]
    UnknownVersion(u8),
    #[error("malformed cache value: {0}")]
    Json(#[from] serde_json::Error),
}
