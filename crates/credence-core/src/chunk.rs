//! Token-budget text chunker.
//!
//! Splits document body text into [`Chunk`]s of at most `budget` tokens,
//! counted with the same [`TokenCodec`] the embedding model uses, so that
//! every chunk fits the model's input limit.
//!
//! # Algorithm
//!
//! 1. If the body is empty, emit a single chunk containing the title.
//! 2. Encode the body into token ids.
//! 3. If the token count is within `budget`, emit the body unchanged.
//! 4. Otherwise cut the id sequence into contiguous, non-overlapping
//!    windows of `budget` ids (the last may be shorter) and decode each
//!    window back to text.
//!
//! Decoding is an approximate round-trip: the concatenated chunk texts
//! encode to the same number of tokens as the original, but may differ
//! byte-for-byte where the codec normalizes text.
//!
//! # Example
//!
//! ```rust
//! use credence_core::chunk::{chunk_text, ByteCodec};
//!
//! let chunks = chunk_text("doc-1", "Title", "abcdefghij", 4, &ByteCodec).unwrap();
//! let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
//! assert_eq!(texts, ["abcd", "efgh", "ij"]);
//! ```

use crate::error::{Error, Result};
use crate::models::Chunk;

/// A versioned tokenization scheme.
///
/// Implementations must be the scheme of the embedding model in use so
/// that token counts are meaningful for truncation limits.
pub trait TokenCodec: Send + Sync {
    /// Identifier of the scheme (e.g. a tokenizer file name).
    fn name(&self) -> &str;
    /// Encode text into an ordered sequence of token ids.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    /// Decode a window of token ids back into text.
    fn decode(&self, tokens: &[u32]) -> Result<String>;
}

/// Byte-level codec: every UTF-8 byte is one token.
///
/// Exact for ASCII and lossless on whole sequences; a window that cuts a
/// multi-byte character decodes the partial bytes as `U+FFFD`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteCodec;

impl TokenCodec for ByteCodec {
    fn name(&self) -> &str {
        "bytes"
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        let bytes = tokens
            .iter()
            .map(|&t| {
                u8::try_from(t).map_err(|_| {
                    Error::Configuration(format!("token id {} is outside the byte codec range", t))
                })
            })
            .collect::<Result<Vec<u8>>>()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Split a document into chunks of at most `budget` tokens.
///
/// # Guarantees
///
/// - At least one chunk is always returned.
/// - Chunk indices are contiguous: `0, 1, 2, …, N-1`.
/// - Every chunk except possibly the last holds exactly `budget` tokens.
/// - No token is dropped and windows never overlap.
///
/// # Errors
///
/// [`Error::InvalidArgument`] for a zero budget, and
/// [`Error::Configuration`] when the codec cannot encode or decode.
pub fn chunk_text(
    document_id: &str,
    title: &str,
    text: &str,
    budget: usize,
    codec: &dyn TokenCodec,
) -> Result<Vec<Chunk>> {
    if budget == 0 {
        return Err(Error::InvalidArgument("chunk budget must be > 0".into()));
    }

    if text.is_empty() {
        let token_count = codec.encode(title)?.len();
        return Ok(vec![make_chunk(document_id, 0, title.to_string(), token_count)]);
    }

    let tokens = codec.encode(text)?;
    if tokens.len() <= budget {
        return Ok(vec![make_chunk(document_id, 0, text.to_string(), tokens.len())]);
    }

    tokens
        .chunks(budget)
        .enumerate()
        .map(|(i, window)| {
            let piece = codec.decode(window)?;
            Ok(make_chunk(document_id, i as i64, piece, window.len()))
        })
        .collect()
}

fn make_chunk(document_id: &str, index: i64, text: String, token_count: usize) -> Chunk {
    Chunk {
        document_id: document_id.to_string(),
        chunk_index: index,
        text,
        token_count,
    }
}
