//! Token codecs for the chunker.
//!
//! `chunking.tokenizer = "bytes"` selects the byte-level [`ByteCodec`];
//! any other value is a path to a Hugging Face `tokenizer.json`, which
//! should match the embedding model's tokenizer so that token budgets
//! mean the same thing on both sides.

use std::path::Path;
use std::sync::Arc;

use credence_core::chunk::{ByteCodec, TokenCodec};
use credence_core::{Error, Result};

use crate::config::ChunkingConfig;

/// [`TokenCodec`] backed by a `tokenizers::Tokenizer`.
pub struct HfTokenizer {
    name: String,
    inner: tokenizers::Tokenizer,
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            Error::Configuration(format!(
                "failed to load tokenizer {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self {
            name: path.display().to_string(),
            inner,
        })
    }
}

impl TokenCodec for HfTokenizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| Error::Configuration(format!("tokenizer {} failed to encode: {}", self.name, e)))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.inner
            .decode(tokens, false)
            .map_err(|e| Error::Configuration(format!("tokenizer {} failed to decode: {}", self.name, e)))
    }
}

/// Build the codec named by the chunking configuration.
///
/// A tokenizer that cannot be loaded is a fatal [`Error::Configuration`].
pub fn load_codec(config: &ChunkingConfig) -> Result<Arc<dyn TokenCodec>> {
    match config.tokenizer.as_str() {
        "bytes" => Ok(Arc::new(ByteCodec)),
        path => Ok(Arc::new(HfTokenizer::from_file(Path::new(path))?)),
    }
}
