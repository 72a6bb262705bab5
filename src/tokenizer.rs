//! Tokenizer interface.
//!
//! [`HfTokenizer`] adapts a HuggingFace `tokenizer.json`; [`ByteTokenizer`]
//! maps UTF-8 bytes to ids 0..=255 and needs no files.

use std::path::Path;

use crate::error::{Error, Result};

/// Text to token ids and back.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode ids to text. Special tokens are skipped.
    fn decode(&self, token_ids: &[u32]) -> Result<String>;

    fn eos_token_id(&self) -> Option<u32>;

    fn pad_token_id(&self) -> Option<u32> {
        None
    }
}

/// A `tokenizers::Tokenizer` loaded from `tokenizer.json`.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    eos_token_id: Option<u32>,
    pad_token_id: Option<u32>,
}

impl HfTokenizer {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path.as_ref())
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        Ok(Self::new(inner))
    }

    pub fn new(inner: tokenizers::Tokenizer) -> Self {
        let eos_token_id = ["<|im_end|>", "<|endoftext|>", "</s>", "<eos>"]
            .iter()
            .find_map(|token| inner.token_to_id(token));
        let pad_token_id = inner
            .get_padding()
            .map(|padding| padding.pad_id)
            .or_else(|| inner.token_to_id("<pad>"));
        Self {
            inner,
            eos_token_id,
            pad_token_id,
        }
    }

    pub fn inner(&self) -> &tokenizers::Tokenizer {
        &self.inner
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, token_ids: &[u32]) -> Result<String> {
        self.inner
            .decode(token_ids, true)
            .map_err(|e| Error::Tokenization(e.to_string()))
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    fn pad_token_id(&self) -> Option<u32> {
        self.pad_token_id
    }
}

/// Byte-level tokenizer: one id per UTF-8 byte, eos = 256, pad = 257.
///
/// Decoding skips ids above 255 and replaces invalid UTF-8 with U+FFFD,
/// so a multi-byte character split across calls decodes as replacement
/// characters until all of its bytes are present.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub const EOS: u32 = 256;
    pub const PAD: u32 = 257;
    pub const VOCAB_SIZE: usize = 258;
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, token_ids: &[u32]) -> Result<String> {
        let bytes: Vec<u8> = token_ids
            .iter()
            .filter_map(|&id| u8::try_from(id).ok())
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn eos_token_id(&self) -> Option<u32> {
        Some(Self::EOS)
    }

    fn pad_token_id(&self) -> Option<u32> {
        Some(Self::PAD)
    }
}
