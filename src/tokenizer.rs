//! Source tokenizers.
//!
//! Models either ship a HuggingFace `tokenizer.json` (the RoBERTa BPE vocabularies the
//! detection models were trained with) or use the built-in [`BasicTokenizer`], a
//! code-aware splitter with a hashed vocabulary.

use crate::config::TokenizerConfig;
use anyhow::{anyhow, bail, Context, Result};
use std::path::Path;
use std::sync::Arc;

/// One token with the byte span it covers in the source text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenSpan {
    pub id: u32,
    pub start: usize,
    pub end: usize,
}

/// Special token ids a model input is framed with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub bos: Option<u32>,
    pub eos: Option<u32>,
    pub pad: u32,
}

impl SpecialTokens {
    /// Number of framing tokens added around the source tokens
    pub fn framing_len(&self) -> usize {
        usize::from(self.bos.is_some()) + usize::from(self.eos.is_some())
    }
}

/// Converts source text to token ids and back
pub trait SourceTokenizer: Send + Sync {
    /// Tokenize without special tokens, truncation or padding
    fn encode(&self, text: &str) -> Result<Vec<TokenSpan>>;

    /// Turn generated ids back into text, skipping special tokens
    fn decode(&self, ids: &[u32]) -> Result<String>;

    fn special_tokens(&self) -> SpecialTokens;
}

/// Build the tokenizer described by a model's configuration
pub fn build_tokenizer(config: &TokenizerConfig) -> Result<Arc<dyn SourceTokenizer>> {
    match config {
        TokenizerConfig::Huggingface {
            path,
            bos_token,
            eos_token,
            pad_token,
        } => Ok(Arc::new(HfTokenizer::from_file(
            path,
            bos_token.as_deref(),
            eos_token.as_deref(),
            pad_token,
        )?)),
        TokenizerConfig::Basic { vocab_size } => Ok(Arc::new(BasicTokenizer::new(*vocab_size)?)),
    }
}

/// Wrapper around a HuggingFace `tokenizers` tokenizer
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    specials: SpecialTokens,
}

impl HfTokenizer {
    /// Load `tokenizer.json` and resolve the framing tokens by name
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        bos_token: Option<&str>,
        eos_token: Option<&str>,
        pad_token: &str,
    ) -> Result<Self> {
        let path = path.as_ref();
        let mut inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| anyhow!("Failed to load tokenizer from {}: {}", path.display(), e))?;

        // Length limits are enforced by the preprocessor, not silently by the tokenizer.
        inner
            .with_truncation(None)
            .map_err(|e| anyhow!("Failed to disable truncation: {}", e))?;
        inner.with_padding(None);

        let lookup = |token: &str| {
            inner
                .token_to_id(token)
                .with_context(|| format!("token {token:?} missing from {}", path.display()))
        };

        let specials = SpecialTokens {
            bos: bos_token.map(lookup).transpose()?,
            eos: eos_token.map(lookup).transpose()?,
            pad: lookup(pad_token)?,
        };

        Ok(Self { inner, specials })
    }
}

impl SourceTokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<TokenSpan>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| anyhow!("Tokenization failed: {}", e))?;

        Ok(encoding
            .get_ids()
            .iter()
            .zip(encoding.get_offsets())
            .map(|(&id, &(start, end))| TokenSpan { id, start, end })
            .collect())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| anyhow!("Detokenization failed: {}", e))
    }

    fn special_tokens(&self) -> SpecialTokens {
        self.specials
    }
}

/// Code-aware tokenizer with a stable hashed vocabulary.
///
/// Identifier and number runs become one token, every other non-whitespace character
/// is its own token, whitespace is dropped. Ids 0..=3 are reserved for `<s>`, `<pad>`,
/// `</s>` and `<unk>`, matching the RoBERTa layout.
#[derive(Debug, Clone)]
pub struct BasicTokenizer {
    vocab_size: u32,
}

const BASIC_BOS: u32 = 0;
const BASIC_PAD: u32 = 1;
const BASIC_EOS: u32 = 2;
const BASIC_RESERVED: u32 = 4;

impl BasicTokenizer {
    pub fn new(vocab_size: u32) -> Result<Self> {
        if vocab_size <= BASIC_RESERVED {
            bail!("basic tokenizer vocab_size must exceed {BASIC_RESERVED}, got {vocab_size}");
        }
        Ok(Self { vocab_size })
    }

    /// Id assigned to a single piece of text
    pub fn piece_id(&self, piece: &str) -> u32 {
        BASIC_RESERVED + (fnv1a(piece.as_bytes()) % u64::from(self.vocab_size - BASIC_RESERVED)) as u32
    }
}

impl SourceTokenizer for BasicTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<TokenSpan>> {
        let mut tokens = Vec::new();
        let mut chars = text.char_indices().peekable();

        while let Some((start, c)) = chars.next() {
            if c.is_whitespace() {
                continue;
            }
            let mut end = start + c.len_utf8();
            if is_word_char(c) {
                while let Some(&(idx, next)) = chars.peek() {
                    if !is_word_char(next) {
                        break;
                    }
                    end = idx + next.len_utf8();
                    chars.next();
                }
            }
            tokens.push(TokenSpan {
                id: self.piece_id(&text[start..end]),
                start,
                end,
            });
        }

        Ok(tokens)
    }

    fn decode(&self, _ids: &[u32]) -> Result<String> {
        bail!("basic tokenizer ids are hashed and cannot be decoded")
    }

    fn special_tokens(&self) -> SpecialTokens {
        SpecialTokens {
            bos: Some(BASIC_BOS),
            eos: Some(BASIC_EOS),
            pad: BASIC_PAD,
        }
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, &b| (hash ^ u64::from(b)).wrapping_mul(PRIME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_splits_identifiers_and_punctuation() {
        let tokenizer = BasicTokenizer::new(1000).unwrap();
        let code = "strcpy(buf, input);";
        let tokens = tokenizer.encode(code).unwrap();

        let pieces: Vec<&str> = tokens.iter().map(|t| &code[t.start..t.end]).collect();
        assert_eq!(pieces, vec!["strcpy", "(", "buf", ",", "input", ")", ";"]);
    }

    #[test]
    fn test_basic_ids_are_stable_and_in_range() {
        let tokenizer = BasicTokenizer::new(1000).unwrap();
        let a = tokenizer.encode("memcpy memcpy").unwrap();

        assert_eq!(a[0].id, a[1].id);
        assert_eq!(a[0].id, tokenizer.piece_id("memcpy"));
        assert!(a.iter().all(|t| t.id >= BASIC_RESERVED && t.id < 1000));
    }

    #[test]
    fn test_basic_offsets_cover_multibyte_text() {
        let tokenizer = BasicTokenizer::new(1000).unwrap();
        let code = "é = \"ü\";\nx";
        let tokens = tokenizer.encode(code).unwrap();

        for token in &tokens {
            assert!(code.get(token.start..token.end).is_some());
        }
        assert_eq!(&code[tokens.last().unwrap().start..], "x");
    }

    #[test]
    fn test_basic_rejects_tiny_vocab() {
        assert!(BasicTokenizer::new(4).is_err());
        assert!(BasicTokenizer::new(0).unwrap_err().to_string().contains("vocab_size"));
    }

    #[test]
    fn test_basic_cannot_decode() {
        let tokenizer = BasicTokenizer::new(100).unwrap();
        assert!(tokenizer.decode(&[5, 6]).is_err());
        assert_eq!(tokenizer.special_tokens().framing_len(), 2);
    }
}
