// Tokenizer wrapper for sequence classification
//
// Wraps `tokenizers::Tokenizer` with the pieces classification needs: a pad
// token (decoder-only tokenizers often ship without one), truncation to a
// fixed length, and optional EOS appending.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use tokenizers::Tokenizer;

use crate::errors::ClassifyError;

/// EOS spellings probed when tokenizer_config.json does not name one
const EOS_CANDIDATES: &[&str] = &["</s>", "<|end_of_text|>", "<|eot_id|>", "<|endoftext|>", "<eos>"];

#[derive(Debug, Default, Deserialize)]
struct TokenizerConfigFile {
    #[serde(default)]
    eos_token: Option<SpecialToken>,
    #[serde(default)]
    pad_token: Option<SpecialToken>,
}

/// HF writes special tokens either as a bare string or as an AddedToken object
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SpecialToken {
    Plain(String),
    Added { content: String },
}

impl SpecialToken {
    fn content(&self) -> &str {
        match self {
            Self::Plain(s) => s,
            Self::Added { content } => content,
        }
    }
}

/// Text tokenizer used by the classifier
#[derive(Debug, Clone)]
pub struct TextTokenizer {
    inner: Tokenizer,
    eos_token_id: u32,
    pad_token: String,
    pad_token_id: u32,
    max_length: usize,
    add_eos_token: bool,
}

impl TextTokenizer {
    /// Load `tokenizer.json` (and `tokenizer_config.json` when present) from a model directory
    pub fn from_dir(model_dir: &Path, add_eos_token: bool, max_length: usize) -> Result<Self> {
        let tokenizer_path = model_dir.join("tokenizer.json");
        if !tokenizer_path.exists() {
            return Err(ClassifyError::MissingModelFile(tokenizer_path).into());
        }
        let inner = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
            ClassifyError::Tokenizer(format!("Failed to load {:?}: {}", tokenizer_path, e))
        })?;

        let config_path = model_dir.join("tokenizer_config.json");
        let file_config = if config_path.exists() {
            let raw = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {:?}", config_path))?;
            serde_json::from_str(&raw).with_context(|| format!("Failed to parse {:?}", config_path))?
        } else {
            TokenizerConfigFile::default()
        };

        let eos = file_config.eos_token.as_ref().map(|t| t.content().to_string());
        let pad = file_config.pad_token.as_ref().map(|t| t.content().to_string());

        Ok(Self::new(inner, eos.as_deref(), pad.as_deref(), add_eos_token, max_length)?)
    }

    /// Build from an in-memory tokenizer.
    ///
    /// Without a usable pad token the EOS token doubles as padding.
    pub fn new(
        inner: Tokenizer,
        eos_token: Option<&str>,
        pad_token: Option<&str>,
        add_eos_token: bool,
        max_length: usize,
    ) -> Result<Self, ClassifyError> {
        let eos_token = eos_token
            .filter(|t| inner.token_to_id(t).is_some())
            .or_else(|| {
                EOS_CANDIDATES
                    .iter()
                    .copied()
                    .find(|t| inner.token_to_id(t).is_some())
            })
            .ok_or_else(|| ClassifyError::Tokenizer("tokenizer has no EOS token".to_string()))?
            .to_string();
        let eos_token_id = inner
            .token_to_id(&eos_token)
            .ok_or_else(|| ClassifyError::Tokenizer(format!("unknown EOS token {}", eos_token)))?;

        let existing_pad = pad_token
            .map(str::to_string)
            .or_else(|| inner.get_padding().map(|p| p.pad_token.clone()))
            .and_then(|t| inner.token_to_id(&t).map(|id| (t, id)));

        let (pad_token, pad_token_id) = match existing_pad {
            Some(pad) => pad,
            None => {
                tracing::info!(eos = %eos_token, "Tokenizer has no pad token, using EOS for padding");
                (eos_token.clone(), eos_token_id)
            }
        };

        Ok(Self {
            inner,
            eos_token_id,
            pad_token,
            pad_token_id,
            max_length,
            add_eos_token,
        })
    }

    /// Token ids for `text`: special tokens added, truncated, never padded
    pub fn encode(&self, text: &str) -> Result<Vec<u32>, ClassifyError> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| ClassifyError::Tokenizer(format!("Tokenization failed: {}", e)))?;
        let mut ids = encoding.get_ids().to_vec();

        if self.add_eos_token && ids.last() != Some(&self.eos_token_id) {
            ids.push(self.eos_token_id);
        }

        if ids.len() > self.max_length {
            ids.truncate(self.max_length);
            // Truncation keeps the trailing EOS
            if self.add_eos_token {
                if let Some(last) = ids.last_mut() {
                    *last = self.eos_token_id;
                }
            }
        }

        // Blank input without a BOS still needs one position to pool
        if ids.is_empty() {
            tracing::debug!("Input produced no tokens, encoding as EOS");
            ids.push(self.eos_token_id);
        }

        Ok(ids)
    }

    pub fn pad_token(&self) -> &str {
        &self.pad_token
    }

    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    pub fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::str::FromStr;

    /// Word-level tokenizer over a tiny vocabulary, split on whitespace
    pub(crate) fn word_tokenizer() -> Tokenizer {
        let json = r#"{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": { "type": "Whitespace" },
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": { "<unk>": 0, "<s>": 1, "</s>": 2, "good": 3, "bad": 4, "movie": 5, "very": 6 },
                "unk_token": "<unk>"
            }
        }"#;
        Tokenizer::from_str(json).unwrap()
    }

    #[test]
    fn test_missing_pad_token_falls_back_to_eos() {
        let tokenizer = TextTokenizer::new(word_tokenizer(), None, None, false, 16).unwrap();
        assert_eq!(tokenizer.eos_token_id(), 2);
        assert_eq!(tokenizer.pad_token_id(), 2);
        assert_eq!(tokenizer.pad_token(), "</s>");
    }

    #[test]
    fn test_explicit_pad_token_is_kept() {
        let tokenizer = TextTokenizer::new(word_tokenizer(), Some("</s>"), Some("<unk>"), false, 16).unwrap();
        assert_eq!(tokenizer.pad_token_id(), 0);
    }

    #[test]
    fn test_encode_truncates_without_padding() {
        let tokenizer = TextTokenizer::new(word_tokenizer(), None, None, false, 3).unwrap();
        assert_eq!(tokenizer.encode("very good movie").unwrap(), vec![6, 3, 5]);
        assert_eq!(tokenizer.encode("very very good movie").unwrap(), vec![6, 6, 3]);
        assert_eq!(tokenizer.encode("bad").unwrap(), vec![4]);
    }

    #[test]
    fn test_add_eos_survives_truncation() {
        let tokenizer = TextTokenizer::new(word_tokenizer(), None, None, true, 3).unwrap();
        assert_eq!(tokenizer.encode("bad movie").unwrap(), vec![4, 5, 2]);
        assert_eq!(tokenizer.encode("very very good movie").unwrap(), vec![6, 6, 2]);
    }

    #[test]
    fn test_blank_input_encodes_as_eos() {
        let tokenizer = TextTokenizer::new(word_tokenizer(), None, None, false, 8).unwrap();
        assert_eq!(tokenizer.encode("").unwrap(), vec![2]);
        assert_eq!(tokenizer.encode("   ").unwrap(), vec![2]);

        let with_eos = TextTokenizer::new(word_tokenizer(), None, None, true, 8).unwrap();
        assert_eq!(with_eos.encode("").unwrap(), vec![2]);
    }

    #[test]
    fn test_from_dir_reads_tokenizer_config() {
        let dir = tempfile::tempdir().unwrap();
        word_tokenizer().save(dir.path().join("tokenizer.json"), false).unwrap();
        std::fs::write(
            dir.path().join("tokenizer_config.json"),
            r#"{ "eos_token": { "content": "</s>" }, "pad_token": null }"#,
        )
        .unwrap();

        let tokenizer = TextTokenizer::from_dir(dir.path(), false, 8).unwrap();
        assert_eq!(tokenizer.eos_token_id(), 2);
        assert_eq!(tokenizer.pad_token_id(), 2);
    }

    #[test]
    fn test_from_dir_without_tokenizer_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(TextTokenizer::from_dir(dir.path(), false, 8).is_err());
    }
}
