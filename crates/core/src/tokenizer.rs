use std::path::Path;
use tokenizers::Tokenizer;

/// Thin wrapper over a HuggingFace `tokenizer.json`.
pub struct TokenizerWrapper {
    inner: Tokenizer,
}

impl TokenizerWrapper {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let inner =
            Tokenizer::from_file(path).map_err(|e| anyhow::anyhow!("tokenizer load: {e}"))?;
        Ok(Self { inner })
    }

    pub fn from_tokenizer(inner: Tokenizer) -> Self {
        Self { inner }
    }

    /// Encode without special tokens; callers append EOS themselves.
    pub fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("encode: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Encode, truncate to `max_len - 1` and append `eos_token_id`.
    pub fn encode_with_eos(
        &self,
        text: &str,
        max_len: usize,
        eos_token_id: u32,
    ) -> anyhow::Result<Vec<u32>> {
        let mut ids = self.encode(text)?;
        ids.truncate(max_len.saturating_sub(1));
        ids.push(eos_token_id);
        Ok(ids)
    }

    pub fn decode(&self, ids: &[u32]) -> anyhow::Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| anyhow::anyhow!("decode: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokenizers::models::wordlevel::WordLevel;
    use tokenizers::pre_tokenizers::whitespace::Whitespace;

    fn word_tokenizer() -> TokenizerWrapper {
        let vocab: HashMap<String, u32> = ["<pad>", "</s>", "<unk>", "hello", "world"]
            .iter()
            .enumerate()
            .map(|(i, w)| (w.to_string(), i as u32))
            .collect();
        let model = WordLevel::builder()
            .vocab(vocab.into_iter().collect())
            .unk_token("<unk>".into())
            .build()
            .unwrap();
        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(Whitespace {}));
        TokenizerWrapper::from_tokenizer(tokenizer)
    }

    #[test]
    fn encode_appends_eos_and_truncates() {
        let tok = word_tokenizer();
        assert_eq!(tok.encode("hello world").unwrap(), vec![3, 4]);
        assert_eq!(tok.encode_with_eos("hello world", 8, 1).unwrap(), vec![3, 4, 1]);
        assert_eq!(tok.encode_with_eos("hello world hello", 2, 1).unwrap(), vec![3, 1]);
    }

    #[test]
    fn missing_file_is_error() {
        assert!(TokenizerWrapper::from_file(Path::new("/nonexistent/tokenizer.json")).is_err());
    }
}
