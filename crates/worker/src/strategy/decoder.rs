//! Incremental detokenization
//!
//! Decoding one token id at a time breaks multi-token characters and drops
//! the spacing that depends on neighbouring tokens. `IncrementalDecoder`
//! re-decodes a short window instead and releases the new suffix only once it
//! ends on an alphanumeric character.

use tokenizers::Tokenizer;
use tokenrelay_common::{RelayError, Result};

pub struct IncrementalDecoder<'a> {
    tokenizer: &'a Tokenizer,
    tokens: Vec<u32>,
    prev_index: usize,
    current_index: usize,
}

impl<'a> IncrementalDecoder<'a> {
    pub fn new(tokenizer: &'a Tokenizer) -> Self {
        Self {
            tokenizer,
            tokens: Vec::new(),
            prev_index: 0,
            current_index: 0,
        }
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(|e| RelayError::tokenizer(format!("Failed to decode tokens: {}", e)))
    }

    /// Add a generated token; returns the text it completes, if any
    pub fn push(&mut self, token: u32) -> Result<Option<String>> {
        let prev_text = self.decode(&self.tokens[self.prev_index..self.current_index])?;
        self.tokens.push(token);
        let text = self.decode(&self.tokens[self.prev_index..])?;

        let at_boundary = text.chars().last().map_or(false, char::is_alphanumeric);
        if text.len() <= prev_text.len() || !at_boundary {
            return Ok(None);
        }

        match text.get(prev_text.len()..) {
            Some(fragment) => {
                let fragment = fragment.to_string();
                self.prev_index = self.current_index;
                self.current_index = self.tokens.len();
                Ok(Some(fragment))
            }
            None => Ok(None),
        }
    }

    /// Text held back from `push` that no later token will complete
    pub fn flush(&mut self) -> Result<Option<String>> {
        let prev_text = self.decode(&self.tokens[self.prev_index..self.current_index])?;
        let text = self.decode(&self.tokens[self.prev_index..])?;

        if text.len() <= prev_text.len() {
            return Ok(None);
        }

        let rest = text.get(prev_text.len()..).map(str::to_string);
        self.prev_index = self.current_index;
        self.current_index = self.tokens.len();
        Ok(rest)
    }

    /// Every token pushed so far
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }
}
