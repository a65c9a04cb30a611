//! Token counting for pricing and stream metering.

use tiktoken_rs::CoreBPE;

use crate::error::{Error, Result};
use crate::proxy::types::{Message, MessageContent};

/// Tokens charged for any non-text message part (images, audio).
pub const NON_TEXT_PART_TOKENS: usize = 100;

/// o200k tokenizer shared across requests.
pub struct TokenCounter {
    bpe: CoreBPE,
}

impl TokenCounter {
    pub fn new() -> Result<Self> {
        let bpe = tiktoken_rs::o200k_base()
            .map_err(|e| Error::Internal(format!("failed to load tokenizer: {e}")))?;
        Ok(Self { bpe })
    }

    pub fn count_text(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    pub fn count_content(&self, content: &MessageContent) -> usize {
        match content {
            MessageContent::Text(text) => self.count_text(text),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|part| match (part.kind.as_str(), &part.text) {
                    ("text", Some(text)) => self.count_text(text),
                    ("text", None) => 0,
                    _ => NON_TEXT_PART_TOKENS,
                })
                .sum(),
        }
    }

    /// Prompt tokens of a chat request: the sum over message contents.
    pub fn count_messages(&self, messages: &[Message]) -> usize {
        messages
            .iter()
            .filter_map(|m| m.content.as_ref())
            .map(|c| self.count_content(c))
            .sum()
    }
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenCounter(o200k_base)")
    }
}
